//! # Error Handling
//!
//! Error types for the lab console client. None of these errors is fatal to a
//! running console: transport failures end in a scheduled reconnect, capture
//! failures leave the microphone muted, and malformed server payloads are
//! dropped. The types exist so that each layer can say *what* went wrong and
//! the event loop can decide how to surface it.
//!
//! ## Error Categories:
//! - **Transport**: the socket could not be opened, or failed while open
//! - **CaptureDevice**: microphone permission refused or hardware failure
//! - **Protocol**: a payload could not be encoded or decoded
//! - **Config**: configuration file or environment variable problems
//! - **Internal**: anything else (channel closed, task join failure)
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Enums for Error Types
//! - **Variants**: one per category above, each carrying a message
//! - **kind()**: a `&'static str` label for log fields, picked with `match`
//!
//! ### Traits for Error Conversion
//! - **From trait**: lets `?` turn serde_json, config and tungstenite errors
//!   into a `ClientError` without a `map_err` at every call site
//! - **Display trait**: the text that ends up in chat and in logs

use std::fmt;

/// Custom error types for the client.
///
/// ## Usage Example:
/// ```rust
/// use lab_console::error::ClientError;
/// let err = ClientError::CaptureDevice("permission denied".to_string());
/// assert!(err.to_string().contains("permission denied"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    /// Socket open/read/write failures (always recovered by reconnect)
    Transport(String),

    /// Microphone denied or failed (capture stays inactive)
    CaptureDevice(String),

    /// Payload could not be serialized or parsed
    Protocol(String),

    /// Configuration file or environment variable problems
    Config(String),

    /// Unexpected internal failure
    Internal(String),
}

impl ClientError {
    /// Short machine-readable label, used as a tracing field.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::Transport(_) => "transport",
            ClientError::CaptureDevice(_) => "capture_device",
            ClientError::Protocol(_) => "protocol",
            ClientError::Config(_) => "config",
            ClientError::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Transport(msg) => write!(f, "Transport error: {}", msg),
            ClientError::CaptureDevice(msg) => write!(f, "Capture device error: {}", msg),
            ClientError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ClientError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ClientError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {}

/// Automatic conversion from anyhow::Error to ClientError.
///
/// Anything that reaches us as an opaque anyhow error is treated as internal.
impl From<anyhow::Error> for ClientError {
    fn from(err: anyhow::Error) -> Self {
        ClientError::Internal(err.to_string())
    }
}

/// JSON encode/decode failures are protocol errors.
impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Protocol(format!("JSON error: {}", err))
    }
}

impl From<config::ConfigError> for ClientError {
    fn from(err: config::ConfigError) -> Self {
        ClientError::Config(err.to_string())
    }
}

/// Every tungstenite failure is a transport failure from the console's point
/// of view, including protocol violations by the server.
impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_category_and_message() {
        let err = ClientError::Transport("connection refused".to_string());
        assert_eq!(err.to_string(), "Transport error: connection refused");
        assert_eq!(err.kind(), "transport");
    }

    #[test]
    fn test_json_errors_become_protocol_errors() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json");
        let err: ClientError = parse.unwrap_err().into();
        assert_eq!(err.kind(), "protocol");
    }

    #[test]
    fn test_anyhow_errors_become_internal() {
        let err: ClientError = anyhow::anyhow!("channel closed").into();
        assert_eq!(err, ClientError::Internal("channel closed".to_string()));
    }
}
