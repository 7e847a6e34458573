//! # Lab Console
//!
//! Client for the lab server: one websocket carrying JSON envelopes and raw
//! PCM audio, a router that decides which surface each server message lands
//! on, and a shared workspace document kept in sync without echo loops.
//!
//! ## Module Layout:
//! - **config**: layered configuration (defaults, TOML file, environment)
//! - **error**: client error types
//! - **protocol**: wire envelopes and inbound message classification
//! - **connection**: socket lifecycle, handshake, fixed-delay reconnect
//! - **router**: inbound message → destination routing policy
//! - **audio**: PCM encoding, level metering, capture sessions
//! - **workspace**: echo suppression and debounced autosave
//! - **surfaces**: traits for everything the console draws into
//! - **state**: shared traffic statistics
//! - **console**: the event loop tying it all together

pub mod audio;       // Microphone capture and PCM encoding
pub mod config;      // Configuration management (config.rs)
pub mod connection;  // Websocket lifecycle (connection.rs)
pub mod console;     // Event loop and handle (console.rs)
pub mod error;       // Error handling types (error.rs)
pub mod protocol;    // Wire format (protocol.rs)
pub mod router;      // Message routing (router.rs)
pub mod state;       // Shared statistics (state.rs)
pub mod surfaces;    // Render/editor/status collaborators (surfaces.rs)
pub mod workspace;   // Workspace document sync (workspace.rs)

pub use config::ClientConfig;
pub use console::{Command, ConsoleHandle, LabConsole};
pub use error::{ClientError, ClientResult};
