//! # Configuration Management
//!
//! This module handles loading the console configuration from multiple sources:
//! - TOML configuration file (`lab-console.toml`)
//! - Environment variables (with the `LAB__` prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (`LAB__NETWORK__HOST`, `LAB__CONNECTION__RECONNECT_DELAY_MS`, ...)
//! 2. Configuration file (`lab-console.toml`)
//! 3. Default values (defined in the Default impl)
//!
//! The double-underscore separator keeps multi-word keys such as
//! `reconnect_delay_ms` addressable from the environment.
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: every section derives `Serialize` and `Deserialize`, so the same
//!   structs are read from TOML/env and printed back by `--print-config`
//! - **impl Default**: the built-in values, also the lowest config layer
//! - **Result<T, E>**: `load` and `validate` return `anyhow::Result` for `main`

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hosts that count as "served locally" when picking an endpoint.
const LOCAL_HOSTS: [&str; 2] = ["localhost", "127.0.0.1"];

/// Main console configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps to one component (connection, workspace, audio, routing),
/// so a component can be handed just the part it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub network: NetworkConfig,
    pub protocol: ProtocolConfig,
    pub connection: ConnectionConfig,
    pub workspace: WorkspaceConfig,
    pub audio: AudioConfig,
    pub routing: RoutingConfig,
}

/// Where the lab server lives.
///
/// ## Fields:
/// - `host`: the hostname the console is being served from (its network context)
/// - `local_url`: endpoint used when `host` is local
/// - `remote_url`: endpoint used everywhere else
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub host: String,
    pub local_url: String,
    pub remote_url: String,
}

/// Protocol version announced in the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub version: String,
}

/// Socket lifecycle tuning.
///
/// The reconnect delay is fixed: there is no growth and no retry limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub reconnect_delay_ms: u64,
}

/// Workspace autosave behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Quiet period after the last edit before an autosave is sent
    pub autosave_debounce_ms: u64,
    /// Name used when saving with no file open
    pub default_filename: String,
}

/// Microphone capture settings.
///
/// ## Fields:
/// - `sample_rate`: capture rate in Hz (the server expects 16000)
/// - `buffer_size`: samples per captured buffer; one buffer becomes one binary frame
/// - `level_gain`: multiplier applied to the RMS before display
/// - `level_ceiling`: display maximum the level saturates at, in (0, 1]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub buffer_size: usize,
    pub level_gain: f32,
    pub level_ceiling: f32,
}

impl WorkspaceConfig {
    /// Quiet period as a `Duration`, the form the debounce deadline uses.
    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }
}

/// Inputs to the brain-reply routing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Words that move a `system` reply from chat to the insight log
    pub insight_keywords: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                host: "localhost".to_string(),
                local_url: "ws://localhost:8765".to_string(),
                remote_url: "wss://acme.jason-lab.dev".to_string(),
            },
            protocol: ProtocolConfig {
                version: "3.4.0".to_string(),
            },
            connection: ConnectionConfig {
                reconnect_delay_ms: 5000,
            },
            workspace: WorkspaceConfig {
                autosave_debounce_ms: 1500,
                default_filename: "scratchpad.md".to_string(),
            },
            audio: AudioConfig {
                sample_rate: 16000,  // 4096 samples ≈ 256ms per frame
                buffer_size: 4096,
                level_gain: 1.0,
                level_ceiling: 1.0,
            },
            routing: RoutingConfig {
                insight_keywords: vec!["sovereign".to_string(), "strategic".to_string()],
            },
        }
    }
}

impl ClientConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from `lab-console.toml` (if it exists)
    /// 3. Override with environment variables prefixed with `LAB__`
    ///
    /// ## Environment Variable Examples:
    /// - `LAB__NETWORK__HOST=lab.example.org`: pick the remote endpoint
    /// - `LAB__WORKSPACE__AUTOSAVE_DEBOUNCE_MS=800`: shorter autosave window
    ///
    /// ## Rust Concepts:
    /// - **Builder pattern**: each `add_source` layers over the previous one
    /// - **?**: any failing step returns its error straight to the caller
    /// - **Config::try_from**: serializes the defaults into the first layer
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&ClientConfig::default())?)
            .add_source(config::File::with_name("lab-console").required(false))
            .add_source(
                config::Environment::with_prefix("LAB")
                    .prefix_separator("__")
                    .separator("__"),
            );

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Endpoints, protocol version and default filename are not empty
    /// - Timers are not zero (a zero reconnect delay would spin)
    /// - Audio buffers have a size and a rate
    /// - The level meter gain is positive and the ceiling sits in (0, 1]
    pub fn validate(&self) -> Result<()> {
        if self.network.local_url.trim().is_empty() || self.network.remote_url.trim().is_empty() {
            return Err(anyhow::anyhow!("Server endpoints cannot be empty"));
        }

        if self.protocol.version.trim().is_empty() {
            return Err(anyhow::anyhow!("Protocol version cannot be empty"));
        }

        if self.connection.reconnect_delay_ms == 0 {
            return Err(anyhow::anyhow!("Reconnect delay must be greater than 0"));
        }

        if self.workspace.autosave_debounce_ms == 0 {
            return Err(anyhow::anyhow!("Autosave debounce must be greater than 0"));
        }

        if self.workspace.default_filename.trim().is_empty() {
            return Err(anyhow::anyhow!("Default workspace filename cannot be empty"));
        }

        if self.audio.sample_rate == 0 || self.audio.buffer_size == 0 {
            return Err(anyhow::anyhow!("Audio sample rate and buffer size must be greater than 0"));
        }

        if !(self.audio.level_gain > 0.0) {
            return Err(anyhow::anyhow!("Level gain must be greater than 0"));
        }

        if !(self.audio.level_ceiling > 0.0 && self.audio.level_ceiling <= 1.0) {
            return Err(anyhow::anyhow!("Level ceiling must be in (0, 1]"));
        }

        Ok(())
    }

    /// Pick the endpoint for the current network context.
    ///
    /// Pure function of `network.host`: a local host talks to the local lab,
    /// anything else goes through the public tunnel.
    pub fn endpoint(&self) -> &str {
        select_endpoint(&self.network)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.connection.reconnect_delay_ms)
    }

    /// Render the effective configuration as TOML (for `--print-config`).
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Endpoint selection as a free function so it can be tested without a full config.
pub fn select_endpoint(network: &NetworkConfig) -> &str {
    let host = network.host.trim().to_ascii_lowercase();
    if LOCAL_HOSTS.contains(&host.as_str()) {
        &network.local_url
    } else {
        &network.remote_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.workspace.autosave_debounce(), Duration::from_millis(1500));
        assert_eq!(config.audio.buffer_size, 4096);
        assert_eq!(config.workspace.default_filename, "scratchpad.md");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ClientConfig::default();
        config.connection.reconnect_delay_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.audio.level_ceiling = 1.5;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.audio.level_gain = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_local_hosts_select_local_endpoint() {
        let mut config = ClientConfig::default();
        for host in ["localhost", "127.0.0.1", "LOCALHOST"] {
            config.network.host = host.to_string();
            assert_eq!(config.endpoint(), "ws://localhost:8765");
        }
    }

    #[test]
    fn test_other_hosts_select_remote_endpoint() {
        let mut config = ClientConfig::default();
        config.network.host = "notes.jason-lab.dev".to_string();
        assert_eq!(config.endpoint(), "wss://acme.jason-lab.dev");
    }

    #[test]
    fn test_toml_rendering_contains_sections() {
        let rendered = ClientConfig::default().to_toml().unwrap();
        assert!(rendered.contains("[network]"));
        assert!(rendered.contains("reconnect_delay_ms = 5000"));
    }
}
