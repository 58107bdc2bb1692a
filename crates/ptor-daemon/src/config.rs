//! Relay daemon configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ptor_relay::{RelayConfig, DEFAULT_HIDDEN_ADDR};

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub hidden: HiddenSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[relay]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Idle seconds before a circuit state is swept.
    #[serde(default = "default_state_ttl")]
    pub state_ttl_secs: u64,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
}

/// `[hidden]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HiddenSection {
    /// Overridden by `PTOR_HIDDEN_ADDR`, then `HIDDEN_ADDR`.
    #[serde(default = "default_hidden_addr")]
    pub default_addr: String,
}

/// `[logging]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// "trace" | "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:7000".to_string()
}

fn default_state_ttl() -> u64 {
    600
}

fn default_dial_timeout() -> u64 {
    10
}

fn default_hidden_addr() -> String {
    DEFAULT_HIDDEN_ADDR.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            state_ttl_secs: default_state_ttl(),
            dial_timeout_secs: default_dial_timeout(),
        }
    }
}

impl Default for HiddenSection {
    fn default() -> Self {
        Self {
            default_addr: default_hidden_addr(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    /// Load from the default location, falling back to defaults if the file
    /// does not exist.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Settings handed to the relay server.
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            listen_addr: self.relay.listen_addr.clone(),
            state_ttl: Duration::from_secs(self.relay.state_ttl_secs),
            dial_timeout: Duration::from_secs(self.relay.dial_timeout_secs),
            hidden_default: self.hidden.default_addr.clone(),
        }
    }

    /// `$PTOR_CONFIG`, else `$PTOR_DATA_DIR/config.toml`, else
    /// `$HOME/.ptor/config.toml`.
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("PTOR_CONFIG") {
            return PathBuf::from(path);
        }
        Self::data_dir().join("config.toml")
    }

    fn data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("PTOR_DATA_DIR") {
            return PathBuf::from(dir);
        }
        std::env::var("HOME")
            .map(|h| PathBuf::from(h).join(".ptor"))
            .unwrap_or_else(|_| PathBuf::from("/tmp/ptor"))
    }
}
