//! Connection configuration.
//!
//! Configuration can be built in code or loaded from TOML. Keys are accepted
//! in camelCase (`srvHost`, `timeoutIncrement`, ...) as well as snake_case.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The config contents could not be parsed.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Endpoint and reconnect parameters of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Path prefix appended to both endpoint URLs.
    #[serde(default = "default_base")]
    pub base: String,

    /// Server protocol (`"http:"` / `"https:"`). Defaults to the page protocol.
    #[serde(default, alias = "srv_protocol")]
    pub srv_protocol: Option<String>,

    /// Server host. Defaults to the page host.
    #[serde(default, alias = "srv_host")]
    pub srv_host: Option<String>,

    /// Plain-text port.
    #[serde(default, alias = "srv_port")]
    pub srv_port: Option<u16>,

    /// TLS port.
    #[serde(default, alias = "srv_secure_port")]
    pub srv_secure_port: Option<u16>,

    /// Never try the primary transport.
    #[serde(default, alias = "browser_channel_only")]
    pub browser_channel_only: bool,

    /// Reconnect the primary transport after a broken connection.
    #[serde(default = "default_true")]
    pub reconnect: bool,

    /// Base reconnect delay in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Added to the delay once per consecutive reconnect attempt, in milliseconds.
    #[serde(default = "default_timeout_increment", alias = "timeout_increment")]
    pub timeout_increment: u64,
}

fn default_base() -> String {
    "/channel".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    1_000 // 1 second
}

fn default_timeout_increment() -> u64 {
    1_000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base: default_base(),
            srv_protocol: None,
            srv_host: None,
            srv_port: None,
            srv_secure_port: None,
            browser_channel_only: false,
            reconnect: true,
            timeout: default_timeout(),
            timeout_increment: default_timeout_increment(),
        }
    }
}

impl ConnectionConfig {
    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid TOML for this struct.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Base reconnect delay.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    /// Per-attempt delay increment.
    #[must_use]
    pub fn delay_increment(&self) -> Duration {
        Duration::from_millis(self.timeout_increment)
    }
}
