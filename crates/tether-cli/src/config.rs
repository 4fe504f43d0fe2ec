//! Client configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file given as the first command line argument
//! - `tether.toml`, `/etc/tether/tether.toml` or `~/.config/tether/tether.toml`
//! - Environment variables (TETHER_HOST, TETHER_PROTOCOL) for page defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tether_transport::{ConnectionConfig, StaticEnvironment, WebSocketConfig};

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Connection endpoint and reconnect settings.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Environment the connection pretends to run in.
    #[serde(default)]
    pub page: PageConfig,

    /// WebSocket transport settings.
    #[serde(default)]
    pub websocket: WebSocketSection,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Page defaults used when the connection config omits host or protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageConfig {
    /// Default host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Default protocol.
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Whether the native socket transport may be used.
    #[serde(default = "default_true")]
    pub native_socket: bool,
}

/// WebSocket transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketSection {
    /// Handshake timeout in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter.
    #[serde(default)]
    pub enabled: bool,

    /// Exporter port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("TETHER_HOST").unwrap_or_else(|_| "localhost".to_string())
}

fn default_protocol() -> String {
    std::env::var("TETHER_PROTOCOL").unwrap_or_else(|_| "http:".to_string())
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            page: PageConfig::default(),
            websocket: WebSocketSection::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            protocol: default_protocol(),
            native_socket: true,
        }
    }
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the default paths, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "tether.toml",
            "/etc/tether/tether.toml",
            "~/.config/tether/tether.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// The environment handed to the connection.
    #[must_use]
    pub fn environment(&self) -> StaticEnvironment {
        StaticEnvironment::native()
            .with_host(self.page.host.clone())
            .with_protocol(self.page.protocol.clone())
            .with_native_socket(self.page.native_socket)
    }

    /// WebSocket transport configuration.
    #[must_use]
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            connect_timeout: Duration::from_millis(self.websocket.connect_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_transport::{Endpoints, Environment};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.metrics.enabled);
        assert!(config.page.native_socket);
        assert_eq!(config.websocket.connect_timeout_ms, 10_000);
        assert_eq!(config.connection.base, "/channel");
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [connection]
            base = "/chan"
            srvHost = "example.com"
            timeoutIncrement = 250

            [page]
            host = "page.local"
            protocol = "https:"

            [metrics]
            enabled = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.timeout_increment, 250);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.port, 9090);

        let env = config.environment();
        assert_eq!(env.protocol(), "https:");
        let endpoints = Endpoints::derive(&config.connection, &env);
        assert_eq!(endpoints.primary, "wss://example.com/chan");
    }

    #[test]
    fn test_websocket_config() {
        let mut config = Config::default();
        config.websocket.connect_timeout_ms = 1500;
        assert_eq!(
            config.websocket_config().connect_timeout,
            Duration::from_millis(1500)
        );
    }
}
