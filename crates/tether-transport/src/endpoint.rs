//! Endpoint URL derivation.
//!
//! Both endpoint URLs are derived once, when the connection is built. The
//! primary URL maps the page protocol onto `ws:`/`wss:`; the fallback URL
//! keeps the HTTP protocol as-is.

use crate::config::ConnectionConfig;
use crate::environment::{normalize_protocol, Environment};
use crate::traits::TransportKind;

/// The two candidate endpoints of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// URL for the primary (WebSocket) transport.
    pub primary: String,
    /// URL for the fallback (HTTP channel) transport.
    pub fallback: String,
}

impl Endpoints {
    /// Derive both endpoints from configuration, defaulting host and
    /// protocol from the environment.
    #[must_use]
    pub fn derive(config: &ConnectionConfig, env: &dyn Environment) -> Self {
        let host = config
            .srv_host
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| env.host());
        let protocol = config
            .srv_protocol
            .clone()
            .filter(|p| !p.is_empty())
            .map(normalize_protocol)
            .unwrap_or_else(|| env.protocol());

        Self {
            primary: primary_url(config, &host, &protocol),
            fallback: fallback_url(config, &host, &protocol),
        }
    }

    /// Get the URL for a transport kind.
    #[must_use]
    pub fn url(&self, kind: TransportKind) -> &str {
        match kind {
            TransportKind::Primary => &self.primary,
            TransportKind::Fallback => &self.fallback,
        }
    }
}

fn primary_url(config: &ConnectionConfig, host: &str, protocol: &str) -> String {
    let scheme = if protocol == "https:" { "wss:" } else { "ws:" };
    let port = match scheme {
        "ws:" => config.srv_port,
        _ => config.srv_secure_port,
    };
    build_url(scheme, host, port, &config.base)
}

fn fallback_url(config: &ConnectionConfig, host: &str, protocol: &str) -> String {
    let protocol = if protocol.is_empty() { "http:" } else { protocol };
    let port = match protocol {
        "http:" => config.srv_port,
        "wss:" => config.srv_secure_port,
        _ => None,
    };
    build_url(protocol, host, port, &config.base)
}

fn build_url(scheme: &str, host: &str, port: Option<u16>, base: &str) -> String {
    match port {
        Some(port) => format!("{}//{}:{}{}", scheme, host, port, base),
        None => format!("{}//{}{}", scheme, host, base),
    }
}
