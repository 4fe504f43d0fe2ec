//! Prometheus export of the `tether_*` metrics recorded by the connection.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{Ipv4Addr, SocketAddr};

/// Install the Prometheus recorder with its scrape endpoint on `port`, then
/// register the connection metric descriptions with it.
///
/// Returns the address the endpoint listens on.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or the listener
/// cannot be bound.
pub fn install_exporter(port: u16) -> Result<SocketAddr> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| format!("Failed to install Prometheus exporter on {}", addr))?;

    tether_transport::metrics::describe();
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exporter_installs_once() {
        let addr = install_exporter(0).unwrap();
        assert!(addr.ip().is_unspecified());

        let err = install_exporter(0).unwrap_err();
        assert!(err.to_string().contains("Failed to install Prometheus exporter"));
    }
}
