//! # tether
//!
//! Command line client for the tether resilient transport.
//!
//! Every line read from stdin is sent over the connection (as JSON when it
//! parses, as a string otherwise); every inbound message is printed to
//! stdout as one JSON line.
//!
//! ## Usage
//!
//! ```bash
//! # Use tether.toml from the default search paths
//! tether
//!
//! # Use a specific config file
//! tether /path/to/tether.toml
//!
//! # Override page defaults with environment variables
//! TETHER_HOST=example.com TETHER_PROTOCOL=https: tether
//! ```

mod config;
mod metrics;

use anyhow::Result;
use serde_json::Value;
use tether_transport::{spawn, Connection, WebSocketFactory};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=debug,tether_transport=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    if config.metrics.enabled {
        match metrics::install_exporter(config.metrics.port) {
            Ok(addr) => info!(%addr, "Exporting metrics"),
            Err(e) => error!("Metrics disabled: {:#}", e),
        }
    }

    let env = config.environment();
    let factory = WebSocketFactory::new(config.websocket_config());
    let mut conn = Connection::new(config.connection.clone(), &env, factory);

    info!(
        primary = %conn.endpoints().primary,
        fallback = %conn.endpoints().fallback,
        "Starting tether client"
    );

    conn.on_open(|event| info!(transport = %event.transport, "Connected"));
    conn.on_message(|event| println!("{}", event.data));
    conn.on_close(|event| {
        info!(reason = ?event.reason, code = ?event.code, "Disconnected");
    });

    let (handle, task) = spawn(conn);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let payload = serde_json::from_str(line)
                        .unwrap_or_else(|_| Value::String(line.to_string()));
                    handle.send(payload)?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    if let Err(e) = handle.close() {
        warn!(error = %e, "Connection task already stopped");
    }
    drop(handle);
    task.await?;

    Ok(())
}
