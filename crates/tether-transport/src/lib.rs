//! # tether-transport
//!
//! A resilient client connection that hides two real-time transports behind
//! one send/receive interface:
//!
//! - **Primary** - a native WebSocket, preferred whenever the environment
//!   supports it
//! - **Fallback** - an HTTP streaming/polling channel, used when the primary
//!   transport is unavailable or never manages to open
//!
//! ## Behaviour
//!
//! - Messages sent before the primary transport opens are queued and flushed
//!   in order once it does.
//! - A primary transport that fails before ever opening is replaced by the
//!   fallback transport, permanently.
//! - A primary transport that breaks after having opened is reconnected with
//!   a linearly growing delay.
//!
//! ```rust,ignore
//! use tether_transport::{spawn, Connection, ConnectionConfig, StaticEnvironment, WebSocketFactory};
//!
//! let env = StaticEnvironment::native();
//! let mut conn = Connection::new(ConnectionConfig::default(), &env, WebSocketFactory::default());
//! conn.on_message(|event| println!("{}", event.data));
//!
//! let (handle, _task) = spawn(conn);
//! handle.send(serde_json::json!({"op": "hello"}))?;
//! ```
//!
//! ## Transport Abstraction
//!
//! Underlying transports implement [`Transport`] and are built by a
//! [`TransportFactory`] passed in by the caller, so the connection never
//! depends on a concrete protocol.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod environment;
pub mod handle;
pub mod metrics;
pub mod mock;
mod selector;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use backoff::LinearBackoff;
pub use config::{ConfigError, ConnectionConfig};
pub use connection::{Connection, ConnectionError, MessageEvent, OpenEvent, ReadyStateMirror};
pub use endpoint::Endpoints;
pub use environment::{Environment, StaticEnvironment};
pub use handle::{spawn, ConnectionHandle};
pub use selector::initial_kind;
pub use traits::{
    CloseEvent, CloseReason, EventSink, Payload, ReadyState, StampedEvent, Transport,
    TransportError, TransportEvent, TransportFactory, TransportKind,
};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketFactory, WebSocketTransport};
