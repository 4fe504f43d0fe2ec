//! Transport abstraction traits for tether.
//!
//! These traits define the contract every underlying transport must provide,
//! so the connection state machine can stay transport-agnostic. A transport
//! raises its lifecycle events through an [`EventSink`] handed to it at
//! construction time, and exposes `send`, `close` and a ready state.

use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Which family of transport is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Native low-latency socket (WebSocket).
    Primary,
    /// Long-lived HTTP streaming/polling channel.
    Fallback,
}

impl TransportKind {
    /// Get the transport name used in logs and metrics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Connection state of a transport instance.
///
/// The numeric values match the WebSocket `readyState` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    /// Convert from the raw numeric value.
    ///
    /// Unknown values are treated as `Closed`.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Get the raw numeric value.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Why a transport closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Intentional, non-error termination.
    Clean,
    /// The transport failed or the peer went away abnormally.
    Error,
    /// The transport cannot tell.
    Unknown,
}

impl CloseReason {
    /// Whether this close counts as clean for recovery purposes.
    #[must_use]
    pub fn is_clean(self) -> bool {
        matches!(self, Self::Clean)
    }
}

/// A close notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// Classified reason.
    pub reason: CloseReason,
    /// Protocol close code, if the transport has one.
    pub code: Option<u16>,
    /// Human readable description.
    pub description: Option<String>,
}

impl CloseEvent {
    /// Create a close event with only a reason.
    #[must_use]
    pub fn new(reason: CloseReason) -> Self {
        Self {
            reason,
            code: None,
            description: None,
        }
    }

    /// A clean close.
    #[must_use]
    pub fn clean() -> Self {
        Self::new(CloseReason::Clean)
    }

    /// An error close with a description.
    #[must_use]
    pub fn error(description: impl Into<String>) -> Self {
        Self::new(CloseReason::Error).with_description(description)
    }

    /// Attach a protocol close code.
    #[must_use]
    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether the close was clean.
    #[must_use]
    pub fn was_clean(&self) -> bool {
        self.reason.is_clean()
    }
}

/// Data crossing the transport boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A text frame, as carried by the primary transport.
    Text(String),
    /// Structured data, as carried by transports that serialise internally.
    Json(Value),
}

/// Lifecycle events raised by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(Payload),
    Close(CloseEvent),
}

/// An event tagged with the generation of the transport that raised it.
#[derive(Debug, Clone, PartialEq)]
pub struct StampedEvent {
    pub generation: u64,
    pub event: TransportEvent,
}

/// Where a transport delivers its events.
///
/// Every transport instance gets its own sink stamped with a fresh
/// generation. Once the connection replaces the transport, events from the
/// old sink are dropped on arrival.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<StampedEvent>,
}

impl EventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<StampedEvent>) -> Self {
        Self { generation, tx }
    }

    /// Generation of the transport instance this sink belongs to.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event to the connection.
    ///
    /// Returns `false` if the connection has been dropped.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(StampedEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    /// Shorthand for `emit(TransportEvent::Open)`.
    pub fn open(&self) -> bool {
        self.emit(TransportEvent::Open)
    }

    /// Shorthand for `emit(TransportEvent::Message(..))`.
    pub fn message(&self, payload: Payload) -> bool {
        self.emit(TransportEvent::Message(payload))
    }

    /// Shorthand for `emit(TransportEvent::Close(..))`.
    pub fn close(&self, event: CloseEvent) -> bool {
        self.emit(TransportEvent::Close(event))
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport is not open.
    #[error("Transport not open")]
    NotOpen,

    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// This factory cannot build the requested transport kind.
    #[error("Unsupported transport: {0}")]
    Unsupported(TransportKind),

    /// Invalid endpoint URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A live underlying transport instance.
///
/// Instances are single use: once closed they are discarded and a new one is
/// built through the [`TransportFactory`].
pub trait Transport: Send {
    /// Current connection state.
    fn ready_state(&self) -> ReadyState;

    /// Send data over the transport.
    fn send(&mut self, payload: Payload) -> Result<(), TransportError>;

    /// Start closing the transport.
    ///
    /// The transport reports completion with a close event.
    fn close(&mut self);

    /// Whether the transport only carries text frames.
    fn requires_text(&self) -> bool {
        false
    }

    /// Get the transport name (e.g., "websocket").
    fn name(&self) -> &'static str;
}

/// Builds transport instances.
pub trait TransportFactory: Send {
    /// Start connecting a transport of `kind` to `url`.
    ///
    /// The returned transport starts in `Connecting` and reports progress
    /// through `sink`.
    fn connect(
        &mut self,
        kind: TransportKind,
        url: &str,
        sink: EventSink,
    ) -> Result<Box<dyn Transport>, TransportError>;
}
