//! Mock transports for testing.
//!
//! [`MockFactory`] records every transport the connection asks for. Each one
//! is exposed as a [`MockPeer`] that tests use to play the remote side:
//! open it, push messages, break it, and inspect what was sent.
//!
//! # Example
//!
//! ```
//! use tether_transport::mock::MockFactory;
//! use tether_transport::{Connection, ConnectionConfig, StaticEnvironment, TransportKind};
//!
//! let factory = MockFactory::new();
//! let env = StaticEnvironment::new(true, "example.com", "https:");
//! let mut conn = Connection::new(ConnectionConfig::default(), &env, factory.clone());
//!
//! let peer = factory.last().unwrap();
//! assert_eq!(peer.kind(), TransportKind::Primary);
//! peer.open();
//! conn.process_pending().unwrap();
//! assert!(conn.is_open());
//! ```

use crate::traits::{
    CloseEvent, EventSink, Payload, ReadyState, Transport, TransportError, TransportFactory,
    TransportKind,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct PeerState {
    ready_state: ReadyState,
    sent: Vec<Payload>,
    close_requested: bool,
    fail_sends: bool,
}

/// The remote side of one mock transport instance.
#[derive(Debug, Clone)]
pub struct MockPeer {
    kind: TransportKind,
    url: String,
    sink: EventSink,
    state: Arc<Mutex<PeerState>>,
}

impl MockPeer {
    /// Transport kind the connection asked for.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// URL the connection asked for.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Generation stamped on this instance's events.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.sink.generation()
    }

    /// Current state of this instance.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        lock(&self.state).ready_state
    }

    /// Everything the connection sent through this instance, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<Payload> {
        lock(&self.state).sent.clone()
    }

    /// Whether the connection called `close()` on this instance.
    #[must_use]
    pub fn close_requested(&self) -> bool {
        lock(&self.state).close_requested
    }

    /// Make subsequent sends fail (or succeed again).
    pub fn fail_sends(&self, fail: bool) {
        lock(&self.state).fail_sends = fail;
    }

    /// Complete the handshake.
    pub fn open(&self) {
        lock(&self.state).ready_state = ReadyState::Open;
        self.sink.open();
    }

    /// Deliver a text frame.
    pub fn message_text(&self, text: impl Into<String>) {
        self.sink.message(Payload::Text(text.into()));
    }

    /// Deliver structured data.
    pub fn message_json(&self, value: Value) {
        self.sink.message(Payload::Json(value));
    }

    /// Close from the remote side.
    pub fn close(&self, event: CloseEvent) {
        lock(&self.state).ready_state = ReadyState::Closed;
        self.sink.close(event);
    }

    /// Break the connection abnormally.
    pub fn drop_connection(&self) {
        self.close(CloseEvent::error("connection reset").with_code(1006));
    }
}

struct MockTransport {
    kind: TransportKind,
    sink: EventSink,
    state: Arc<Mutex<PeerState>>,
}

impl Transport for MockTransport {
    fn ready_state(&self) -> ReadyState {
        lock(&self.state).ready_state
    }

    fn send(&mut self, payload: Payload) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.fail_sends {
            return Err(TransportError::SendFailed("mock send failure".into()));
        }
        if self.kind == TransportKind::Primary && state.ready_state != ReadyState::Open {
            return Err(TransportError::NotOpen);
        }
        state.sent.push(payload);
        Ok(())
    }

    fn close(&mut self) {
        let mut state = lock(&self.state);
        state.close_requested = true;
        if state.ready_state != ReadyState::Closed {
            state.ready_state = ReadyState::Closed;
            drop(state);
            self.sink.close(CloseEvent::clean().with_code(1000));
        }
    }

    fn requires_text(&self) -> bool {
        self.kind == TransportKind::Primary
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[derive(Debug, Default)]
struct FactoryState {
    peers: Vec<MockPeer>,
    failing: HashSet<TransportKind>,
}

/// A factory that hands out mock transports.
#[derive(Debug, Clone, Default)]
pub struct MockFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl MockFactory {
    /// Create a new mock factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future `connect` for `kind` fail.
    pub fn fail_kind(&self, kind: TransportKind) {
        lock(&self.state).failing.insert(kind);
    }

    /// All instances created so far, oldest first.
    #[must_use]
    pub fn peers(&self) -> Vec<MockPeer> {
        lock(&self.state).peers.clone()
    }

    /// The most recently created instance.
    #[must_use]
    pub fn last(&self) -> Option<MockPeer> {
        lock(&self.state).peers.last().cloned()
    }

    /// Number of instances created for `kind`.
    #[must_use]
    pub fn count(&self, kind: TransportKind) -> usize {
        lock(&self.state)
            .peers
            .iter()
            .filter(|p| p.kind == kind)
            .count()
    }
}

impl TransportFactory for MockFactory {
    fn connect(
        &mut self,
        kind: TransportKind,
        url: &str,
        sink: EventSink,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let mut factory = lock(&self.state);
        if factory.failing.contains(&kind) {
            return Err(TransportError::Unsupported(kind));
        }

        let state = Arc::new(Mutex::new(PeerState {
            ready_state: ReadyState::Connecting,
            sent: Vec::new(),
            close_requested: false,
            fail_sends: false,
        }));
        factory.peers.push(MockPeer {
            kind,
            url: url.to_string(),
            sink: sink.clone(),
            state: Arc::clone(&state),
        });

        Ok(Box::new(MockTransport { kind, sink, state }))
    }
}
