//! The connection state machine.
//!
//! A [`Connection`] owns exactly one underlying transport at a time and
//! normalises both transport kinds into a single contract:
//!
//! - `send` queues while the primary transport is not open and drains the
//!   queue in order once it opens;
//! - `on_open` / `on_message` / `on_close` callbacks fire for whichever
//!   transport is active;
//! - a primary transport that never opened is replaced, once and for good,
//!   by the fallback transport;
//! - a primary transport that breaks after having opened is rebuilt after a
//!   linearly growing delay.
//!
//! All state changes happen on the task that drives the connection through
//! [`Connection::process_next`] or [`Connection::process_pending`].

use crate::backoff::LinearBackoff;
use crate::config::ConnectionConfig;
use crate::endpoint::Endpoints;
use crate::environment::Environment;
use crate::metrics;
use crate::selector::{initial_kind, ActiveTransport, TransportSelector};
use crate::traits::{
    CloseEvent, Payload, ReadyState, StampedEvent, Transport, TransportError, TransportEvent,
    TransportFactory, TransportKind,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Connection errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The caller closed the connection.
    #[error("Connection closed")]
    Closed,

    /// No underlying transport could be built.
    #[error("No transport available")]
    NotConnected,

    /// An outbound payload could not be serialised.
    #[error("Failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    /// An inbound primary message was not valid JSON.
    #[error("Failed to decode inbound message: {0}")]
    Decode(#[source] serde_json::Error),

    /// The underlying transport refused the operation.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The connection has switched to the fallback transport for good.
    #[error("Connection has been downgraded to the fallback transport")]
    Downgraded,

    /// The task driving the connection is gone.
    #[error("Connection task has shut down")]
    Shutdown,
}

/// Passed to the `on_open` callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenEvent {
    pub transport: TransportKind,
}

/// Passed to the `on_message` callback.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    /// Deserialised payload.
    pub data: Value,
    pub transport: TransportKind,
}

type OpenCallback = Box<dyn FnMut(&OpenEvent) + Send>;
type MessageCallback = Box<dyn FnMut(&MessageEvent) + Send>;
type CloseCallback = Box<dyn FnMut(&CloseEvent) + Send>;

/// Shared, lock-free view of the connection's ready state.
#[derive(Debug, Clone)]
pub struct ReadyStateMirror(Arc<AtomicU8>);

impl ReadyStateMirror {
    fn new(state: ReadyState) -> Self {
        Self(Arc::new(AtomicU8::new(state.as_u8())))
    }

    /// Current ready state.
    #[must_use]
    pub fn get(&self) -> ReadyState {
        ReadyState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: ReadyState) {
        self.0.store(state.as_u8(), Ordering::SeqCst);
    }
}

/// A resilient logical connection over a primary or fallback transport.
pub struct Connection {
    config: ConnectionConfig,
    selector: TransportSelector,
    active: Option<ActiveTransport>,
    events: mpsc::UnboundedReceiver<StampedEvent>,
    queue: VecDeque<Value>,
    has_ever_connected: bool,
    reconnect_attempts: u32,
    backoff: LinearBackoff,
    reconnect_at: Option<Instant>,
    closed_by_caller: bool,
    ready_state: ReadyStateMirror,
    on_open: Option<OpenCallback>,
    on_message: Option<MessageCallback>,
    on_close: Option<CloseCallback>,
}

impl Connection {
    /// Sends issued before the transport opens are queued, not rejected.
    pub const CAN_SEND_WHILE_CONNECTING: bool = true;
    /// Structured payloads are accepted; serialisation happens internally.
    pub const CAN_SEND_JSON: bool = true;

    /// Create a connection and start connecting.
    ///
    /// The primary transport is used when the environment supports native
    /// sockets and `browser_channel_only` is off; otherwise the fallback.
    pub fn new(
        config: ConnectionConfig,
        env: &dyn Environment,
        factory: impl TransportFactory + 'static,
    ) -> Self {
        let endpoints = Endpoints::derive(&config, env);
        let kind = initial_kind(env, &config);
        let (tx, rx) = mpsc::unbounded_channel();

        info!(
            transport = %kind,
            primary = %endpoints.primary,
            fallback = %endpoints.fallback,
            "Creating connection"
        );

        let mut conn = Self {
            backoff: LinearBackoff::from_config(&config),
            config,
            selector: TransportSelector::new(Box::new(factory), endpoints, tx),
            active: None,
            events: rx,
            queue: VecDeque::new(),
            has_ever_connected: false,
            reconnect_attempts: 0,
            reconnect_at: None,
            closed_by_caller: false,
            ready_state: ReadyStateMirror::new(ReadyState::Connecting),
            on_open: None,
            on_message: None,
            on_close: None,
        };
        conn.attach(kind);
        conn
    }

    /// Register the open callback.
    pub fn on_open<F>(&mut self, callback: F)
    where
        F: FnMut(&OpenEvent) + Send + 'static,
    {
        self.on_open = Some(Box::new(callback));
    }

    /// Register the message callback.
    pub fn on_message<F>(&mut self, callback: F)
    where
        F: FnMut(&MessageEvent) + Send + 'static,
    {
        self.on_message = Some(Box::new(callback));
    }

    /// Register the close callback. It fires for every close, before any
    /// recovery is attempted.
    pub fn on_close<F>(&mut self, callback: F)
    where
        F: FnMut(&CloseEvent) + Send + 'static,
    {
        self.on_close = Some(Box::new(callback));
    }

    /// Ready state as of the last processed event.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        self.ready_state.get()
    }

    /// A cloneable view of the ready state, readable from other tasks.
    #[must_use]
    pub fn ready_state_mirror(&self) -> ReadyStateMirror {
        self.ready_state.clone()
    }

    /// Whether the active transport is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.transport_state() == ReadyState::Open
    }

    /// Kind of the active transport.
    #[must_use]
    pub fn transport_kind(&self) -> TransportKind {
        self.active
            .as_ref()
            .map_or(TransportKind::Fallback, |active| active.kind)
    }

    /// The derived endpoint URLs.
    #[must_use]
    pub fn endpoints(&self) -> &Endpoints {
        self.selector.endpoints()
    }

    /// The configuration snapshot.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Number of messages waiting for the transport to open.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Consecutive primary reconnects scheduled since the last open.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Whether the primary transport has ever opened.
    #[must_use]
    pub fn has_ever_connected(&self) -> bool {
        self.has_ever_connected
    }

    /// When the pending primary reconnect fires, if one is scheduled.
    #[must_use]
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Whether `close()` has been called.
    #[must_use]
    pub fn is_closed_by_caller(&self) -> bool {
        self.closed_by_caller
    }

    /// Send a message.
    ///
    /// On the primary transport the message is queued unless the transport is
    /// open and nothing is queued ahead of it. The fallback transport is
    /// handed every message immediately, after anything still queued from
    /// the primary phase.
    ///
    /// # Errors
    ///
    /// Returns an error after `close()`, or if immediate delivery fails.
    pub fn send(&mut self, payload: Value) -> Result<(), ConnectionError> {
        if self.closed_by_caller {
            return Err(ConnectionError::Closed);
        }

        match self.transport_kind() {
            TransportKind::Primary => {
                if self.is_open() && self.queue.is_empty() {
                    self.deliver(&payload)
                } else {
                    self.enqueue(payload);
                    Ok(())
                }
            }
            TransportKind::Fallback => {
                self.flush_queue();
                if self.queue.is_empty() {
                    self.deliver(&payload)
                } else if self.transport_mut().is_none() {
                    Err(ConnectionError::NotConnected)
                } else {
                    self.enqueue(payload);
                    Ok(())
                }
            }
        }
    }

    /// Serialise `payload` and send it.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation fails or for the reasons listed on
    /// [`Connection::send`].
    pub fn send_json<T>(&mut self, payload: &T) -> Result<(), ConnectionError>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(payload).map_err(ConnectionError::Encode)?;
        self.send(value)
    }

    /// Close the connection.
    ///
    /// Discards queued messages and cancels any pending reconnect. The
    /// resulting close event still reaches `on_close`, but no recovery
    /// follows it.
    pub fn close(&mut self) {
        if self.closed_by_caller {
            return;
        }
        self.closed_by_caller = true;

        if self.reconnect_at.take().is_some() {
            debug!("Cancelled pending reconnect");
        }
        if !self.queue.is_empty() {
            debug!(dropped = self.queue.len(), "Discarding queued messages");
            self.queue.clear();
            metrics::set_queue_depth(0);
        }

        info!(transport = %self.transport_kind(), "Closing connection");
        if let Some(transport) = self.transport_mut() {
            transport.close();
        }
        self.sync_state();
    }

    /// Open the primary transport again, e.g. after a clean close or with
    /// reconnection disabled.
    ///
    /// Does nothing while a primary instance is already connecting or open.
    /// Clears a previous `close()`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Downgraded`] once the connection has moved
    /// to the fallback transport.
    pub fn open_primary(&mut self) -> Result<(), ConnectionError> {
        if self.transport_kind() == TransportKind::Fallback {
            return Err(ConnectionError::Downgraded);
        }
        self.reopen(TransportKind::Primary);
        Ok(())
    }

    /// Force a downgrade to the fallback transport.
    ///
    /// The current transport is detached and never used again. Does nothing
    /// while a fallback instance is already connecting or open.
    pub fn open_fallback(&mut self) {
        self.reopen(TransportKind::Fallback);
    }

    /// Reopen whichever transport kind is active.
    pub fn open(&mut self) {
        self.reopen(self.transport_kind());
    }

    /// Wait for the next transport event or the reconnect deadline, and
    /// process it.
    ///
    /// Cancel safe: nothing is lost if the returned future is dropped before
    /// completion.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Decode`] for malformed inbound primary
    /// messages; the connection remains usable.
    pub async fn process_next(&mut self) -> Result<(), ConnectionError> {
        let deadline = self.reconnect_at;
        let reconnect = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            stamped = self.events.recv() => match stamped {
                Some(stamped) => self.handle_event(stamped),
                None => Err(ConnectionError::Shutdown),
            },
            () = reconnect => {
                self.fire_reconnect();
                Ok(())
            }
        }
    }

    /// Process every event that has already arrived, plus the reconnect if
    /// its deadline has passed, without waiting.
    ///
    /// Returns the number of events processed.
    ///
    /// # Errors
    ///
    /// Stops at the first malformed inbound message; remaining events stay
    /// queued for the next call.
    pub fn process_pending(&mut self) -> Result<usize, ConnectionError> {
        let mut processed = 0;
        loop {
            while let Ok(stamped) = self.events.try_recv() {
                processed += 1;
                self.handle_event(stamped)?;
            }
            match self.reconnect_at {
                Some(at) if at <= Instant::now() => {
                    processed += 1;
                    self.fire_reconnect();
                }
                _ => return Ok(processed),
            }
        }
    }

    fn reopen(&mut self, kind: TransportKind) {
        self.closed_by_caller = false;
        self.reconnect_at = None;

        let live = matches!(
            self.transport_state(),
            ReadyState::Connecting | ReadyState::Open
        );
        if self.transport_kind() == kind && live {
            debug!(transport = %kind, "Transport already live, not reopening");
            return;
        }
        info!(transport = %kind, "Reopening transport");
        self.attach(kind);
        if kind == TransportKind::Fallback {
            self.flush_queue();
        }
    }

    fn attach(&mut self, kind: TransportKind) {
        let previous = self.active.take();
        self.active = Some(self.selector.open(kind, previous));
        self.sync_state();
    }

    fn fire_reconnect(&mut self) {
        self.reconnect_at = None;
        if self.closed_by_caller {
            return;
        }
        info!(attempt = self.reconnect_attempts, "Reconnecting primary transport");
        self.attach(TransportKind::Primary);
    }

    fn handle_event(&mut self, stamped: StampedEvent) -> Result<(), ConnectionError> {
        let Some(active) = self.active.as_ref() else {
            return Ok(());
        };
        if stamped.generation != active.generation {
            trace!(
                generation = stamped.generation,
                current = active.generation,
                "Dropping event from detached transport"
            );
            return Ok(());
        }

        let kind = active.kind;
        match stamped.event {
            TransportEvent::Open => self.handle_open(kind),
            TransportEvent::Message(payload) => return self.handle_message(kind, payload),
            TransportEvent::Close(event) => self.handle_close(kind, event),
        }
        Ok(())
    }

    fn handle_open(&mut self, kind: TransportKind) {
        self.sync_state();
        if kind == TransportKind::Primary {
            self.reconnect_attempts = 0;
            self.has_ever_connected = true;
        }

        info!(transport = %kind, url = %self.endpoints().url(kind), "Transport open");
        metrics::record_open(kind);

        self.flush_queue();

        if let Some(callback) = self.on_open.as_mut() {
            callback(&OpenEvent { transport: kind });
        }
    }

    fn handle_message(
        &mut self,
        kind: TransportKind,
        payload: Payload,
    ) -> Result<(), ConnectionError> {
        self.sync_state();

        let data = match (kind, payload) {
            (_, Payload::Json(value)) => value,
            (TransportKind::Primary, Payload::Text(text)) => {
                serde_json::from_str(&text).map_err(|e| {
                    warn!(transport = %kind, error = %e, "Dropping malformed inbound message");
                    metrics::record_error("decode");
                    ConnectionError::Decode(e)
                })?
            }
            (TransportKind::Fallback, Payload::Text(text)) => Value::String(text),
        };

        metrics::record_message("inbound");
        if let Some(callback) = self.on_message.as_mut() {
            callback(&MessageEvent {
                data,
                transport: kind,
            });
        }
        Ok(())
    }

    fn handle_close(&mut self, kind: TransportKind, event: CloseEvent) {
        self.sync_state();

        if event.was_clean() {
            info!(transport = %kind, code = ?event.code, "Transport closed");
        } else {
            warn!(
                transport = %kind,
                code = ?event.code,
                reason = ?event.reason,
                description = ?event.description,
                "Transport connection is broken"
            );
        }

        if let Some(callback) = self.on_close.as_mut() {
            callback(&event);
        }

        if self.closed_by_caller || kind == TransportKind::Fallback {
            return;
        }

        if !self.has_ever_connected {
            info!("Primary transport never opened, switching to fallback");
            metrics::record_fallback();
            self.attach(TransportKind::Fallback);
            // The fallback buffers internally; hand over what the primary never sent.
            self.flush_queue();
            return;
        }

        if self.config.reconnect && !event.was_clean() {
            let delay = self.backoff.delay(self.reconnect_attempts);
            self.reconnect_at = Some(Instant::now() + delay);
            info!(
                attempt = self.reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "Scheduled primary reconnect"
            );
            metrics::record_reconnect();
            self.reconnect_attempts += 1;
        }
    }

    fn enqueue(&mut self, payload: Value) {
        self.queue.push_back(payload);
        trace!(queued = self.queue.len(), "Queued outbound message");
        metrics::record_message("queued");
        metrics::set_queue_depth(self.queue.len());
    }

    fn flush_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let mut flushed = 0usize;
        while let Some(payload) = self.queue.pop_front() {
            if let Err(e) = self.deliver(&payload) {
                warn!(
                    error = %e,
                    remaining = self.queue.len() + 1,
                    "Failed to flush queued message"
                );
                self.queue.push_front(payload);
                break;
            }
            flushed += 1;
        }
        metrics::set_queue_depth(self.queue.len());
        if flushed > 0 {
            debug!(flushed, "Flushed outbound queue");
        }
    }

    fn deliver(&mut self, payload: &Value) -> Result<(), ConnectionError> {
        let transport = self.transport_mut().ok_or(ConnectionError::NotConnected)?;
        let frame = encode(payload, transport.requires_text())?;
        transport.send(frame)?;
        metrics::record_message("outbound");
        Ok(())
    }

    fn transport_mut(&mut self) -> Option<&mut Box<dyn Transport>> {
        self.active
            .as_mut()
            .and_then(|active| active.transport.as_mut())
    }

    fn transport_state(&self) -> ReadyState {
        self.active
            .as_ref()
            .and_then(|active| active.transport.as_ref())
            .map_or(ReadyState::Closed, |transport| transport.ready_state())
    }

    fn sync_state(&self) {
        self.ready_state.set(self.transport_state());
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.transport_kind())
            .field("ready_state", &self.ready_state())
            .field("queued", &self.queue.len())
            .field("has_ever_connected", &self.has_ever_connected)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .field("closed_by_caller", &self.closed_by_caller)
            .finish_non_exhaustive()
    }
}

/// Text transports get strings as-is and everything else as JSON text.
fn encode(payload: &Value, requires_text: bool) -> Result<Payload, ConnectionError> {
    if !requires_text {
        return Ok(Payload::Json(payload.clone()));
    }
    match payload {
        Value::String(text) => Ok(Payload::Text(text.clone())),
        other => serde_json::to_string(other)
            .map(Payload::Text)
            .map_err(ConnectionError::Encode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::StaticEnvironment;
    use crate::mock::MockFactory;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn env() -> StaticEnvironment {
        StaticEnvironment::new(true, "example.com", "https:")
    }

    fn connect(config: ConnectionConfig) -> (Connection, MockFactory) {
        let factory = MockFactory::new();
        let conn = Connection::new(config, &env(), factory.clone());
        (conn, factory)
    }

    fn text(s: &str) -> Payload {
        Payload::Text(s.to_string())
    }

    #[test]
    fn test_capability_flags() {
        assert!(Connection::CAN_SEND_WHILE_CONNECTING);
        assert!(Connection::CAN_SEND_JSON);
    }

    #[test]
    fn test_starts_on_primary_with_derived_url() {
        let (conn, factory) = connect(ConnectionConfig::default());
        let peer = factory.last().unwrap();

        assert_eq!(peer.kind(), TransportKind::Primary);
        assert_eq!(peer.url(), "wss://example.com/channel");
        assert_eq!(conn.ready_state(), ReadyState::Connecting);
        assert_eq!(conn.endpoints().fallback, "https://example.com/channel");
    }

    #[test]
    fn test_queue_drains_in_order_on_open() {
        let (mut conn, factory) = connect(ConnectionConfig::default());
        let peer = factory.last().unwrap();

        conn.send(json!({"seq": 1})).unwrap();
        conn.send(json!("raw text")).unwrap();
        conn.send(json!([3])).unwrap();
        assert_eq!(conn.queued(), 3);
        assert!(peer.sent().is_empty());

        peer.open();
        conn.process_pending().unwrap();

        assert_eq!(conn.queued(), 0);
        assert_eq!(
            peer.sent(),
            vec![text(r#"{"seq":1}"#), text("raw text"), text("[3]")]
        );
        assert_eq!(conn.ready_state(), ReadyState::Open);

        conn.send(json!({"seq": 4})).unwrap();
        assert_eq!(peer.sent().last(), Some(&text(r#"{"seq":4}"#)));
    }

    #[test]
    fn test_failed_flush_keeps_order() {
        let (mut conn, factory) = connect(ConnectionConfig::default());
        let peer = factory.last().unwrap();

        conn.send(json!(1)).unwrap();
        conn.send(json!(2)).unwrap();
        peer.fail_sends(true);
        peer.open();
        conn.process_pending().unwrap();
        assert_eq!(conn.queued(), 2);

        // Still queued behind the earlier messages even though the transport is open.
        peer.fail_sends(false);
        conn.send(json!(3)).unwrap();
        assert_eq!(conn.queued(), 3);
        assert!(peer.sent().is_empty());
    }

    #[test]
    fn test_inbound_text_is_parsed() {
        let (mut conn, factory) = connect(ConnectionConfig::default());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        conn.on_message(move |event| sink.lock().unwrap().push(event.data.clone()));

        let peer = factory.last().unwrap();
        peer.open();
        peer.message_text(r#"{"a":[1,2]}"#);
        conn.process_pending().unwrap();

        assert_eq!(*received.lock().unwrap(), vec![json!({"a": [1, 2]})]);
    }

    #[test]
    fn test_malformed_inbound_text_is_reported() {
        let (mut conn, factory) = connect(ConnectionConfig::default());
        let peer = factory.last().unwrap();
        peer.open();
        peer.message_text("{not json");
        peer.message_text("2");

        match conn.process_pending() {
            Err(ConnectionError::Decode(_)) => {}
            other => panic!("Expected Decode error, got {:?}", other),
        }
        // The following message is still delivered.
        assert_eq!(conn.process_pending().unwrap(), 1);
        assert!(conn.is_open());
    }

    #[test]
    fn test_first_failure_downgrades_to_fallback_once() {
        let (mut conn, factory) = connect(ConnectionConfig::default());
        let closes = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&closes);
        conn.on_close(move |_| *counter.lock().unwrap() += 1);

        conn.send(json!({"early": true})).unwrap();
        factory.last().unwrap().drop_connection();
        conn.process_pending().unwrap();

        assert_eq!(*closes.lock().unwrap(), 1);
        assert_eq!(conn.transport_kind(), TransportKind::Fallback);
        assert_eq!(factory.count(TransportKind::Fallback), 1);
        assert_eq!(conn.reconnect_deadline(), None);
        assert_eq!(conn.reconnect_attempts(), 0);

        let fallback = factory.last().unwrap();
        assert_eq!(fallback.url(), "https://example.com/channel");
        fallback.open();
        conn.process_pending().unwrap();

        // Queued messages go out as structured data on the fallback.
        assert_eq!(fallback.sent(), vec![Payload::Json(json!({"early": true}))]);

        // Fallback failures are reported but never recovered.
        fallback.drop_connection();
        conn.process_pending().unwrap();
        assert_eq!(*closes.lock().unwrap(), 2);
        assert_eq!(factory.peers().len(), 2);
        assert_eq!(conn.reconnect_deadline(), None);
    }

    #[test]
    fn test_order_kept_across_downgrade() {
        let (mut conn, factory) = connect(ConnectionConfig::default());

        conn.send(json!("m1")).unwrap();
        factory.last().unwrap().drop_connection();
        conn.process_pending().unwrap();
        assert_eq!(conn.transport_kind(), TransportKind::Fallback);

        conn.send(json!("m2")).unwrap();
        let fallback = factory.last().unwrap();
        fallback.open();
        conn.process_pending().unwrap();
        conn.send(json!("m3")).unwrap();

        assert_eq!(
            fallback.sent(),
            vec![
                Payload::Json(json!("m1")),
                Payload::Json(json!("m2")),
                Payload::Json(json!("m3")),
            ]
        );
        assert_eq!(conn.queued(), 0);
    }

    #[test]
    fn test_reopen_primary_after_clean_close() {
        let (mut conn, factory) = connect(ConnectionConfig::default());
        let peer = factory.last().unwrap();
        peer.open();
        conn.process_pending().unwrap();
        peer.close(CloseEvent::clean().with_code(1000));
        conn.process_pending().unwrap();
        assert_eq!(conn.reconnect_deadline(), None);

        conn.open_primary().unwrap();
        assert_eq!(factory.count(TransportKind::Primary), 2);
        assert_eq!(conn.ready_state(), ReadyState::Connecting);

        conn.send(json!("again")).unwrap();
        let peer = factory.last().unwrap();
        peer.open();
        conn.process_pending().unwrap();
        assert!(conn.is_open());
        assert_eq!(peer.sent(), vec![text("again")]);
    }

    #[test]
    fn test_open_is_idempotent_while_live() {
        let (mut conn, factory) = connect(ConnectionConfig::default());
        conn.open_primary().unwrap();
        conn.open();
        assert_eq!(factory.peers().len(), 1);

        factory.last().unwrap().open();
        conn.process_pending().unwrap();
        conn.open_primary().unwrap();
        assert_eq!(factory.peers().len(), 1);
        assert!(conn.is_open());
    }

    #[test]
    fn test_open_primary_refused_after_downgrade() {
        let (mut conn, factory) = connect(ConnectionConfig::default());
        factory.last().unwrap().drop_connection();
        conn.process_pending().unwrap();

        assert!(matches!(
            conn.open_primary(),
            Err(ConnectionError::Downgraded)
        ));
        assert_eq!(factory.count(TransportKind::Primary), 1);

        // Reopening the current kind rebuilds the fallback once it is gone.
        factory.last().unwrap().drop_connection();
        conn.process_pending().unwrap();
        conn.open();
        assert_eq!(factory.count(TransportKind::Fallback), 2);
    }

    #[test]
    fn test_reopen_after_explicit_close_accepts_sends() {
        let (mut conn, factory) = connect(ConnectionConfig::default());
        factory.last().unwrap().open();
        conn.process_pending().unwrap();

        conn.close();
        conn.process_pending().unwrap();
        assert!(matches!(conn.send(json!(1)), Err(ConnectionError::Closed)));

        conn.open();
        assert!(!conn.is_closed_by_caller());
        conn.send(json!(2)).unwrap();
        assert_eq!(conn.queued(), 1);

        let peer = factory.last().unwrap();
        assert_eq!(factory.count(TransportKind::Primary), 2);
        peer.open();
        conn.process_pending().unwrap();
        assert_eq!(peer.sent(), vec![text("2")]);
    }

    #[test]
    fn test_fallback_only_config_never_touches_primary() {
        let config = ConnectionConfig {
            browser_channel_only: true,
            ..Default::default()
        };
        let (mut conn, factory) = connect(config);
        assert_eq!(conn.transport_kind(), TransportKind::Fallback);

        // The fallback takes messages straight away.
        conn.send(json!("hello")).unwrap();
        let peer = factory.last().unwrap();
        assert_eq!(peer.sent(), vec![Payload::Json(json!("hello"))]);

        peer.drop_connection();
        conn.process_pending().unwrap();
        assert_eq!(factory.count(TransportKind::Primary), 0);
    }

    #[test]
    fn test_fallback_text_forwarded_as_string() {
        let env = StaticEnvironment::new(false, "example.com", "http:");
        let factory = MockFactory::new();
        let mut conn = Connection::new(ConnectionConfig::default(), &env, factory.clone());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        conn.on_message(move |event| sink.lock().unwrap().push(event.clone()));

        let peer = factory.last().unwrap();
        assert_eq!(peer.kind(), TransportKind::Fallback);
        peer.open();
        peer.message_text("{\"not\":\"parsed\"}");
        peer.message_json(json!({"k": 1}));
        conn.process_pending().unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received[0].data, json!("{\"not\":\"parsed\"}"));
        assert_eq!(received[1].data, json!({"k": 1}));
        assert_eq!(received[1].transport, TransportKind::Fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_backoff_after_prior_open() {
        let config = ConnectionConfig {
            reconnect: true,
            timeout: 1000,
            timeout_increment: 500,
            ..Default::default()
        };
        let (mut conn, factory) = connect(config);

        factory.last().unwrap().open();
        conn.process_pending().unwrap();

        factory.last().unwrap().drop_connection();
        conn.process_pending().unwrap();
        let first = conn.reconnect_deadline().unwrap();
        assert_eq!(first - Instant::now(), Duration::from_millis(1000));
        assert_eq!(conn.reconnect_attempts(), 1);

        conn.process_next().await.unwrap();
        assert_eq!(factory.count(TransportKind::Primary), 2);

        // Second consecutive failure, without an open in between.
        factory.last().unwrap().drop_connection();
        conn.process_pending().unwrap();
        let second = conn.reconnect_deadline().unwrap();
        assert_eq!(second - Instant::now(), Duration::from_millis(1500));
        assert_eq!(conn.reconnect_attempts(), 2);

        conn.process_next().await.unwrap();
        factory.last().unwrap().open();
        conn.process_pending().unwrap();
        assert_eq!(conn.reconnect_attempts(), 0);
        assert_eq!(factory.count(TransportKind::Fallback), 0);
    }

    #[test]
    fn test_clean_close_never_reconnects() {
        let (mut conn, factory) = connect(ConnectionConfig::default());
        let peer = factory.last().unwrap();
        peer.open();
        conn.process_pending().unwrap();

        peer.close(CloseEvent::clean().with_code(1000));
        conn.process_pending().unwrap();

        assert_eq!(conn.reconnect_deadline(), None);
        assert_eq!(conn.ready_state(), ReadyState::Closed);
        assert_eq!(factory.peers().len(), 1);
    }

    #[test]
    fn test_reconnect_disabled() {
        let config = ConnectionConfig {
            reconnect: false,
            ..Default::default()
        };
        let (mut conn, factory) = connect(config);
        let peer = factory.last().unwrap();
        peer.open();
        conn.process_pending().unwrap();

        peer.drop_connection();
        conn.process_pending().unwrap();
        assert_eq!(conn.reconnect_deadline(), None);
        assert_eq!(conn.transport_kind(), TransportKind::Primary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_close_cancels_pending_reconnect() {
        let (mut conn, factory) = connect(ConnectionConfig::default());
        factory.last().unwrap().open();
        conn.process_pending().unwrap();
        factory.last().unwrap().drop_connection();
        conn.process_pending().unwrap();
        assert!(conn.reconnect_deadline().is_some());

        conn.close();
        assert_eq!(conn.reconnect_deadline(), None);

        tokio::time::advance(Duration::from_secs(60)).await;
        conn.process_pending().unwrap();
        assert_eq!(factory.peers().len(), 1);
        assert!(matches!(conn.send(json!(1)), Err(ConnectionError::Closed)));
    }

    #[test]
    fn test_explicit_close_is_treated_as_clean() {
        let (mut conn, factory) = connect(ConnectionConfig::default());
        let closes = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&closes);
        conn.on_close(move |event| seen.lock().unwrap().push(event.clone()));

        let peer = factory.last().unwrap();
        peer.open();
        conn.process_pending().unwrap();
        conn.send(json!(1)).unwrap();

        conn.close();
        conn.process_pending().unwrap();

        assert!(peer.close_requested());
        assert_eq!(closes.lock().unwrap().len(), 1);
        assert_eq!(conn.ready_state(), ReadyState::Closed);
        assert_eq!(factory.peers().len(), 1);
    }

    #[test]
    fn test_close_before_first_open_does_not_fall_back() {
        let (mut conn, factory) = connect(ConnectionConfig::default());
        conn.send(json!("pending")).unwrap();
        conn.close();
        conn.process_pending().unwrap();

        assert_eq!(conn.queued(), 0);
        assert_eq!(factory.count(TransportKind::Fallback), 0);
    }

    #[test]
    fn test_stale_events_are_ignored() {
        let (mut conn, factory) = connect(ConnectionConfig::default());
        let opens = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&opens);
        conn.on_open(move |_| *counter.lock().unwrap() += 1);

        let primary = factory.last().unwrap();
        conn.open_fallback();
        assert_eq!(conn.transport_kind(), TransportKind::Fallback);

        // Events from the replaced instance no longer reach the caller.
        primary.open();
        primary.message_text("1");
        conn.process_pending().unwrap();
        assert_eq!(*opens.lock().unwrap(), 0);

        factory.last().unwrap().open();
        conn.process_pending().unwrap();
        assert_eq!(*opens.lock().unwrap(), 1);
    }

    #[test]
    fn test_factory_failure_on_fallback_leaves_connection_closed() {
        let factory = MockFactory::new();
        factory.fail_kind(TransportKind::Fallback);
        let mut conn = Connection::new(ConnectionConfig::default(), &env(), factory.clone());

        factory.last().unwrap().drop_connection();
        conn.process_pending().unwrap();

        assert_eq!(conn.transport_kind(), TransportKind::Fallback);
        assert_eq!(conn.ready_state(), ReadyState::Closed);
        assert!(matches!(
            conn.send(json!(1)),
            Err(ConnectionError::NotConnected)
        ));
    }

    #[test]
    fn test_send_json_serializes_structs() {
        #[derive(Serialize)]
        struct Op<'a> {
            op: &'a str,
            v: u32,
        }

        let (mut conn, factory) = connect(ConnectionConfig::default());
        let peer = factory.last().unwrap();
        peer.open();
        conn.process_pending().unwrap();

        conn.send_json(&Op { op: "inc", v: 2 }).unwrap();
        assert_eq!(peer.sent(), vec![text(r#"{"op":"inc","v":2}"#)]);
    }

    #[test]
    fn test_encode() {
        assert_eq!(encode(&json!("s"), true).unwrap(), text("s"));
        assert_eq!(encode(&json!({"a": 1}), true).unwrap(), text(r#"{"a":1}"#));
        assert_eq!(
            encode(&json!({"a": 1}), false).unwrap(),
            Payload::Json(json!({"a": 1}))
        );
    }
}
