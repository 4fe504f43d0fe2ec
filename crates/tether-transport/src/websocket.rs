//! WebSocket primary transport.
//!
//! This module provides a client-side WebSocket transport using
//! tokio-tungstenite. Each transport instance runs one socket on a spawned
//! task and reports Open, text messages and the final close through its
//! [`EventSink`].

use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message,
    },
};
use tracing::{debug, error, warn};

use crate::traits::{
    CloseEvent, CloseReason, EventSink, Payload, ReadyState, Transport, TransportError,
    TransportFactory, TransportKind,
};

/// Close code reported when the connection ended without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum time allowed for the TCP connect and WebSocket handshake.
    pub connect_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Builds WebSocket transports for the primary slot.
///
/// Requests for the fallback kind are rejected with
/// [`TransportError::Unsupported`]; the connection then reports a close for
/// the fallback transport.
#[derive(Debug, Clone, Default)]
pub struct WebSocketFactory {
    config: WebSocketConfig,
}

impl WebSocketFactory {
    /// Create a factory with the given configuration.
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for WebSocketFactory {
    fn connect(
        &mut self,
        kind: TransportKind,
        url: &str,
        sink: EventSink,
    ) -> Result<Box<dyn Transport>, TransportError> {
        if kind != TransportKind::Primary {
            return Err(TransportError::Unsupported(kind));
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(TransportError::InvalidUrl(url.to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Other(format!("No tokio runtime: {}", e)))?;

        let state = Arc::new(AtomicU8::new(ReadyState::Connecting.as_u8()));
        let (tx, rx) = mpsc::unbounded_channel();

        runtime.spawn(run_socket(
            url.to_string(),
            self.config.clone(),
            Arc::clone(&state),
            rx,
            sink,
        ));

        Ok(Box::new(WebSocketTransport {
            state,
            outgoing: tx,
        }))
    }
}

/// Commands from the transport handle to its socket task.
#[derive(Debug)]
enum Outgoing {
    Text(String),
    Close,
}

/// A client WebSocket connection.
#[derive(Debug)]
pub struct WebSocketTransport {
    state: Arc<AtomicU8>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl Transport for WebSocketTransport {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn send(&mut self, payload: Payload) -> Result<(), TransportError> {
        if self.ready_state() != ReadyState::Open {
            return Err(TransportError::NotOpen);
        }
        let text = match payload {
            Payload::Text(text) => text,
            Payload::Json(value) => value.to_string(),
        };
        self.outgoing
            .send(Outgoing::Text(text))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn close(&mut self) {
        match self.ready_state() {
            ReadyState::Closing | ReadyState::Closed => {}
            ReadyState::Connecting | ReadyState::Open => {
                self.state
                    .store(ReadyState::Closing.as_u8(), Ordering::SeqCst);
                // The task may already be gone; it reports its own close.
                let _ = self.outgoing.send(Outgoing::Close);
            }
        }
    }

    fn requires_text(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

async fn run_socket(
    url: String,
    config: WebSocketConfig,
    state: Arc<AtomicU8>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    sink: EventSink,
) {
    let set_state = |s: ReadyState| state.store(s.as_u8(), Ordering::SeqCst);

    let handshake = tokio::time::timeout(config.connect_timeout, connect_async(url.as_str()));
    let stream = tokio::select! {
        result = handshake => match result {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                warn!(url = %url, error = %e, "WebSocket handshake failed");
                set_state(ReadyState::Closed);
                sink.close(CloseEvent::error(e.to_string()).with_code(ABNORMAL_CLOSURE));
                return;
            }
            Err(_) => {
                warn!(url = %url, timeout = ?config.connect_timeout, "WebSocket handshake timed out");
                set_state(ReadyState::Closed);
                sink.close(CloseEvent::error("handshake timed out").with_code(ABNORMAL_CLOSURE));
                return;
            }
        },
        // Sends are refused while connecting, so anything here is a close
        // request or a dropped handle.
        _ = outgoing.recv() => {
            debug!(url = %url, "WebSocket closed before handshake completed");
            set_state(ReadyState::Closed);
            sink.close(CloseEvent::clean().with_description("closed before open"));
            return;
        }
    };

    debug!(url = %url, "WebSocket handshake completed");
    set_state(ReadyState::Open);
    sink.open();

    let (mut write, mut read) = stream.split();
    let mut closing = false;

    let close_event = loop {
        tokio::select! {
            command = outgoing.recv(), if !closing => match command {
                Some(Outgoing::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        error!(error = %e, "WebSocket send failed");
                        break CloseEvent::error(e.to_string()).with_code(ABNORMAL_CLOSURE);
                    }
                }
                Some(Outgoing::Close) | None => {
                    closing = true;
                    set_state(ReadyState::Closing);
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: Cow::Borrowed(""),
                    };
                    if let Err(e) = write.send(Message::Close(Some(frame))).await {
                        debug!(error = %e, "Failed to send close frame");
                        break CloseEvent::clean().with_description(e.to_string());
                    }
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    sink.message(Payload::Text(text));
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        sink.message(Payload::Text(text));
                    }
                    Err(_) => warn!("Dropping non UTF-8 binary message"),
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Received close frame");
                    break classify_close(frame);
                }
                Some(Err(WsError::ConnectionClosed)) | None => {
                    break if closing {
                        CloseEvent::clean()
                    } else {
                        CloseEvent::error("connection closed without close frame")
                            .with_code(ABNORMAL_CLOSURE)
                    };
                }
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    break CloseEvent::error(e.to_string()).with_code(ABNORMAL_CLOSURE);
                }
            }
        }
    };

    // Completes the closing handshake if the peer started it.
    let _ = write.close().await;

    set_state(ReadyState::Closed);
    sink.close(close_event);
}

/// Map a received close frame onto a [`CloseEvent`].
///
/// Only a normal closure counts as clean; a close frame without a status is
/// treated as clean too.
fn classify_close(frame: Option<CloseFrame<'_>>) -> CloseEvent {
    match frame {
        Some(frame) => {
            let reason = if frame.code == CloseCode::Normal {
                CloseReason::Clean
            } else {
                CloseReason::Error
            };
            let event = CloseEvent::new(reason).with_code(u16::from(frame.code));
            if frame.reason.is_empty() {
                event
            } else {
                event.with_description(frame.reason.into_owned())
            }
        }
        None => CloseEvent::clean(),
    }
}
