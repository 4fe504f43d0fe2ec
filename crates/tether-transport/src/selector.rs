//! Transport selection and instantiation.
//!
//! The selector owns the transport factory, the derived endpoints and the
//! generation counter. Each call to [`TransportSelector::open`] produces a
//! fresh transport wired to a fresh [`EventSink`]; bumping the generation is
//! what detaches the previous instance's events.

use crate::config::ConnectionConfig;
use crate::endpoint::Endpoints;
use crate::environment::Environment;
use crate::traits::{
    CloseEvent, EventSink, ReadyState, StampedEvent, Transport, TransportFactory, TransportKind,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pick the transport a new connection starts with.
#[must_use]
pub fn initial_kind(env: &dyn Environment, config: &ConnectionConfig) -> TransportKind {
    if env.supports_native_socket() && !config.browser_channel_only {
        TransportKind::Primary
    } else {
        TransportKind::Fallback
    }
}

/// The currently wired transport instance.
pub(crate) struct ActiveTransport {
    pub kind: TransportKind,
    pub generation: u64,
    /// `None` when the factory failed to build the transport.
    pub transport: Option<Box<dyn Transport>>,
}

/// Builds transports and wires their events back to the connection.
pub(crate) struct TransportSelector {
    factory: Box<dyn TransportFactory>,
    endpoints: Endpoints,
    generation: u64,
    events: mpsc::UnboundedSender<StampedEvent>,
}

impl TransportSelector {
    pub fn new(
        factory: Box<dyn TransportFactory>,
        endpoints: Endpoints,
        events: mpsc::UnboundedSender<StampedEvent>,
    ) -> Self {
        Self {
            factory,
            endpoints,
            generation: 0,
            events,
        }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Tear down `previous` and instantiate a new transport of `kind`.
    pub fn open(
        &mut self,
        kind: TransportKind,
        previous: Option<ActiveTransport>,
    ) -> ActiveTransport {
        if let Some(old) = previous {
            detach(old);
        }

        self.generation += 1;
        let generation = self.generation;
        let sink = EventSink::new(generation, self.events.clone());
        let url = self.endpoints.url(kind).to_string();

        debug!(transport = %kind, generation, url = %url, "Opening transport");

        let transport = match self.factory.connect(kind, &url, sink.clone()) {
            Ok(transport) => Some(transport),
            Err(e) => {
                warn!(transport = %kind, url = %url, error = %e, "Failed to create transport");
                // Construction failures surface like any other broken connection.
                sink.close(CloseEvent::error(e.to_string()));
                None
            }
        };

        ActiveTransport {
            kind,
            generation,
            transport,
        }
    }
}

fn detach(old: ActiveTransport) {
    if let Some(mut transport) = old.transport {
        if transport.ready_state() != ReadyState::Closed {
            transport.close();
        }
        debug!(
            transport = %old.kind,
            generation = old.generation,
            "Detached previous transport"
        );
    }
}
