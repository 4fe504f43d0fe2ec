//! Connection metrics.
//!
//! Uses the `metrics` crate facade. Nothing is recorded unless the
//! application installs a recorder (the `tether` binary can export to
//! Prometheus).

use crate::traits::TransportKind;
use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const TRANSPORTS_OPENED: &str = "tether_transports_opened_total";
    pub const FALLBACKS_TOTAL: &str = "tether_fallbacks_total";
    pub const RECONNECTS_SCHEDULED: &str = "tether_reconnects_scheduled_total";
    pub const MESSAGES_TOTAL: &str = "tether_messages_total";
    pub const QUEUE_DEPTH: &str = "tether_outbound_queue_depth";
    pub const ERRORS_TOTAL: &str = "tether_errors_total";
}

/// Describe all metrics.
pub fn describe() {
    metrics::describe_counter!(
        names::TRANSPORTS_OPENED,
        "Underlying transports that reached the open state"
    );
    metrics::describe_counter!(
        names::FALLBACKS_TOTAL,
        "Downgrades from the primary to the fallback transport"
    );
    metrics::describe_counter!(
        names::RECONNECTS_SCHEDULED,
        "Primary transport reconnects scheduled"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Messages by direction");
    metrics::describe_gauge!(names::QUEUE_DEPTH, "Outbound messages waiting for an open transport");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Errors by type");
}

/// Record a transport reaching the open state.
pub fn record_open(kind: TransportKind) {
    counter!(names::TRANSPORTS_OPENED, "transport" => kind.name()).increment(1);
}

/// Record a downgrade to the fallback transport.
pub fn record_fallback() {
    counter!(names::FALLBACKS_TOTAL).increment(1);
}

/// Record a scheduled reconnect.
pub fn record_reconnect() {
    counter!(names::RECONNECTS_SCHEDULED).increment(1);
}

/// Record a message (`"outbound"`, `"inbound"` or `"queued"`).
pub fn record_message(direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
}

/// Update the outbound queue depth.
pub fn set_queue_depth(depth: usize) {
    gauge!(names::QUEUE_DEPTH).set(depth as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}
