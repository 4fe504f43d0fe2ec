//! Reconnect delay policy.
//!
//! Delays grow linearly: `base + increment * attempt`.

use crate::config::ConnectionConfig;
use std::time::Duration;

/// Linear reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    base: Duration,
    increment: Duration,
}

impl LinearBackoff {
    /// Create a backoff policy.
    #[must_use]
    pub const fn new(base: Duration, increment: Duration) -> Self {
        Self { base, increment }
    }

    /// Build the policy from connection configuration.
    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.base_delay(), config.delay_increment())
    }

    /// Delay before reconnect attempt number `attempt` (starting at 0).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_add(self.increment.saturating_mul(attempt))
    }
}
