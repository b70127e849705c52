//! Rate limit decisions and the metrics sink invoked with them.

use std::sync::Arc;

/// Outcome of a single rate limit check.
///
/// Attempt counts are reported against the primary (shortest) window even
/// when a longer window caused the block.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Whether the attempt may proceed
    pub allowed: bool,
    /// Attempts counted so far in the primary window
    pub current_attempts: u32,
    /// Attempts left before the primary window saturates
    pub remaining_attempts: u32,
    /// Epoch time at which the blocking window rolls over; present iff blocked
    pub next_allowed_attempt: Option<f64>,
    /// Escalating penalty in seconds; present iff blocked with failures on record
    pub backoff_interval: Option<f64>,
}

impl Decision {
    /// Whether the attempt may proceed.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

/// Sink invoked with every decision a limiter produces.
///
/// The sink runs outside the limiter's lock and receives a borrowed copy of
/// the decision already returned to the caller, so nothing it does can
/// change that outcome. Panics are caught and logged.
pub type MetricsCallback<K> = Arc<dyn Fn(&K, &Decision) + Send + Sync>;
