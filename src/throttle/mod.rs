//! Throttling engine: rate limiting, request pacing, and their composition.

mod client;
mod decision;
mod limiter;
mod pacer;
mod window;

pub use client::{AcquireDecision, ThrottledClient};
pub use decision::{Decision, MetricsCallback};
pub use limiter::RateLimiter;
pub use pacer::{RequestPacer, Schedule};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in seconds since the Unix epoch.
pub(crate) fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}
