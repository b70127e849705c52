//! Core rate limiter implementation.

use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::cache::BoundedMap;
use crate::config::{RateLimiterConfig, WindowSpec};
use crate::error::Result;

use super::decision::{Decision, MetricsCallback};
use super::epoch_now;
use super::window::KeyState;

/// Backoff penalties saturate at one week.
const MAX_BACKOFF_SECS: f64 = 604_800.0;

/// A full stale-entry sweep runs once per this many operations.
const SWEEP_INTERVAL: u32 = 512;

/// Multi-window rate limiter with exponential failure backoff.
///
/// Every attempt is counted against all configured windows at once, so a
/// key must stay under each layered budget. Decisions report against the
/// primary (shortest) window. A single per-key consecutive-failure counter
/// escalates the penalty for keys that keep failing: once the primary
/// window is saturated and failures are on record, the block carries a
/// `backoff_interval` of `multiplier ^ failures * primary_duration`.
///
/// Checking and recording are separate operations. `check_limit` never
/// consumes budget; callers report consumption through `record_attempt`
/// and outcomes through `record_success` / `record_failure`. Two callers
/// interleaving check and record may overshoot a window by a small margin;
/// paths that need atomic check-and-consume go through
/// [`RequestPacer::schedule_request`](super::RequestPacer::schedule_request).
///
/// All methods serialize through one internal lock, so the limiter can be
/// shared across tasks behind an `Arc`.
pub struct RateLimiter<K> {
    /// Windows sorted ascending by duration; index 0 is the primary window.
    windows: Vec<WindowSpec>,
    backoff_multiplier: f64,
    /// Longest window duration in whole seconds; the staleness horizon.
    max_duration_secs: u64,
    state: Mutex<LimiterState<K>>,
    metrics_callback: Option<MetricsCallback<K>>,
}

struct LimiterState<K> {
    entries: BoundedMap<K, KeyState>,
    ops_since_sweep: u32,
}

impl<K> LimiterState<K>
where
    K: Eq + Hash + Clone,
{
    /// Drop keys idle past the staleness horizon, amortized so the full
    /// scan does not run on every call.
    fn maybe_sweep(&mut self, now: f64, max_duration_secs: u64) {
        self.ops_since_sweep += 1;
        if self.ops_since_sweep < SWEEP_INTERVAL {
            return;
        }
        self.ops_since_sweep = 0;

        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.is_stale(now, max_duration_secs));
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "Swept stale rate limit state");
        }
    }
}

impl<K> RateLimiter<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    /// Create a rate limiter from a validated configuration.
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        let config = config.validated()?;
        // Windows are sorted ascending, so the last one is the horizon.
        let max_duration_secs = config
            .windows
            .last()
            .map(|w| w.duration_whole_secs())
            .unwrap_or(1);

        Ok(Self {
            state: Mutex::new(LimiterState {
                entries: BoundedMap::new(config.max_cache_size)?,
                ops_since_sweep: 0,
            }),
            windows: config.windows,
            backoff_multiplier: config.backoff_multiplier,
            max_duration_secs,
            metrics_callback: None,
        })
    }

    /// Attach a sink invoked with every decision this limiter produces.
    pub fn with_metrics_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&K, &Decision) + Send + Sync + 'static,
    {
        self.metrics_callback = Some(Arc::new(callback));
        self
    }

    /// Check whether an attempt by `key` would be admitted right now.
    pub fn check_limit(&self, key: &K) -> Decision {
        self.check_limit_at(key, epoch_now())
    }

    /// Check whether an attempt by `key` would be admitted at `now`.
    ///
    /// This is read-mostly: it never consumes attempt budget, though it
    /// does refresh the key's recency and roll lapsed windows forward.
    pub fn check_limit_at(&self, key: &K, now: f64) -> Decision {
        let decision = self.decide(key, now, false);
        self.emit_metrics(key, &decision);
        decision
    }

    /// Count one attempt by `key` against every configured window.
    pub fn record_attempt(&self, key: &K) {
        self.record_attempt_at(key, epoch_now())
    }

    /// Count one attempt by `key` against every configured window at `now`.
    pub fn record_attempt_at(&self, key: &K, now: f64) {
        let mut state = self.state.lock();
        state.maybe_sweep(now, self.max_duration_secs);

        let mut entry = match state.entries.remove(key) {
            Some(mut entry) => {
                entry.roll_windows(&self.windows, now);
                entry
            }
            None => {
                trace!(key = ?key, "Creating rate limit state");
                KeyState::new(&self.windows, now)
            }
        };
        entry.record_attempt();
        entry.last_touched = now;

        trace!(key = ?key, attempts = entry.slots[0].attempts, "Recorded attempt");
        if let Some((evicted, _)) = state.entries.insert(key.clone(), entry) {
            debug!(key = ?evicted, "Evicted least-recently-used rate limit state");
        }
    }

    /// Record a failed outcome for `key`, escalating its backoff penalty.
    ///
    /// A no-op when the key has no state.
    pub fn record_failure(&self, key: &K) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            debug!(
                key = ?key,
                failures = entry.consecutive_failures,
                "Recorded failure"
            );
        }
    }

    /// Record a successful outcome for `key`, clearing its backoff penalty.
    ///
    /// A no-op when the key has no state.
    pub fn record_success(&self, key: &K) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.consecutive_failures = 0;
            trace!(key = ?key, "Cleared consecutive failures");
        }
    }

    /// Forget all state for `key`.
    pub fn reset(&self, key: &K) {
        self.state.lock().entries.remove(key);
    }

    /// Forget all tracked keys.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    /// Number of keys with tracked state.
    pub fn key_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check and, when admitted, consume budget in one serialized step.
    ///
    /// The returned decision describes the pre-consumption state. Used by
    /// the pacer so admitted requests cannot race past a layered budget.
    pub(crate) fn check_and_consume(&self, key: &K, now: f64) -> Decision {
        let decision = self.decide(key, now, true);
        self.emit_metrics(key, &decision);
        decision
    }

    /// Load or synthesize the key's state at `now`, evaluate it, and
    /// optionally consume one attempt. Runs entirely under the lock.
    fn decide(&self, key: &K, now: f64, consume: bool) -> Decision {
        let mut state = self.state.lock();
        state.maybe_sweep(now, self.max_duration_secs);

        // Remove-then-reinsert keeps the key most recently used and gives
        // us owned state to work on without aliasing the cache.
        let mut entry = match state.entries.remove(key) {
            Some(mut entry) => {
                entry.roll_windows(&self.windows, now);
                entry
            }
            None => {
                trace!(key = ?key, "Creating rate limit state");
                KeyState::new(&self.windows, now)
            }
        };
        entry.last_touched = now;

        let decision = self.evaluate(&entry);
        if consume && decision.allowed {
            entry.record_attempt();
        }

        if !decision.allowed {
            debug!(
                key = ?key,
                attempts = decision.current_attempts,
                failures = entry.consecutive_failures,
                "Rate limit exceeded"
            );
        }

        if let Some((evicted, _)) = state.entries.insert(key.clone(), entry) {
            debug!(key = ?evicted, "Evicted least-recently-used rate limit state");
        }
        decision
    }

    /// Evaluate rolled-forward state against every window.
    fn evaluate(&self, entry: &KeyState) -> Decision {
        let primary_spec = &self.windows[0];
        let primary = &entry.slots[0];
        let current_attempts = primary.attempts;
        let remaining_attempts = primary_spec.max_attempts.saturating_sub(current_attempts);
        let failures = entry.consecutive_failures;

        // Failure backoff takes precedence over plain window saturation.
        if failures > 0 && primary.attempts >= primary_spec.max_attempts {
            return Decision {
                allowed: false,
                current_attempts,
                remaining_attempts,
                next_allowed_attempt: Some(
                    primary.window_start + primary_spec.duration_whole_secs() as f64,
                ),
                backoff_interval: Some(self.backoff_interval(failures)),
            };
        }

        for (slot, spec) in entry.slots.iter().zip(&self.windows) {
            if slot.attempts >= spec.max_attempts {
                return Decision {
                    allowed: false,
                    current_attempts,
                    remaining_attempts,
                    next_allowed_attempt: Some(
                        slot.window_start + spec.duration_whole_secs() as f64,
                    ),
                    backoff_interval: (failures > 0).then(|| self.backoff_interval(failures)),
                };
            }
        }

        Decision {
            allowed: true,
            current_attempts,
            remaining_attempts,
            next_allowed_attempt: None,
            backoff_interval: None,
        }
    }

    /// Penalty in seconds for the given failure count, saturated so large
    /// counts never produce infinity.
    fn backoff_interval(&self, failures: u32) -> f64 {
        let penalty =
            self.backoff_multiplier.powf(failures as f64) * self.windows[0].duration_secs;
        penalty.min(MAX_BACKOFF_SECS)
    }

    fn emit_metrics(&self, key: &K, decision: &Decision) {
        if let Some(callback) = &self.metrics_callback {
            // The sink is user code; a panic there must not reach the caller.
            if panic::catch_unwind(AssertUnwindSafe(|| callback(key, decision))).is_err() {
                warn!(key = ?key, "Metrics callback panicked");
            }
        }
    }
}
