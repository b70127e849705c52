//! Request pacing to a target rate.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::cache::BoundedMap;
use crate::config::PacerConfig;
use crate::error::Result;

use super::decision::Decision;
use super::epoch_now;
use super::limiter::RateLimiter;

/// Outcome of scheduling one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    /// False iff a composed rate limiter denied the request
    pub allowed: bool,
    /// Epoch time the request is scheduled for
    pub scheduled_time: f64,
    /// Seconds the caller should sleep before proceeding, floored to zero
    pub delay: f64,
    /// Decision from the composed rate limiter, when one is configured
    pub limit_decision: Option<Decision>,
}

impl Schedule {
    /// Whether the request was admitted.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PacerState {
    last_scheduled_time: Option<f64>,
    request_count: u64,
}

/// Spaces scheduled request times to a target rate, one queue per key.
///
/// The pacer never sleeps: it reports a scheduled time and the delay until
/// it, and the caller sleeps. In strict mode (the default) each request is
/// scheduled `1 / target_rate` after the previous one, so a caller running
/// hot builds a deterministic queue into the future. With catch-up enabled
/// the schedule snaps forward to the present once real time has satisfied
/// the spacing.
///
/// A composed [`RateLimiter`] acts as a hard cap: admitted requests check
/// and consume budget in one serialized step, and denied requests take no
/// pacing slot.
pub struct RequestPacer<K> {
    /// Minimum spacing between scheduled times, `1 / target_rate`.
    min_spacing: f64,
    allow_catch_up: bool,
    rate_limiter: Option<Arc<RateLimiter<K>>>,
    state: Mutex<BoundedMap<K, PacerState>>,
}

impl<K> RequestPacer<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    /// Create a pacer from a validated configuration.
    pub fn new(config: PacerConfig) -> Result<Self> {
        let config = config.validated()?;
        Ok(Self {
            min_spacing: 1.0 / config.target_rate,
            allow_catch_up: config.allow_catch_up,
            rate_limiter: None,
            state: Mutex::new(BoundedMap::new(config.max_cache_size)?),
        })
    }

    /// Compose a rate limiter as a hard cap over the pacing schedule.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter<K>>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// The composed rate limiter, when one is configured.
    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter<K>>> {
        self.rate_limiter.as_ref()
    }

    /// Schedule a request for `key` right now.
    pub fn schedule_request(&self, key: &K) -> Schedule {
        self.schedule_request_at(key, epoch_now())
    }

    /// Schedule a request for `key` at `now`.
    pub fn schedule_request_at(&self, key: &K, now: f64) -> Schedule {
        // Hard cap first: a denied request consumes no pacing slot.
        let limit_decision = match &self.rate_limiter {
            Some(limiter) => {
                let decision = limiter.check_and_consume(key, now);
                if !decision.allowed {
                    trace!(key = ?key, "Rate limiter denied scheduling");
                    return Schedule {
                        allowed: false,
                        scheduled_time: now,
                        delay: 0.0,
                        limit_decision: Some(decision),
                    };
                }
                Some(decision)
            }
            None => None,
        };

        let mut state = self.state.lock();
        let mut entry = state.remove(key).unwrap_or_default();

        let scheduled_time = match entry.last_scheduled_time {
            None => now,
            Some(last) if self.allow_catch_up => now.max(last + self.min_spacing),
            Some(last) => last + self.min_spacing,
        };
        entry.last_scheduled_time = Some(scheduled_time);
        entry.request_count += 1;
        state.insert(key.clone(), entry);
        drop(state);

        let delay = (scheduled_time - now).max(0.0);
        trace!(key = ?key, scheduled_time, delay, "Scheduled request");
        Schedule {
            allowed: true,
            scheduled_time,
            delay,
            limit_decision,
        }
    }

    /// Forget the pacing state for `key`, releasing its reserved slots.
    pub fn reset(&self, key: &K) {
        self.state.lock().remove(key);
    }

    /// Forget all pacing state.
    pub fn reset_all(&self) {
        self.state.lock().clear();
    }

    /// Number of requests scheduled for `key` since its state was created.
    pub fn request_count(&self, key: &K) -> u64 {
        self.state
            .lock()
            .peek(key)
            .map(|entry| entry.request_count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RateLimiterConfig, WindowSpec};

    const TOLERANCE: f64 = 1e-3;

    fn pacer(target_rate: f64, allow_catch_up: bool) -> RequestPacer<String> {
        let mut config = PacerConfig::new(target_rate);
        config.allow_catch_up = allow_catch_up;
        RequestPacer::new(config).unwrap()
    }

    fn key(name: &str) -> String {
        name.to_string()
    }

    #[test]
    fn test_first_request_schedules_immediately() {
        let pacer = pacer(10.0, false);

        let schedule = pacer.schedule_request_at(&key("k"), 1000.0);
        assert!(schedule.allowed);
        assert_eq!(schedule.scheduled_time, 1000.0);
        assert_eq!(schedule.delay, 0.0);
        assert!(schedule.limit_decision.is_none());
    }

    #[test]
    fn test_strict_mode_spaces_requests() {
        let pacer = pacer(10.0, false);

        for i in 0..4 {
            let schedule = pacer.schedule_request_at(&key("k"), 1000.0);
            let expected = 1000.0 + i as f64 * 0.1;
            assert!(
                (schedule.scheduled_time - expected).abs() < TOLERANCE,
                "request {} scheduled at {}",
                i,
                schedule.scheduled_time
            );
            assert!((schedule.delay - i as f64 * 0.1).abs() < TOLERANCE);
        }
    }

    #[test]
    fn test_strict_mode_queues_past_schedule() {
        let pacer = pacer(1.0, false);
        pacer.schedule_request_at(&key("k"), 1000.0);
        pacer.schedule_request_at(&key("k"), 1000.0);

        // The caller shows up late; strict mode still spaces from the last
        // slot, which may land in the past. Delay floors at zero.
        let schedule = pacer.schedule_request_at(&key("k"), 1005.0);
        assert_eq!(schedule.scheduled_time, 1002.0);
        assert_eq!(schedule.delay, 0.0);
    }

    #[test]
    fn test_catch_up_mode_snaps_to_now() {
        let pacer = pacer(5.0, true);

        let schedule = pacer.schedule_request_at(&key("k"), 1000.0);
        assert_eq!(schedule.scheduled_time, 1000.0);

        // Elapsed wall time already satisfies the spacing.
        let schedule = pacer.schedule_request_at(&key("k"), 1001.0);
        assert_eq!(schedule.scheduled_time, 1001.0);
        assert_eq!(schedule.delay, 0.0);
    }

    #[test]
    fn test_catch_up_mode_still_spaces_hot_callers() {
        let pacer = pacer(5.0, true);
        pacer.schedule_request_at(&key("k"), 1000.0);

        let schedule = pacer.schedule_request_at(&key("k"), 1000.0);
        assert!((schedule.scheduled_time - 1000.2).abs() < TOLERANCE);
        assert!((schedule.delay - 0.2).abs() < TOLERANCE);
    }

    #[test]
    fn test_keys_pace_independently() {
        let pacer = pacer(1.0, false);
        pacer.schedule_request_at(&key("a"), 1000.0);

        let schedule = pacer.schedule_request_at(&key("b"), 1000.0);
        assert_eq!(schedule.delay, 0.0);
    }

    #[test]
    fn test_reset_releases_reserved_slots() {
        let pacer = pacer(1.0, false);
        pacer.schedule_request_at(&key("k"), 1000.0);
        pacer.schedule_request_at(&key("k"), 1000.0);

        pacer.reset(&key("k"));

        let schedule = pacer.schedule_request_at(&key("k"), 1000.0);
        assert_eq!(schedule.scheduled_time, 1000.0);
        assert_eq!(pacer.request_count(&key("k")), 1);
    }

    #[test]
    fn test_reset_all() {
        let pacer = pacer(1.0, false);
        pacer.schedule_request_at(&key("a"), 1000.0);
        pacer.schedule_request_at(&key("b"), 1000.0);

        pacer.reset_all();

        assert_eq!(pacer.request_count(&key("a")), 0);
        assert_eq!(pacer.request_count(&key("b")), 0);
    }

    #[test]
    fn test_request_count() {
        let pacer = pacer(100.0, false);
        assert_eq!(pacer.request_count(&key("k")), 0);

        for _ in 0..3 {
            pacer.schedule_request_at(&key("k"), 1000.0);
        }
        assert_eq!(pacer.request_count(&key("k")), 3);
    }

    #[test]
    fn test_composed_limiter_denies() {
        let limiter = Arc::new(
            RateLimiter::new(RateLimiterConfig::new(vec![WindowSpec::new(60.0, 1)])).unwrap(),
        );
        let pacer = pacer(10.0, false).with_rate_limiter(limiter);

        let first = pacer.schedule_request_at(&key("k"), 1000.0);
        assert!(first.allowed);
        assert!(first.limit_decision.is_some());

        let second = pacer.schedule_request_at(&key("k"), 1000.0);
        assert!(!second.allowed);
        assert_eq!(second.scheduled_time, 1000.0);
        assert_eq!(second.delay, 0.0);
        let decision = second.limit_decision.unwrap();
        assert!(!decision.allowed);
    }

    #[test]
    fn test_composed_limiter_consumes_budget() {
        let limiter = Arc::new(
            RateLimiter::new(RateLimiterConfig::new(vec![WindowSpec::new(60.0, 5)])).unwrap(),
        );
        let pacer = pacer(10.0, false).with_rate_limiter(Arc::clone(&limiter));

        pacer.schedule_request_at(&key("k"), 1000.0);
        pacer.schedule_request_at(&key("k"), 1000.0);

        let decision = limiter.check_limit_at(&key("k"), 1000.0);
        assert_eq!(decision.current_attempts, 2);
    }

    #[test]
    fn test_denied_request_takes_no_pacing_slot() {
        let limiter = Arc::new(
            RateLimiter::new(RateLimiterConfig::new(vec![WindowSpec::new(60.0, 1)])).unwrap(),
        );
        let pacer = pacer(1.0, false).with_rate_limiter(limiter);

        pacer.schedule_request_at(&key("k"), 1000.0);
        pacer.schedule_request_at(&key("k"), 1000.0); // denied

        assert_eq!(pacer.request_count(&key("k")), 1);
    }

    #[tokio::test]
    async fn test_concurrent_scheduling_assigns_distinct_slots() {
        let pacer: Arc<RequestPacer<String>> = Arc::new(pacer(10.0, false));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pacer = Arc::clone(&pacer);
            handles.push(tokio::spawn(async move {
                let mut times = Vec::new();
                for _ in 0..5 {
                    times.push(pacer.schedule_request_at(&"k".to_string(), 1000.0).scheduled_time);
                }
                times
            }));
        }

        let mut times = Vec::new();
        for handle in handles {
            times.extend(handle.await.unwrap());
        }
        times.sort_by(f64::total_cmp);

        for (i, time) in times.iter().enumerate() {
            let expected = 1000.0 + i as f64 * 0.1;
            assert!(
                (time - expected).abs() < TOLERANCE,
                "slot {} scheduled at {}",
                i,
                time
            );
        }
    }
}
