//! Composition façade over rate limiting and pacing.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use super::decision::Decision;
use super::epoch_now;
use super::limiter::RateLimiter;
use super::pacer::{RequestPacer, Schedule};

/// Composite outcome of acquiring permission for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquireDecision {
    /// Whether the caller may perform the request
    pub can_proceed: bool,
    /// Seconds to sleep before proceeding, zero when denied
    pub delay: f64,
    /// Suggested wait before retrying; present iff denied
    pub retry_after: Option<f64>,
    /// Decision from the rate limiter, when one was consulted
    pub limit_decision: Option<Decision>,
    /// Schedule from the pacer, when one was consulted
    pub schedule: Option<Schedule>,
}

/// Single acquire/record surface over a rate limiter and a request pacer.
///
/// Either component is optional. `acquire` consumes attempt budget on the
/// allowed path, so callers only pair it with `record_success` and
/// `record_failure` to drive the backoff state; denied calls consume
/// nothing and carry a `retry_after` hint.
pub struct ThrottledClient<K> {
    rate_limiter: Option<Arc<RateLimiter<K>>>,
    pacer: Option<RequestPacer<K>>,
}

impl<K> ThrottledClient<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    /// Create a client with no throttling components. Every acquire is
    /// admitted immediately until components are composed in.
    pub fn new() -> Self {
        Self {
            rate_limiter: None,
            pacer: None,
        }
    }

    /// Compose a rate limiter.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter<K>>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Compose a request pacer.
    pub fn with_pacer(mut self, pacer: RequestPacer<K>) -> Self {
        self.pacer = Some(pacer);
        self
    }

    /// Acquire permission for a request by `key` right now.
    pub fn acquire(&self, key: &K) -> AcquireDecision {
        self.acquire_at(key, epoch_now())
    }

    /// Acquire permission for a request by `key` at `now`.
    ///
    /// The engine never sleeps; a successful acquire reports the delay the
    /// caller should wait out before performing the request.
    pub fn acquire_at(&self, key: &K, now: f64) -> AcquireDecision {
        // A pacer that owns a limiter checks and consumes budget inside
        // scheduling, in one serialized step.
        if let Some(pacer) = &self.pacer {
            if pacer.rate_limiter().is_some() {
                let schedule = pacer.schedule_request_at(key, now);
                return Self::from_schedule(schedule, now);
            }
        }

        // Otherwise gate on the standalone limiter first.
        let limit_decision = match &self.rate_limiter {
            Some(limiter) => {
                let decision = limiter.check_limit_at(key, now);
                if !decision.allowed {
                    return AcquireDecision {
                        can_proceed: false,
                        delay: 0.0,
                        retry_after: Some(retry_after(&decision, now)),
                        limit_decision: Some(decision),
                        schedule: None,
                    };
                }
                limiter.record_attempt_at(key, now);
                Some(decision)
            }
            None => None,
        };

        match &self.pacer {
            Some(pacer) => {
                let schedule = pacer.schedule_request_at(key, now);
                AcquireDecision {
                    can_proceed: true,
                    delay: schedule.delay,
                    retry_after: None,
                    limit_decision,
                    schedule: Some(schedule),
                }
            }
            None => AcquireDecision {
                can_proceed: true,
                delay: 0.0,
                retry_after: None,
                limit_decision,
                schedule: None,
            },
        }
    }

    /// Report a successful outcome for `key`, clearing its backoff.
    pub fn record_success(&self, key: &K) {
        for limiter in self.limiters() {
            limiter.record_success(key);
        }
    }

    /// Report a failed outcome for `key`, escalating its backoff.
    pub fn record_failure(&self, key: &K) {
        for limiter in self.limiters() {
            limiter.record_failure(key);
        }
    }

    /// Forget all throttling state for `key` in every component.
    pub fn reset(&self, key: &K) {
        for limiter in self.limiters() {
            limiter.reset(key);
        }
        if let Some(pacer) = &self.pacer {
            pacer.reset(key);
        }
    }

    /// Distinct limiters reachable through this client: its own and the
    /// pacer's, deduplicated when they are the same instance.
    fn limiters(&self) -> impl Iterator<Item = &Arc<RateLimiter<K>>> {
        let own = self.rate_limiter.as_ref();
        let paced = self
            .pacer
            .as_ref()
            .and_then(|pacer| pacer.rate_limiter())
            .filter(|paced| !own.map_or(false, |own| Arc::ptr_eq(own, *paced)));
        own.into_iter().chain(paced)
    }

    fn from_schedule(schedule: Schedule, now: f64) -> AcquireDecision {
        if schedule.allowed {
            AcquireDecision {
                can_proceed: true,
                delay: schedule.delay,
                retry_after: None,
                limit_decision: schedule.limit_decision.clone(),
                schedule: Some(schedule),
            }
        } else {
            let retry = schedule
                .limit_decision
                .as_ref()
                .map(|decision| retry_after(decision, now));
            AcquireDecision {
                can_proceed: false,
                delay: 0.0,
                retry_after: retry,
                limit_decision: schedule.limit_decision.clone(),
                schedule: Some(schedule),
            }
        }
    }
}

impl<K> Default for ThrottledClient<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Wait hint for a denied decision: the backoff penalty when one applies,
/// otherwise the time until the blocking window rolls over.
fn retry_after(decision: &Decision, now: f64) -> f64 {
    decision.backoff_interval.unwrap_or_else(|| {
        decision
            .next_allowed_attempt
            .map(|at| (at - now).max(0.0))
            .unwrap_or(0.0)
    })
}
