//! Per-key, per-window attempt accounting.

use crate::config::WindowSpec;

/// Attempt counter for one window of one key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct WindowSlot {
    /// Epoch-aligned start of the window this slot counts against
    pub window_start: f64,
    /// Attempts recorded since the window started
    pub attempts: u32,
}

impl WindowSlot {
    fn fresh(spec: &WindowSpec, now: f64) -> Self {
        Self {
            window_start: aligned_start(now, spec.duration_whole_secs()),
            attempts: 0,
        }
    }
}

/// Epoch-aligned window start: the largest whole multiple of the window
/// duration that does not exceed `now`.
pub(crate) fn aligned_start(now: f64, duration_secs: u64) -> f64 {
    ((now as u64 / duration_secs) * duration_secs) as f64
}

/// Full throttling state for one key.
///
/// Slot `i` counts against the `i`-th configured window in ascending
/// duration order. The consecutive-failure counter is a single per-key
/// value and survives window rollover.
#[derive(Debug, Clone)]
pub(crate) struct KeyState {
    pub slots: Vec<WindowSlot>,
    pub consecutive_failures: u32,
    pub last_touched: f64,
}

impl KeyState {
    pub fn new(specs: &[WindowSpec], now: f64) -> Self {
        Self {
            slots: specs.iter().map(|spec| WindowSlot::fresh(spec, now)).collect(),
            consecutive_failures: 0,
            last_touched: now,
        }
    }

    /// Regenerate every slot whose window has rolled over since it was
    /// written. Attempts reset per window; the failure counter does not.
    pub fn roll_windows(&mut self, specs: &[WindowSpec], now: f64) {
        for (slot, spec) in self.slots.iter_mut().zip(specs) {
            let start = aligned_start(now, spec.duration_whole_secs());
            if slot.window_start != start {
                *slot = WindowSlot {
                    window_start: start,
                    attempts: 0,
                };
            }
        }
    }

    /// Count one attempt against every layered window.
    pub fn record_attempt(&mut self) {
        for slot in &mut self.slots {
            slot.attempts = slot.attempts.saturating_add(1);
        }
    }

    /// Whether this key has been idle past the longest window it tracks.
    pub fn is_stale(&self, now: f64, max_duration_secs: u64) -> bool {
        now - self.last_touched > max_duration_secs as f64
    }
}
