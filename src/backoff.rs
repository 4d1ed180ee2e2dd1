//! Exponential backoff schedule shared by the handshake, close, and stream
//! skip/flush retry timers — each only differs in initial interval and cap.

use std::time::{Duration, Instant};

/// A retry schedule that doubles its interval on every expiry up to `cap`,
/// and reports "give up" once a further doubling would exceed it.
#[derive(Debug, Clone, Copy)]
pub struct BackoffTimer {
    interval: Duration,
    cap: Duration,
    deadline: Option<Instant>,
}

impl BackoffTimer {
    /// A timer starting at `initial` and capping at `cap`, not yet armed.
    #[must_use]
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            interval: initial,
            cap,
            deadline: None,
        }
    }

    /// Arm the timer for its current interval, relative to `now`.
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.interval);
    }

    /// Whether the timer is due.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Handle expiry: double the interval (capped) and rearm. Returns `true`
    /// if the schedule had already reached its cap, meaning the caller
    /// should give up instead of retrying again.
    pub fn on_expiry(&mut self, now: Instant) -> bool {
        let exhausted = self.interval >= self.cap;
        self.interval = (self.interval * 2).min(self.cap);
        self.arm(now);
        exhausted
    }

    /// Disarm the timer, e.g. once the awaited confirmation has arrived.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Whether the timer is currently armed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap_then_reports_exhausted() {
        let mut timer = BackoffTimer::new(Duration::from_secs(1), Duration::from_secs(8));
        let now = Instant::now();
        timer.arm(now);

        assert!(!timer.on_expiry(now)); // 1 -> 2
        assert!(!timer.on_expiry(now)); // 2 -> 4
        assert!(!timer.on_expiry(now)); // 4 -> 8
        assert!(timer.on_expiry(now)); // already at cap
    }

    #[test]
    fn disarm_clears_expiry() {
        let mut timer = BackoffTimer::new(Duration::from_secs(1), Duration::from_secs(8));
        timer.arm(Instant::now());
        timer.disarm();
        assert!(!timer.is_armed());
    }
}
