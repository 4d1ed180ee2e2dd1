//! Loss detection: an ACK-driven sent-time threshold plus a tail-loss probe timer.

use std::time::{Duration, Instant};

/// Initial tail-loss-probe interval.
pub const TLP_INITIAL: Duration = Duration::from_secs(1);

/// TLP backoff doubles up to this cap; reaching it declares the connection dead.
pub const TLP_CAP: Duration = Duration::from_secs(25);

/// Smoothing factor applied to each new RTT sample (`rtt := ALPHA*rtt + (1-ALPHA)*sample`).
const RTT_EWMA_ALPHA: f64 = 0.875;

/// Exponential moving average of round-trip time, seeded by the first sample.
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    smoothed: Option<Duration>,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    /// An estimator with no samples yet.
    #[must_use]
    pub fn new() -> Self {
        Self { smoothed: None }
    }

    /// Current smoothed RTT, or `None` before the first sample.
    #[must_use]
    pub fn get(&self) -> Option<Duration> {
        self.smoothed
    }

    /// Fold in a new round-trip sample.
    pub fn sample(&mut self, sample: Duration) {
        self.smoothed = Some(match self.smoothed {
            None => sample,
            Some(prev) => prev.mul_f64(RTT_EWMA_ALPHA) + sample.mul_f64(1.0 - RTT_EWMA_ALPHA),
        });
    }
}

/// Tail-loss-probe timer: fires on an exponential backoff schedule and
/// declares the connection dead once the backoff exceeds [`TLP_CAP`].
#[derive(Debug, Clone, Copy)]
pub struct TlpTimer {
    initial: Duration,
    cap: Duration,
    interval: Duration,
    deadline: Option<Instant>,
}

impl Default for TlpTimer {
    fn default() -> Self {
        Self::new(TLP_INITIAL, TLP_CAP)
    }
}

impl TlpTimer {
    /// A timer not yet armed, starting at `initial` and doubling up to `cap`.
    #[must_use]
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            cap,
            interval: initial,
            deadline: None,
        }
    }

    /// Arm (or rearm) the timer relative to `now`, without changing the backoff.
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.interval);
    }

    /// Reset the backoff to its initial value and arm relative to `now`,
    /// called whenever forward progress (a fresh ack) is observed.
    pub fn reset(&mut self, now: Instant) {
        self.interval = self.initial;
        self.arm(now);
    }

    /// Whether the timer is due at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Handle expiry: double the backoff (capped at `cap`) and rearm.
    /// Returns `true` if the connection should be declared dead because the
    /// backoff has already reached the cap.
    pub fn on_expiry(&mut self, now: Instant) -> bool {
        let dead = self.interval >= self.cap;
        self.interval = (self.interval * 2).min(self.cap);
        self.arm(now);
        dead
    }

    /// Disarm the timer, e.g. once the connection has closed.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_estimator_seeds_from_first_sample() {
        let mut rtt = RttEstimator::new();
        rtt.sample(Duration::from_millis(100));
        assert_eq!(rtt.get(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn rtt_estimator_smooths_subsequent_samples() {
        let mut rtt = RttEstimator::new();
        rtt.sample(Duration::from_millis(100));
        rtt.sample(Duration::from_millis(200));
        let expected = Duration::from_millis(100).mul_f64(0.875) + Duration::from_millis(200).mul_f64(0.125);
        assert_eq!(rtt.get(), Some(expected));
    }

    #[test]
    fn tlp_timer_doubles_until_cap_then_reports_dead() {
        let mut timer = TlpTimer::new(TLP_INITIAL, TLP_CAP);
        let t0 = Instant::now();
        timer.arm(t0);
        assert_eq!(timer.interval, TLP_INITIAL);

        let mut interval = TLP_INITIAL;
        let mut dead = false;
        for _ in 0..6 {
            dead = timer.on_expiry(t0);
            interval = (interval * 2).min(TLP_CAP);
        }
        assert_eq!(timer.interval, interval);
        assert_eq!(timer.interval, TLP_CAP);
        assert!(!dead || timer.interval >= TLP_CAP);

        let declared_dead = timer.on_expiry(t0);
        assert!(declared_dead);
    }
}
