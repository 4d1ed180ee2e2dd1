//! NewReno-style congestion control.
//!
//! Formulas are pinned exactly rather than left to a generic CC trait: slow
//! start grows the window by the full acknowledged byte count, congestion
//! avoidance grows it by `1500 * acked / cwnd`, and a loss shrinks it either
//! by the fast-convergence factor (0.6) or the standard multiplicative
//! decrease (0.75) depending on whether the window was still climbing past
//! its previous maximum.

/// Window never shrinks below this floor, so a pathological loss run can't
/// stall the connection indefinitely.
pub const CWND_FLOOR: u64 = 10_000;

/// Initial congestion window, in bytes.
pub const INITIAL_CWND: u64 = 100_000;

/// Bytes credited per acknowledged byte during congestion avoidance.
const CONGESTION_AVOIDANCE_CONSTANT: u64 = 1500;

/// Fraction of `cwnd` that must be in flight before the sender is considered
/// congestion-window-limited (as opposed to application-limited).
const APP_LIMITED_THRESHOLD: f64 = 0.8;

/// NewReno congestion window, tracking the state needed for fast convergence.
#[derive(Debug, Clone, Copy)]
pub struct CongestionController {
    cwnd: u64,
    ssthresh: f64,
    w_max: u64,
    floor: u64,
}

impl Default for CongestionController {
    fn default() -> Self {
        Self::new(INITIAL_CWND, CWND_FLOOR)
    }
}

impl CongestionController {
    /// A fresh controller in slow start, with `initial_cwnd` bytes of window
    /// and a floor of `cwnd_floor` bytes below which it will never shrink.
    #[must_use]
    pub fn new(initial_cwnd: u64, cwnd_floor: u64) -> Self {
        Self {
            cwnd: initial_cwnd,
            ssthresh: f64::INFINITY,
            w_max: 0,
            floor: cwnd_floor,
        }
    }

    /// Current congestion window, in bytes.
    #[must_use]
    pub fn cwnd(&self) -> u64 {
        self.cwnd
    }

    /// Whether the controller is still in slow start.
    #[must_use]
    pub fn in_slow_start(&self) -> bool {
        (self.cwnd as f64) < self.ssthresh
    }

    /// Whether `bytes_in_flight` indicates the sender is limited by the
    /// congestion window rather than by having nothing more to send.
    #[must_use]
    pub fn is_window_limited(&self, bytes_in_flight: u64) -> bool {
        (bytes_in_flight as f64) >= APP_LIMITED_THRESHOLD * self.cwnd as f64
    }

    /// Credit `acked_bytes` newly acknowledged bytes, only when the sender
    /// was window-limited at the time (otherwise the ack reflects idle
    /// capacity, not a usable growth signal).
    pub fn on_ack(&mut self, acked_bytes: u64, was_window_limited: bool) {
        if !was_window_limited {
            return;
        }
        if self.in_slow_start() {
            self.cwnd += acked_bytes;
        } else {
            let growth = (CONGESTION_AVOIDANCE_CONSTANT * acked_bytes) / self.cwnd.max(1);
            self.cwnd += growth.max(1);
        }
    }

    /// React to a detected loss.
    pub fn on_loss(&mut self) -> LossResponse {
        let fast_convergence = self.cwnd < self.w_max;
        self.w_max = self.cwnd;

        let factor = if fast_convergence { 0.6 } else { 0.75 };
        let shrunk = ((self.cwnd as f64) * factor) as u64;
        self.cwnd = shrunk.max(self.floor);
        self.ssthresh = self.cwnd as f64;

        LossResponse { fast_convergence }
    }

    /// CUBIC-style scaling constant derived from the last loss event;
    /// unused by NewReno growth but retained for a future CUBIC controller.
    #[must_use]
    pub fn k_scaling(&self) -> f64 {
        (self.w_max as f64 / 16.0).cbrt() * 1000.0
    }
}

/// Outcome of processing a loss event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossResponse {
    /// Whether the fast-convergence (0.6x) factor was applied instead of 0.75x.
    pub fast_convergence: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_spec_initial_window() {
        let cc = CongestionController::new(INITIAL_CWND, CWND_FLOOR);
        assert_eq!(cc.cwnd(), INITIAL_CWND);
        assert!(cc.in_slow_start());
    }

    #[test]
    fn slow_start_grows_by_full_ack() {
        let mut cc = CongestionController::new(INITIAL_CWND, CWND_FLOOR);
        cc.on_ack(1000, true);
        assert_eq!(cc.cwnd(), INITIAL_CWND + 1000);
    }

    #[test]
    fn app_limited_acks_do_not_grow_window() {
        let mut cc = CongestionController::new(INITIAL_CWND, CWND_FLOOR);
        cc.on_ack(1000, false);
        assert_eq!(cc.cwnd(), INITIAL_CWND);
    }

    #[test]
    fn loss_without_prior_loss_applies_standard_decrease() {
        let mut cc = CongestionController::new(INITIAL_CWND, CWND_FLOOR);
        let response = cc.on_loss();
        assert!(!response.fast_convergence);
        assert_eq!(cc.cwnd(), ((INITIAL_CWND as f64) * 0.75) as u64);
    }

    #[test]
    fn loss_while_below_previous_max_applies_fast_convergence() {
        let mut cc = CongestionController::new(INITIAL_CWND, CWND_FLOOR);
        cc.on_loss(); // w_max = 100_000, cwnd -> 75_000
        cc.on_ack(5_000, true); // climbs back up, still below w_max
        let response = cc.on_loss();
        assert!(response.fast_convergence);
    }

    #[test]
    fn window_never_shrinks_below_floor() {
        let mut cc = CongestionController::new(INITIAL_CWND, CWND_FLOOR);
        for _ in 0..50 {
            cc.on_loss();
        }
        assert_eq!(cc.cwnd(), CWND_FLOOR);
    }
}
