// Coalescing timer: arm on every mutation, fire once after a quiet window.
// The caller owns the clock and passes `now` in, so the worker loop can size
// its blocking wait with `time_until_due` and tests can step time by hand.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, deadline: None }
    }

    /// (Re)start the quiet window from `now`.
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.window);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Returns true exactly once per armed window, then disarms.
    pub fn take_due(&mut self, now: Instant) -> bool {
        if self.due(now) {
            self.deadline = None;
            true
        } else {
            false
        }
    }

    /// Time left before firing. `None` when disarmed.
    pub fn time_until_due(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(100);

    #[test]
    fn fires_once_after_quiet_window() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        assert!(!d.take_due(t0 + WINDOW * 5));

        d.arm(t0);
        assert!(!d.take_due(t0 + Duration::from_millis(99)));
        assert!(d.take_due(t0 + WINDOW));
        assert!(!d.take_due(t0 + WINDOW * 2));
        assert!(!d.is_armed());
    }

    #[test]
    fn rearming_pushes_deadline() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.arm(t0);
        d.arm(t0 + Duration::from_millis(80));
        assert!(!d.due(t0 + Duration::from_millis(150)));
        assert_eq!(
            d.time_until_due(t0 + Duration::from_millis(150)),
            Some(Duration::from_millis(30))
        );
        assert!(d.take_due(t0 + Duration::from_millis(180)));
    }

    #[test]
    fn cancel_disarms() {
        let t0 = Instant::now();
        let mut d = Debouncer::new(WINDOW);
        d.arm(t0);
        d.cancel();
        assert_eq!(d.time_until_due(t0), None);
        assert!(!d.take_due(t0 + WINDOW));
    }
}
