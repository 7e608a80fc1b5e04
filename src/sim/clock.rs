//! Virtual clock shared between the scheduler and the stacks it drives

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

/// Handle onto the simulation clock.
///
/// Clones share the same underlying time; the scheduler advances it as
/// events are dispatched, everyone else only reads. Time never goes
/// backwards.
#[derive(Debug, Clone, Default)]
pub struct Clock {
    now: Rc<Cell<Duration>>,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current simulated time since simulation start.
    pub fn now(&self) -> Duration {
        self.now.get()
    }

    /// Advance to an absolute time. Panics on regression.
    pub fn advance_to(&self, time: Duration) {
        assert!(
            time >= self.now.get(),
            "clock regression: {:?} -> {:?}",
            self.now.get(),
            time
        );
        self.now.set(time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_starts_at_zero() {
        let clock = Clock::new();
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn test_clones_share_time() {
        let clock = Clock::new();
        let other = clock.clone();
        clock.advance_to(Duration::from_millis(5));
        assert_eq!(other.now(), Duration::from_millis(5));
    }

    #[test]
    #[should_panic(expected = "clock regression")]
    fn test_regression_panics() {
        let clock = Clock::new();
        clock.advance_to(Duration::from_secs(1));
        clock.advance_to(Duration::from_millis(1));
    }
}
