/// Deadline timers for debounced signals and timed notices
///
/// Timers are plain deadlines checked against an explicit `now`, so a view's
/// run loop can sleep until the earliest one and tests can step time by hand.
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Debounce {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    /// Arm or re-arm the timer. Returns `true` if it was idle before.
    pub fn touch(&mut self, now: Instant) -> bool {
        let was_idle = self.deadline.is_none();
        self.deadline = Some(now + self.delay);
        was_idle
    }

    /// Returns `true` exactly once when the deadline has passed.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

/// Sleep until `deadline`, or forever when there is none
pub async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Earliest of a set of optional deadlines
pub fn earliest<I>(deadlines: I) -> Option<Instant>
where
    I: IntoIterator<Item = Option<Instant>>,
{
    deadlines.into_iter().flatten().min()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_resets_deadline() {
        let t0 = Instant::now();
        let mut d = Debounce::new(Duration::from_millis(2000));

        assert!(d.touch(t0));
        assert!(!d.touch(t0 + Duration::from_millis(1500)));
        assert!(!d.fire(t0 + Duration::from_millis(2000)));
        assert!(d.fire(t0 + Duration::from_millis(3500)));
        assert!(!d.fire(t0 + Duration::from_millis(9000)));
    }

    #[test]
    fn test_cancel_disarms() {
        let t0 = Instant::now();
        let mut d = Debounce::new(Duration::from_millis(10));
        d.touch(t0);
        d.cancel();
        assert!(!d.is_armed());
        assert!(!d.fire(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_earliest_skips_idle_timers() {
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(3);
        assert_eq!(earliest([None, Some(later), Some(t0)]), Some(t0));
        assert_eq!(earliest([None, None]), None);
    }
}
