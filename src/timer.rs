use serde::{Deserialize, Serialize};

/// One-shot countdown owned by a single monitor.
///
/// At most one deadline exists at a time: arming replaces any pending
/// deadline, and firing consumes it. Time is milliseconds on the caller's
/// clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountdownTimer {
    deadline_ms: Option<u64>,
}

impl CountdownTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel-then-rearm in one step.
    pub fn arm(&mut self, now_ms: u64, duration_secs: u32) {
        self.deadline_ms = Some(now_ms.saturating_add(u64::from(duration_secs) * 1000));
    }

    /// Returns true if a pending deadline was dropped.
    pub fn cancel(&mut self) -> bool {
        self.deadline_ms.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.deadline_ms.is_some()
    }

    pub fn deadline_ms(&self) -> Option<u64> {
        self.deadline_ms
    }

    pub fn remaining_ms(&self, now_ms: u64) -> Option<u64> {
        self.deadline_ms.map(|deadline| deadline.saturating_sub(now_ms))
    }

    /// Consume the deadline if it has passed. Fires at most once per arm.
    pub fn poll_expired(&mut self, now_ms: u64) -> bool {
        match self.deadline_ms {
            Some(deadline) if now_ms >= deadline => {
                self.deadline_ms = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_once() {
        let mut timer = CountdownTimer::new();
        timer.arm(1000, 5);
        assert_eq!(timer.deadline_ms(), Some(6000));

        assert!(!timer.poll_expired(5999));
        assert!(timer.poll_expired(6000));
        assert!(!timer.poll_expired(7000));
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_rearm_replaces_deadline() {
        let mut timer = CountdownTimer::new();
        timer.arm(0, 10);
        timer.arm(8000, 10);

        assert!(!timer.poll_expired(10_000));
        assert_eq!(timer.remaining_ms(10_000), Some(8000));
        assert!(timer.poll_expired(18_000));
    }

    #[test]
    fn test_cancel() {
        let mut timer = CountdownTimer::new();
        assert!(!timer.cancel());
        timer.arm(0, 1);
        assert!(timer.cancel());
        assert!(!timer.poll_expired(u64::MAX));
    }
}
