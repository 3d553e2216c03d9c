//! Multi-shot handshake retry timer.
//!
//! Arming the timer at `t` schedules resends at the cumulative offsets of
//! every schedule entry but the last, then a final expiry at the full sum.
//! The caller performs the initial send itself.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::core::HANDSHAKE_RETRY_SCHEDULE;

/// What a due retry deadline asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Send the last packet again.
    Resend,
    /// The schedule is exhausted.
    Expired,
}

/// Retry deadlines for one handshake step.
#[derive(Debug, Clone)]
pub struct MultiTimeout {
    schedule: Vec<Duration>,
    deadlines: VecDeque<(Instant, RetryAction)>,
}

impl Default for MultiTimeout {
    fn default() -> Self {
        Self::new(HANDSHAKE_RETRY_SCHEDULE.to_vec())
    }
}

impl MultiTimeout {
    /// Create an unarmed timer with the given gaps between sends.
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self {
            schedule,
            deadlines: VecDeque::new(),
        }
    }

    /// (Re)arm all deadlines relative to `now`.
    pub fn reset(&mut self, now: Instant) {
        self.deadlines.clear();
        let Some((last, resends)) = self.schedule.split_last() else {
            self.deadlines.push_back((now, RetryAction::Expired));
            return;
        };

        let mut at = now;
        for gap in resends {
            at += *gap;
            self.deadlines.push_back((at, RetryAction::Resend));
        }
        at += *last;
        self.deadlines.push_back((at, RetryAction::Expired));
    }

    /// Disarm every pending deadline.
    pub fn cancel(&mut self) {
        self.deadlines.clear();
    }

    /// Next pending deadline.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.deadlines.front().map(|(at, _)| *at)
    }

    /// Take the earliest deadline if it is due at `now`.
    pub fn poll_due(&mut self, now: Instant) -> Option<RetryAction> {
        match self.deadlines.front() {
            Some((at, _)) if *at <= now => {
                let (_, action) = self.deadlines.pop_front()?;
                if action == RetryAction::Expired {
                    self.deadlines.clear();
                }
                Some(action)
            }
            _ => None,
        }
    }

    /// Total time from arming to expiry.
    pub fn total(&self) -> Duration {
        self.schedule.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(timer: &mut MultiTimeout, start: Instant, until: Duration) -> Vec<(u64, RetryAction)> {
        let mut fired = Vec::new();
        let mut now = start;
        while now <= start + until {
            while let Some(action) = timer.poll_due(now) {
                fired.push(((now - start).as_millis() as u64, action));
            }
            now += Duration::from_millis(100);
        }
        fired
    }

    #[test]
    fn test_default_schedule() {
        let start = Instant::now();
        let mut timer = MultiTimeout::default();
        timer.reset(start);

        let fired = drain(&mut timer, start, Duration::from_secs(40));
        assert_eq!(
            fired,
            vec![
                (1000, RetryAction::Resend),
                (2000, RetryAction::Resend),
                (4000, RetryAction::Resend),
                (7000, RetryAction::Resend),
                (12000, RetryAction::Resend),
                (20000, RetryAction::Resend),
                (33000, RetryAction::Expired),
            ]
        );
        assert_eq!(timer.poll_timeout(), None);
        assert_eq!(timer.total(), Duration::from_secs(33));
    }

    #[test]
    fn test_not_expired_before_total() {
        let start = Instant::now();
        let mut timer = MultiTimeout::default();
        timer.reset(start);

        let almost = start + Duration::from_millis(32_900);
        let mut actions = Vec::new();
        while let Some(action) = timer.poll_due(almost) {
            actions.push(action);
        }
        assert_eq!(actions.len(), 6);
        assert!(actions.iter().all(|a| *a == RetryAction::Resend));
        assert_eq!(timer.poll_timeout(), Some(start + Duration::from_secs(33)));
    }

    #[test]
    fn test_reset_rearms() {
        let start = Instant::now();
        let mut timer = MultiTimeout::default();
        timer.reset(start);
        assert_eq!(timer.poll_due(start + Duration::from_secs(1)), Some(RetryAction::Resend));

        let later = start + Duration::from_millis(1500);
        timer.reset(later);
        assert_eq!(timer.poll_timeout(), Some(later + Duration::from_secs(1)));
    }

    #[test]
    fn test_cancel() {
        let start = Instant::now();
        let mut timer = MultiTimeout::default();
        timer.reset(start);
        timer.cancel();
        assert_eq!(timer.poll_timeout(), None);
        assert_eq!(timer.poll_due(start + Duration::from_secs(100)), None);
    }

    #[test]
    fn test_empty_schedule_expires_immediately() {
        let start = Instant::now();
        let mut timer = MultiTimeout::new(Vec::new());
        timer.reset(start);
        assert_eq!(timer.poll_due(start), Some(RetryAction::Expired));
    }
}
