//! Congestion control and pacing.
//!
//! A controller turns round-trip samples into a pacing interval and a
//! retransmit timeout. [`Chicago`] is the default; [`Remy`] drives the same
//! interface from a precomputed decision tree.

mod chicago;
mod remy;

use std::fmt;
use std::time::{Duration, Instant};

pub use chicago::Chicago;
pub use remy::{Memory, MemoryRange, Remy, Whisker, WhiskerTree};

/// Interface between the reliable stream and a congestion controller.
pub trait CongestionController: Send + fmt::Debug {
    /// Feed one round-trip sample measured at `now`.
    fn on_sample(&mut self, now: Instant, rtt: Duration);

    /// Report that a chunk is being retransmitted.
    fn on_timeout(&mut self, now: Instant);

    /// Record that a data-bearing message left at `now`.
    fn on_send(&mut self, now: Instant);

    /// How long to wait before the next message may be sent.
    fn next_send_delay(&self, now: Instant) -> Duration;

    /// Retransmit timeout for a chunk last sent at `last_sent`.
    fn retransmit_timeout(&self, now: Instant, last_sent: Option<Instant>) -> Duration;

    /// Maximum messages in flight, or `None` for no limit.
    fn window(&self) -> Option<u32>;
}

impl<T: CongestionController + ?Sized> CongestionController for Box<T> {
    fn on_sample(&mut self, now: Instant, rtt: Duration) {
        (**self).on_sample(now, rtt)
    }

    fn on_timeout(&mut self, now: Instant) {
        (**self).on_timeout(now)
    }

    fn on_send(&mut self, now: Instant) {
        (**self).on_send(now)
    }

    fn next_send_delay(&self, now: Instant) -> Duration {
        (**self).next_send_delay(now)
    }

    fn retransmit_timeout(&self, now: Instant, last_sent: Option<Instant>) -> Duration {
        (**self).retransmit_timeout(now, last_sent)
    }

    fn window(&self) -> Option<u32> {
        (**self).window()
    }
}

/// Seconds between `since` and `now`, zero if `since` is later.
pub(crate) fn elapsed(now: Instant, since: Instant) -> f64 {
    now.saturating_duration_since(since).as_secs_f64()
}

/// Convert controller seconds to a `Duration`, clamping negative and
/// non-finite values.
pub(crate) fn seconds(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

/// Shared pacing rule: wait until `last_sent + interval`.
pub(crate) fn pacing_delay(now: Instant, last_sent: Option<Instant>, interval: f64) -> Duration {
    match last_sent {
        None => Duration::ZERO,
        Some(at) => seconds(interval - elapsed(now, at)),
    }
}

/// Shared retransmit rule from the time the chunk was last sent.
pub(crate) fn timeout_since(now: Instant, last_sent: Option<Instant>, timeout: f64) -> Duration {
    match last_sent {
        None => seconds(timeout),
        Some(at) => seconds(elapsed(now, at) + timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_clamps() {
        assert_eq!(seconds(-1.0), Duration::ZERO);
        assert_eq!(seconds(f64::NAN), Duration::ZERO);
        assert_eq!(seconds(f64::INFINITY), Duration::MAX);
        assert_eq!(seconds(0.5), Duration::from_millis(500));
    }

    #[test]
    fn test_pacing_delay() {
        let start = Instant::now();
        assert_eq!(pacing_delay(start, None, 1.0), Duration::ZERO);
        assert_eq!(
            pacing_delay(start + Duration::from_millis(250), Some(start), 1.0),
            Duration::from_millis(750)
        );
        assert_eq!(
            pacing_delay(start + Duration::from_secs(2), Some(start), 1.0),
            Duration::ZERO
        );
    }
}
