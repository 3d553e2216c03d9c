//! The "Chicago" pacing heuristic.
//!
//! RTT is smoothed into an average and deviation, plus slow high- and
//! low-water marks used to spot sustained congestion edges. The pacing
//! interval accelerates with a cubic decay, backs off on edges and halves
//! when the path has been quiet long enough. All state is in seconds.

use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::{debug, trace};

use super::{CongestionController, elapsed, pacing_delay, seconds, timeout_since};

/// Intervals at or above this (131.072 µs) take the acceleration step.
const ACCELERATE_FLOOR: f64 = 0.000_131_072;
/// Below this (16.777216 ms) the cubic form is used.
const CUBIC_CEILING: f64 = 0.016_777_216;
const ACCELERATION: f64 = 444.0892;
/// Halving stops at roughly 66 µs per message.
const HALVING_FLOOR: f64 = 0.000_066;
const EDGE_WINDOW: f64 = 60.0;
const RATE_RESET_AFTER: f64 = 10.0;
const HIGHWATER_MARGIN: f64 = 0.005;

/// Default Chicago controller.
#[derive(Debug, Clone)]
pub struct Chicago {
    rtt_average: f64,
    rtt_deviation: f64,
    rtt_highwater: f64,
    rtt_lowwater: f64,
    rtt_timeout: f64,
    phase: u8,
    seen_older_high: bool,
    seen_older_low: bool,
    last_speed_adjustment: Instant,
    last_edge: Option<Instant>,
    last_doubling: Option<Instant>,
    last_panic: Option<Instant>,
    sec_per_message: f64,
    last_sent_at: Option<Instant>,
    rng: StdRng,
}

impl Chicago {
    /// Create a controller whose speed-adjustment clock starts at `now`.
    pub fn new(now: Instant, rng: StdRng) -> Self {
        Self {
            rtt_average: 0.0,
            rtt_deviation: 0.0,
            rtt_highwater: 0.0,
            rtt_lowwater: 0.0,
            rtt_timeout: 1.0,
            phase: 0,
            seen_older_high: false,
            seen_older_low: false,
            last_speed_adjustment: now,
            last_edge: None,
            last_doubling: None,
            last_panic: None,
            sec_per_message: 0.0,
            last_sent_at: None,
            rng,
        }
    }

    /// Create a controller with an RNG seeded from `seed`.
    pub fn with_seed(now: Instant, seed: u64) -> Self {
        Self::new(now, StdRng::seed_from_u64(seed))
    }

    /// Current pacing interval in seconds per message.
    pub fn sec_per_message(&self) -> f64 {
        self.sec_per_message
    }

    /// Smoothed RTT in seconds.
    pub fn rtt_average(&self) -> f64 {
        self.rtt_average
    }

    /// Current retransmit timeout in seconds.
    pub fn rtt_timeout(&self) -> f64 {
        self.rtt_timeout
    }

    fn process_delta(&mut self, now: Instant, rtt: f64) {
        if self.rtt_average == 0.0 {
            self.sec_per_message = rtt;
            self.rtt_average = rtt;
            self.rtt_deviation = rtt / 2.0;
            self.rtt_highwater = rtt;
            self.rtt_lowwater = rtt;
        }

        let delta = rtt - self.rtt_average;
        self.rtt_average += delta / 8.0;
        let delta = delta.abs() - self.rtt_deviation;
        self.rtt_deviation += delta / 4.0;
        self.rtt_timeout =
            self.rtt_average + 4.0 * self.rtt_deviation + 8.0 * self.sec_per_message;

        self.rtt_highwater += (rtt - self.rtt_highwater) / 1024.0;
        let delta = rtt - self.rtt_lowwater;
        if delta > 0.0 {
            self.rtt_lowwater += delta / 8192.0;
        } else {
            self.rtt_lowwater += delta / 256.0;
        }

        if elapsed(now, self.last_speed_adjustment) < 16.0 * self.sec_per_message {
            self.final_adjustments(now);
            return;
        }

        if elapsed(now, self.last_speed_adjustment) > RATE_RESET_AFTER {
            self.sec_per_message = 1.0 + self.rng.gen_range(0.0..1.0) * 0.125;
        }
        if self.sec_per_message >= ACCELERATE_FLOOR {
            let t = self.sec_per_message;
            self.sec_per_message = if t < CUBIC_CEILING {
                t - ACCELERATION * t.powi(3)
            } else {
                t / (1.0 + t * t / ACCELERATION)
            };
        }
        self.last_speed_adjustment = now;

        if self.phase == 0 {
            if self.seen_older_high {
                self.phase = 1;
                self.last_edge = Some(now);
                self.sec_per_message +=
                    self.sec_per_message * self.rng.gen_range(0.0..1.0) * 0.25;
                debug!(spm = self.sec_per_message, "congestion edge, backing off");
            } else if self.seen_older_low {
                self.phase = 0;
            }
        }

        self.seen_older_high = false;
        self.seen_older_low = false;
        if self.rtt_average > self.rtt_highwater + HIGHWATER_MARGIN {
            self.seen_older_high = true;
        } else if self.rtt_average < self.rtt_lowwater {
            self.seen_older_low = true;
        }

        self.final_adjustments(now);
    }

    fn final_adjustments(&mut self, now: Instant) {
        let since_doubling = |window: f64| {
            self.last_doubling
                .is_some_and(|at| elapsed(now, at) < window)
        };

        if self.last_edge.is_some_and(|at| elapsed(now, at) < EDGE_WINDOW) {
            if since_doubling(4.0 * self.sec_per_message * 64.0 + self.rtt_timeout + 5.0) {
                return;
            }
        } else if since_doubling(4.0 * self.sec_per_message + 2.0 * self.rtt_timeout) {
            return;
        } else if self.sec_per_message <= HALVING_FLOOR {
            return;
        }

        self.sec_per_message /= 2.0;
        self.last_doubling = Some(now);
        if self.last_edge.is_some() {
            self.last_edge = Some(now);
        }
    }
}

impl CongestionController for Chicago {
    fn on_sample(&mut self, now: Instant, rtt: Duration) {
        self.process_delta(now, rtt.as_secs_f64());
        trace!(
            rtt_avg = self.rtt_average,
            timeout = self.rtt_timeout,
            spm = self.sec_per_message,
            "rtt sample"
        );
    }

    fn on_timeout(&mut self, now: Instant) {
        let due = self
            .last_panic
            .is_none_or(|at| elapsed(now, at) > 4.0 * self.rtt_timeout);
        if due {
            self.sec_per_message *= 2.0;
            self.last_panic = Some(now);
            self.last_edge = Some(now);
            debug!(spm = self.sec_per_message, "loss, doubling send interval");
        }
    }

    fn on_send(&mut self, now: Instant) {
        self.last_sent_at = Some(now);
    }

    fn next_send_delay(&self, now: Instant) -> Duration {
        pacing_delay(now, self.last_sent_at, self.sec_per_message)
    }

    fn retransmit_timeout(&self, now: Instant, last_sent: Option<Instant>) -> Duration {
        timeout_since(now, last_sent, self.rtt_timeout)
    }

    fn window(&self) -> Option<u32> {
        None
    }
}
