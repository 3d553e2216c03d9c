//! Table-driven "Remy" controller.
//!
//! A [`WhiskerTree`] partitions the observed network state into domains; the
//! leaf ("whisker") covering the current state dictates window growth and
//! pacing directly. Trees are loaded from JSON.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use super::{CongestionController, elapsed, pacing_delay, seconds, timeout_since};

const ALPHA: f64 = 1.0 / 8.0;
const SLOW_ALPHA: f64 = 1.0 / 256.0;
const INITIAL_TIMEOUT: f64 = 10.0;
const RTT_TIMEOUT_FLOOR: f64 = 2.0;

/// Observed network state.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Memory {
    /// Fast EWMA of the interval between acknowledgments.
    pub rec_rec_ewma: f64,
    /// Slow EWMA of the interval between acknowledgments.
    pub slow_rec_rec_ewma: f64,
    /// Current RTT over the minimum RTT seen.
    pub rtt_ratio: f64,
}

/// An axis-aligned box of [`Memory`] values, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MemoryRange {
    /// Lower corner.
    pub lower: Memory,
    /// Upper corner.
    pub upper: Memory,
}

impl MemoryRange {
    /// True if `m` lies inside the range.
    pub fn contains(&self, m: &Memory) -> bool {
        let within = |lo: f64, v: f64, hi: f64| lo <= v && v <= hi;
        within(self.lower.rec_rec_ewma, m.rec_rec_ewma, self.upper.rec_rec_ewma)
            && within(
                self.lower.slow_rec_rec_ewma,
                m.slow_rec_rec_ewma,
                self.upper.slow_rec_rec_ewma,
            )
            && within(self.lower.rtt_ratio, m.rtt_ratio, self.upper.rtt_ratio)
    }
}

/// A decision leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Whisker {
    /// Added to the window on every sample.
    pub window_increment: f64,
    /// Multiplies the window on every sample.
    pub window_multiple: f64,
    /// Pacing interval in milliseconds.
    pub intersend: f64,
    /// States this whisker applies to.
    pub domain: MemoryRange,
}

/// A node of the decision tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhiskerTree {
    /// States covered by this subtree.
    pub domain: MemoryRange,
    /// Child subtrees, searched in order.
    #[serde(default)]
    pub children: Vec<WhiskerTree>,
    /// Leaf at this node, if any.
    #[serde(default)]
    pub leaf: Option<Whisker>,
}

impl WhiskerTree {
    /// Parse a tree from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// A tree with a single whisker covering `domain`.
    pub fn single(whisker: Whisker) -> Self {
        Self {
            domain: whisker.domain,
            children: Vec::new(),
            leaf: Some(whisker),
        }
    }

    /// Find the whisker for `memory`.
    pub fn find(&self, memory: &Memory) -> Option<&Whisker> {
        let mut node = self;
        loop {
            if let Some(leaf) = node.leaf.as_ref().filter(|l| l.domain.contains(memory)) {
                return Some(leaf);
            }
            node = node.children.iter().find(|c| c.domain.contains(memory))?;
        }
    }
}

/// Controller driven by a whisker tree.
#[derive(Debug, Clone)]
pub struct Remy {
    tree: Arc<WhiskerTree>,
    last_received_at: Option<Instant>,
    rtt_min: Option<f64>,
    rec_ewma: f64,
    slow_rec_ewma: f64,
    window: f64,
    sampled: bool,
    sec_per_message: f64,
    rtt_timeout: f64,
    last_sent_at: Option<Instant>,
}

impl Remy {
    /// Create a controller over `tree`.
    pub fn new(tree: Arc<WhiskerTree>) -> Self {
        Self {
            tree,
            last_received_at: None,
            rtt_min: None,
            rec_ewma: 0.0,
            slow_rec_ewma: 0.0,
            window: 0.0,
            sampled: false,
            sec_per_message: 0.0,
            rtt_timeout: INITIAL_TIMEOUT,
            last_sent_at: None,
        }
    }

    /// The state the next lookup would use for an RTT of `rtt` seconds.
    pub fn memory(&self, rtt: f64) -> Memory {
        let ratio = match self.rtt_min {
            Some(min) if min > 0.0 => rtt / min,
            _ => 1.0,
        };
        Memory {
            rec_rec_ewma: self.rec_ewma,
            slow_rec_rec_ewma: self.slow_rec_ewma,
            rtt_ratio: ratio,
        }
    }

    /// Pacing interval in seconds.
    pub fn sec_per_message(&self) -> f64 {
        self.sec_per_message
    }
}

impl CongestionController for Remy {
    fn on_sample(&mut self, now: Instant, rtt: Duration) {
        let rtt = rtt.as_secs_f64();
        match (self.rtt_min, self.last_received_at) {
            (Some(min), Some(last)) => {
                let delta = elapsed(now, last);
                self.rec_ewma = (1.0 - ALPHA) * self.rec_ewma + ALPHA * delta;
                self.slow_rec_ewma = (1.0 - SLOW_ALPHA) * self.slow_rec_ewma + SLOW_ALPHA * delta;
                self.rtt_min = Some(min.min(rtt));
            }
            _ => self.rtt_min = Some(rtt),
        }
        self.last_received_at = Some(now);

        let memory = self.memory(rtt);
        let Some(whisker) = self.tree.find(&memory) else {
            warn!(?memory, "no whisker covers the current state");
            return;
        };
        self.window = whisker.window_increment + self.window * whisker.window_multiple;
        self.sec_per_message = whisker.intersend / 1000.0;
        // Never retransmit sooner than two of the fastest round trips seen.
        let floor = RTT_TIMEOUT_FLOOR * self.rtt_min.unwrap_or(rtt);
        self.rtt_timeout = (self.sec_per_message * self.window).max(floor);
        self.sampled = true;
        trace!(window = self.window, spm = self.sec_per_message, "whisker applied");
    }

    fn on_timeout(&mut self, _now: Instant) {}

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
        if !self.sampled {
            return None;
        }
        // Saturating float to int; negative windows clamp to zero.
        Some(self.window.floor() as u32)
    }
}
