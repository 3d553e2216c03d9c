//! Reliable, ordered byte stream over message frames.
//!
//! The stream is sans-IO: the owning connection feeds it decoded frames and
//! timer ticks, then drains outbound frames and application events.
//!
//! # Bookkeeping
//!
//! - `sent`: offsets handed to [`ReliableStream::write`]
//! - `received`: offsets the peer delivered to us (plus its end marker)
//! - `we_acked`: offsets we have told the peer about
//! - `they_acked`: offsets the peer has acknowledged
//!
//! Outbound bytes are split into chunks of at most 1024 bytes that sit in a
//! priority queue ordered by `(priority, offset)`. Retransmissions jump the
//! queue with priority 0; first sends use priority 1.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::core::{IDLE_INTERVAL, MAX_MESSAGE_DATA, StreamError};

use super::congestion::CongestionController;
use super::interval::{Interval, IntervalSet};
use super::message::{MessageFrame, Resolution};

/// Retransmit deadlines never fall closer than this to the send time.
const MIN_RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(1);

const PRIORITY_RETRANSMIT: u8 = 0;
const PRIORITY_DATA: u8 = 1;

/// Handle for a pending write or close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriteId(pub(crate) u64);

/// Something the application should learn about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Newly contiguous bytes from the peer.
    DataReceived(Vec<u8>),
    /// The peer finished writing and every byte has been delivered.
    ReadClosed,
    /// A write or close has been fully acknowledged.
    WriteAcked(WriteId),
    /// Both directions are closed; carries the peer's resolution.
    Finished(Resolution),
}

/// State of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfState {
    /// Transferring.
    Open,
    /// End of stream known, not yet settled.
    Closing,
    /// Settled.
    Closed,
}

#[derive(Debug)]
enum Payload {
    Data(Vec<u8>),
    Resolution(Resolution),
}

#[derive(Debug)]
struct Chunk {
    remaining: IntervalSet,
    lower_bound: u64,
    payload: Payload,
    sent_at: Vec<Instant>,
    message_ids: Vec<u32>,
    retransmit_at: Option<Instant>,
}

impl Chunk {
    fn fill(&self, frame: &mut MessageFrame) {
        frame.data_pos = self.lower_bound;
        match &self.payload {
            Payload::Data(data) => frame.data = data.clone(),
            Payload::Resolution(resolution) => frame.resolution = Some(*resolution),
        }
    }
}

#[derive(Debug)]
struct PendingWrite {
    id: WriteId,
    range: Interval,
    closes: bool,
}

/// The reliable stream engine for one connection.
#[derive(Debug)]
pub struct ReliableStream {
    sent: IntervalSet,
    received: IntervalSet,
    we_acked: IntervalSet,
    they_acked: IntervalSet,

    chunks: BTreeMap<u64, Chunk>,
    next_chunk: u64,
    queue: BinaryHeap<Reverse<(u8, u64, u64)>>,
    enqueued: HashSet<u64>,
    outstanding: usize,
    sent_message_at: HashMap<u32, Instant>,
    counter: u32,

    pending_writes: Vec<PendingWrite>,
    next_write: u64,
    fragments: BTreeMap<u64, Vec<u8>>,

    our_resolution: Option<Resolution>,
    their_end: Option<u64>,
    their_resolution: Option<Resolution>,
    reads: HalfState,
    writes: HalfState,
    done: bool,

    congestion: Box<dyn CongestionController>,
    next_send_at: Option<Instant>,
    window_blocked: bool,

    outbox: VecDeque<MessageFrame>,
    events: VecDeque<StreamEvent>,
}

impl ReliableStream {
    /// Create an open stream whose scheduler first runs at `now`.
    pub fn new(now: Instant, congestion: Box<dyn CongestionController>) -> Self {
        Self {
            sent: IntervalSet::new(),
            received: IntervalSet::new(),
            we_acked: IntervalSet::new(),
            they_acked: IntervalSet::new(),
            chunks: BTreeMap::new(),
            next_chunk: 0,
            queue: BinaryHeap::new(),
            enqueued: HashSet::new(),
            outstanding: 0,
            sent_message_at: HashMap::new(),
            counter: 1,
            pending_writes: Vec::new(),
            next_write: 0,
            fragments: BTreeMap::new(),
            our_resolution: None,
            their_end: None,
            their_resolution: None,
            reads: HalfState::Open,
            writes: HalfState::Open,
            done: false,
            congestion,
            next_send_at: Some(now),
            window_blocked: false,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// Take the next message id for a data-bearing frame. Id 0 is reserved
    /// for pure acknowledgments.
    pub fn take_message_id(&mut self) -> u32 {
        let id = self.counter;
        self.counter = self.counter.wrapping_add(1).max(1);
        id
    }

    /// Queue bytes for delivery.
    ///
    /// The returned handle is reported in [`StreamEvent::WriteAcked`] once the
    /// peer has acknowledged every byte.
    pub fn write(&mut self, now: Instant, data: &[u8]) -> Result<WriteId, StreamError> {
        if self.done {
            return Err(StreamError::ConnectionDone);
        }
        if self.writes != HalfState::Open {
            return Err(StreamError::ConnectionClosing);
        }

        let id = self.next_write_id();
        if data.is_empty() {
            self.events.push_back(StreamEvent::WriteAcked(id));
            return Ok(id);
        }

        let start = self.sent.upper_bound().unwrap_or(0);
        let mut lower = start;
        for piece in data.chunks(MAX_MESSAGE_DATA) {
            let range = Interval::new(lower, lower + piece.len() as u64);
            self.sent.insert(range);
            let key = self.add_chunk(range, lower, Payload::Data(piece.to_vec()));
            self.enqueue(PRIORITY_DATA, key);
            lower = range.end;
        }
        self.pending_writes.push(PendingWrite {
            id,
            range: Interval::new(start, lower),
            closes: false,
        });
        self.reschedule_send(now);
        trace!(len = data.len(), start, "write queued");
        Ok(id)
    }

    /// Close our direction with the given resolution.
    ///
    /// Writes move to closed once everything up to and including the end
    /// marker has been acknowledged.
    pub fn close(&mut self, now: Instant, success: bool) -> Result<WriteId, StreamError> {
        if self.done {
            return Err(StreamError::ConnectionDone);
        }
        if self.writes != HalfState::Open {
            return Err(StreamError::ConnectionClosing);
        }

        let resolution = Resolution::from_success(success);
        let end = self.sent.upper_bound().unwrap_or(0);
        self.our_resolution = Some(resolution);
        let key = self.add_chunk(
            Interval::new(end, end + 1),
            end,
            Payload::Resolution(resolution),
        );
        self.enqueue(PRIORITY_DATA, key);
        self.writes = HalfState::Closing;

        let id = self.next_write_id();
        self.pending_writes.push(PendingWrite {
            id,
            range: Interval::new(0, end + 1),
            closes: true,
        });
        self.reschedule_send(now);
        debug!(end, ?resolution, "closing writes");
        Ok(id)
    }

    /// Process one decoded frame from the peer.
    pub fn handle_frame(&mut self, now: Instant, frame: MessageFrame) {
        if self.done {
            // The peer may still be waiting on the ack for its resolution.
            if !frame.is_pure_ack() {
                let ack = MessageFrame::ack(frame.id, &self.received);
                self.emit(now, ack);
            }
            return;
        }

        if frame.previous_id != 0 {
            if let Some(sent) = self.sent_message_at.remove(&frame.previous_id) {
                self.congestion.on_sample(now, now.saturating_duration_since(sent));
            }
        }

        self.they_acked.extend(frame.ranges.iter().copied());
        self.retire_acked(now);
        self.complete_writes();
        self.absorb(&frame);

        if !frame.is_pure_ack() {
            let ack = MessageFrame::ack(frame.id, &self.received);
            self.emit(now, ack);
        }
    }

    /// Fire every timer due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        while !self.done {
            let due: Vec<u64> = self
                .chunks
                .iter()
                .filter(|(_, c)| c.retransmit_at.is_some_and(|at| at <= now))
                .map(|(key, _)| *key)
                .collect();
            for key in due {
                let Some(chunk) = self.chunks.get_mut(&key) else {
                    continue;
                };
                chunk.retransmit_at = None;
                if !chunk.remaining.is_empty() {
                    debug!(offset = chunk.lower_bound, "retransmit timeout");
                    self.enqueue(PRIORITY_RETRANSMIT, key);
                    self.reschedule_send(now);
                }
            }

            match self.next_send_at {
                Some(at) if at <= now => {
                    let next = self
                        .send_a_message(now)
                        .unwrap_or_else(|| self.congestion.next_send_delay(now));
                    self.next_send_at = Some(now + next);
                }
                _ => break,
            }
        }
    }

    /// Earliest instant at which [`ReliableStream::handle_timeout`] has work.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.done {
            return None;
        }
        self.chunks
            .values()
            .filter_map(|c| c.retransmit_at)
            .chain(self.next_send_at)
            .min()
    }

    /// Next frame to seal and send.
    pub fn poll_frame(&mut self) -> Option<MessageFrame> {
        self.outbox.pop_front()
    }

    /// Next application event.
    pub fn poll_event(&mut self) -> Option<StreamEvent> {
        self.events.pop_front()
    }

    /// State of the read direction.
    pub fn reads(&self) -> HalfState {
        self.reads
    }

    /// State of the write direction.
    pub fn writes(&self) -> HalfState {
        self.writes
    }

    /// True once both directions are closed.
    pub fn is_finished(&self) -> bool {
        self.done
    }

    /// The peer's resolution, once known.
    pub fn their_resolution(&self) -> Option<Resolution> {
        self.their_resolution
    }

    /// Our resolution, once closing.
    pub fn our_resolution(&self) -> Option<Resolution> {
        self.our_resolution
    }

    /// Offsets received from the peer.
    pub fn received(&self) -> &IntervalSet {
        &self.received
    }

    /// Offsets the peer has acknowledged.
    pub fn they_acked(&self) -> &IntervalSet {
        &self.they_acked
    }

    /// Offsets we have acknowledged to the peer.
    pub fn we_acked(&self) -> &IntervalSet {
        &self.we_acked
    }

    /// Chunks sent at least once and not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn next_write_id(&mut self) -> WriteId {
        let id = WriteId(self.next_write);
        self.next_write += 1;
        id
    }

    fn add_chunk(&mut self, range: Interval, lower_bound: u64, payload: Payload) -> u64 {
        let key = self.next_chunk;
        self.next_chunk += 1;
        self.chunks.insert(
            key,
            Chunk {
                remaining: IntervalSet::from_intervals([range]),
                lower_bound,
                payload,
                sent_at: Vec::new(),
                message_ids: Vec::new(),
                retransmit_at: None,
            },
        );
        key
    }

    fn enqueue(&mut self, priority: u8, key: u64) {
        let Some(chunk) = self.chunks.get(&key) else {
            return;
        };
        if chunk.remaining.is_empty() || !self.enqueued.insert(key) {
            return;
        }
        self.queue.push(Reverse((priority, chunk.lower_bound, key)));
    }

    fn reschedule_send(&mut self, now: Instant) {
        self.window_blocked = false;
        self.next_send_at = Some(now + self.congestion.next_send_delay(now));
    }

    fn pop_queued(&mut self) -> Option<u64> {
        while let Some(Reverse((_, _, key))) = self.queue.pop() {
            if self.enqueued.remove(&key) && self.chunks.contains_key(&key) {
                return Some(key);
            }
        }
        None
    }

    /// One scheduler step. Returns an explicit delay until the next step, or
    /// `None` to let the congestion controller pace it.
    fn send_a_message(&mut self, now: Instant) -> Option<Duration> {
        let Some(key) = self.pop_queued() else {
            return Some(IDLE_INTERVAL);
        };

        let retransmit = self
            .chunks
            .get(&key)
            .map(|c| (c.sent_at.last().copied(), c.message_ids.last().copied()))?;
        match retransmit {
            (Some(_), last_id) => {
                self.congestion.on_timeout(now);
                if let Some(id) = last_id {
                    self.sent_message_at.remove(&id);
                }
            }
            (None, _) => {
                let blocked = self
                    .congestion
                    .window()
                    .is_some_and(|window| self.outstanding > window as usize);
                if blocked {
                    // Wait for an acknowledgment to free the window.
                    self.enqueue(PRIORITY_DATA, key);
                    self.window_blocked = true;
                    trace!(outstanding = self.outstanding, "window full");
                    return Some(IDLE_INTERVAL);
                }
                self.outstanding += 1;
            }
        }

        let id = self.take_message_id();
        let mut frame = MessageFrame {
            id,
            ranges: self.received.iter().take(6).copied().collect(),
            ..MessageFrame::default()
        };
        let timeout = self
            .congestion
            .retransmit_timeout(now, Some(now))
            .max(MIN_RETRANSMIT_TIMEOUT);
        if let Some(chunk) = self.chunks.get_mut(&key) {
            chunk.fill(&mut frame);
            chunk.sent_at.push(now);
            chunk.message_ids.push(id);
            chunk.retransmit_at = Some(now + timeout);
        }
        self.emit(now, frame);
        None
    }

    fn emit(&mut self, now: Instant, frame: MessageFrame) {
        if frame.id != 0 {
            self.sent_message_at.insert(frame.id, now);
            self.congestion.on_send(now);
        }
        self.we_acked.extend(frame.ranges.iter().copied());
        self.outbox.push_back(frame);
    }

    fn retire_acked(&mut self, now: Instant) {
        let mut retired = Vec::new();
        for (key, chunk) in self.chunks.iter_mut() {
            if !chunk.remaining.as_slice().iter().any(|r| self.they_acked.intersects(r)) {
                continue;
            }
            chunk.remaining.subtract(&self.they_acked);
            if chunk.remaining.is_empty() {
                retired.push(*key);
            }
        }

        for key in retired {
            if let Some(chunk) = self.chunks.remove(&key) {
                self.enqueued.remove(&key);
                if !chunk.sent_at.is_empty() {
                    self.outstanding = self.outstanding.saturating_sub(1);
                }
                for id in &chunk.message_ids {
                    self.sent_message_at.remove(id);
                }
                trace!(offset = chunk.lower_bound, "chunk acknowledged");
            }
            if self.window_blocked {
                self.reschedule_send(now);
            }
        }
    }

    fn complete_writes(&mut self) {
        let they_acked = &self.they_acked;
        let (done, pending): (Vec<_>, Vec<_>) = self
            .pending_writes
            .drain(..)
            .partition(|w| they_acked.contains(&w.range));
        self.pending_writes = pending;

        for write in done {
            self.events.push_back(StreamEvent::WriteAcked(write.id));
            if write.closes {
                self.writes = HalfState::Closed;
                debug!("writes closed");
                self.check_both_resolutions();
            }
        }
    }

    /// Record the peer's resolution and data, delivering what became
    /// contiguous.
    fn absorb(&mut self, frame: &MessageFrame) {
        let data_end = frame.data_pos.checked_add(frame.data.len() as u64);

        if let (Some(resolution), None, Some(end)) =
            (frame.resolution, self.their_end, data_end)
        {
            if let Some(marker_end) = end.checked_add(1) {
                self.their_end = Some(end);
                self.their_resolution = Some(resolution);
                self.received.insert(Interval::new(end, marker_end));
                self.reads = HalfState::Closing;
                debug!(end, ?resolution, "peer resolved stream");
            }
        }

        if let (false, Some(end)) = (frame.data.is_empty(), data_end) {
            let incoming = Interval::new(frame.data_pos, end);
            let fresh =
                IntervalSet::from_intervals([incoming]).difference(&self.received);
            for run in fresh.iter() {
                let from = (run.start - incoming.start) as usize;
                let to = (run.end - incoming.start) as usize;
                self.fragments.insert(run.start, frame.data[from..to].to_vec());
            }
            self.received.insert(incoming);
        }

        if !self.fragments.is_empty() && self.received.is_contiguous_from_zero() {
            let fragments = std::mem::take(&mut self.fragments);
            let data: Vec<u8> = fragments.into_values().flatten().collect();
            trace!(len = data.len(), "delivering data");
            self.events.push_back(StreamEvent::DataReceived(data));
        }
        self.check_their_resolution();
    }

    fn check_their_resolution(&mut self) {
        if self.their_end.is_none() || self.reads == HalfState::Closed {
            return;
        }
        if !self.received.is_contiguous_from_zero() {
            return;
        }
        self.reads = HalfState::Closed;
        self.events.push_back(StreamEvent::ReadClosed);
        self.check_both_resolutions();
    }

    fn check_both_resolutions(&mut self) {
        if self.done || self.reads != HalfState::Closed || self.writes != HalfState::Closed {
            return;
        }
        let Some(resolution) = self.their_resolution else {
            return;
        };
        self.done = true;
        self.next_send_at = None;
        for chunk in self.chunks.values_mut() {
            chunk.retransmit_at = None;
        }
        self.events.push_back(StreamEvent::Finished(resolution));
        debug!(?resolution, "stream finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct Stats {
        samples: Vec<Duration>,
        timeouts: usize,
    }

    #[derive(Debug)]
    struct FakeCongestion {
        window: Option<u32>,
        stats: Arc<Mutex<Stats>>,
    }

    impl CongestionController for FakeCongestion {
        fn on_sample(&mut self, _now: Instant, rtt: Duration) {
            self.stats.lock().unwrap().samples.push(rtt);
        }

        fn on_timeout(&mut self, _now: Instant) {
            self.stats.lock().unwrap().timeouts += 1;
        }

        fn on_send(&mut self, _now: Instant) {}

        fn next_send_delay(&self, _now: Instant) -> Duration {
            Duration::ZERO
        }

        fn retransmit_timeout(&self, _now: Instant, _last_sent: Option<Instant>) -> Duration {
            Duration::from_secs(1)
        }

        fn window(&self) -> Option<u32> {
            self.window
        }
    }

    fn stream_with(window: Option<u32>) -> (ReliableStream, Arc<Mutex<Stats>>, Instant) {
        let stats = Arc::new(Mutex::new(Stats::default()));
        let now = Instant::now();
        let congestion = FakeCongestion {
            window,
            stats: Arc::clone(&stats),
        };
        let mut stream = ReliableStream::new(now, Box::new(congestion));
        stream.handle_timeout(now);
        (stream, stats, now)
    }

    fn stream() -> (ReliableStream, Instant) {
        let (s, _, now) = stream_with(None);
        (s, now)
    }

    fn frames(stream: &mut ReliableStream) -> Vec<MessageFrame> {
        std::iter::from_fn(|| stream.poll_frame()).collect()
    }

    fn events(stream: &mut ReliableStream) -> Vec<StreamEvent> {
        std::iter::from_fn(|| stream.poll_event()).collect()
    }

    fn ack_of(ranges: &[(u64, u64)], previous_id: u32) -> MessageFrame {
        MessageFrame {
            previous_id,
            ranges: ranges.iter().map(|&r| Interval::from(r)).collect(),
            ..MessageFrame::default()
        }
    }

    fn data(id: u32, pos: u64, bytes: &[u8]) -> MessageFrame {
        MessageFrame {
            id,
            data_pos: pos,
            data: bytes.to_vec(),
            ..MessageFrame::default()
        }
    }

    #[test]
    fn test_idle_stream_sleeps() {
        let (stream, now) = stream();
        assert_eq!(stream.poll_timeout(), Some(now + IDLE_INTERVAL));
    }

    #[test]
    fn test_write_is_chunked() {
        let (mut stream, now) = stream();
        stream.write(now, &[7u8; 2500]).unwrap();
        stream.handle_timeout(now);

        let sent = frames(&mut stream);
        assert_eq!(sent.len(), 3);
        assert_eq!(
            sent.iter().map(|f| (f.data_pos, f.data.len())).collect::<Vec<_>>(),
            vec![(0, 1024), (1024, 1024), (2048, 452)]
        );
        assert_eq!(sent.iter().map(|f| f.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(stream.outstanding(), 3);
    }

    #[test]
    fn test_write_completes_once_on_ack() {
        let (mut stream, stats, now) = stream_with(None);
        let id = stream.write(now, b"hello").unwrap();
        stream.handle_timeout(now);
        let sent = frames(&mut stream);
        assert_eq!(sent.len(), 1);

        let later = now + Duration::from_millis(30);
        stream.handle_frame(later, ack_of(&[(0, 5)], sent[0].id));
        assert_eq!(events(&mut stream), vec![StreamEvent::WriteAcked(id)]);
        assert_eq!(stats.lock().unwrap().samples, vec![Duration::from_millis(30)]);
        assert_eq!(stream.outstanding(), 0);

        // Redundant acks do not fire again.
        stream.handle_frame(later, ack_of(&[(0, 5)], sent[0].id));
        assert!(events(&mut stream).is_empty());
        // Pure acks are not acknowledged.
        assert!(frames(&mut stream).is_empty());
    }

    #[test]
    fn test_partial_ack_does_not_complete() {
        let (mut stream, now) = stream();
        let id = stream.write(now, &[1u8; 2000]).unwrap();
        stream.handle_timeout(now);
        frames(&mut stream);

        stream.handle_frame(now, ack_of(&[(0, 1024)], 0));
        assert!(events(&mut stream).is_empty());
        assert_eq!(stream.outstanding(), 1);

        stream.handle_frame(now, ack_of(&[(0, 2000)], 0));
        assert_eq!(events(&mut stream), vec![StreamEvent::WriteAcked(id)]);
    }

    #[test]
    fn test_empty_write_completes_immediately() {
        let (mut stream, now) = stream();
        let id = stream.write(now, b"").unwrap();
        assert_eq!(events(&mut stream), vec![StreamEvent::WriteAcked(id)]);
        stream.handle_timeout(now);
        assert!(frames(&mut stream).is_empty());
    }

    #[test]
    fn test_inbound_data_is_acked() {
        let (mut stream, now) = stream();
        stream.handle_frame(now, data(4, 0, b"abc"));

        let sent = frames(&mut stream);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_pure_ack());
        assert_eq!(sent[0].previous_id, 4);
        assert_eq!(sent[0].ranges, vec![Interval::new(0, 3)]);
        assert_eq!(events(&mut stream), vec![StreamEvent::DataReceived(b"abc".to_vec())]);
        assert_eq!(stream.we_acked().as_slice(), &[Interval::new(0, 3)]);
    }

    #[test]
    fn test_out_of_order_reassembly() {
        let (mut stream, now) = stream();
        stream.handle_frame(now, data(1, 6, b"ghi"));
        stream.handle_frame(now, data(2, 3, b"def"));
        assert!(events(&mut stream).is_empty());

        // Overlapping duplicate coverage of the middle.
        stream.handle_frame(now, data(3, 0, b"abcdefg"));
        assert_eq!(
            events(&mut stream),
            vec![StreamEvent::DataReceived(b"abcdefghi".to_vec())]
        );
        assert_eq!(stream.received().as_slice(), &[Interval::new(0, 9)]);
    }

    #[test]
    fn test_duplicate_frame_is_idempotent() {
        let (mut stream, now) = stream();
        stream.handle_frame(now, data(1, 0, b"xyz"));
        stream.handle_frame(now, data(1, 0, b"xyz"));
        assert_eq!(events(&mut stream), vec![StreamEvent::DataReceived(b"xyz".to_vec())]);

        let acks = frames(&mut stream);
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0].ranges, acks[1].ranges);
    }

    #[test]
    fn test_write_after_close_fails() {
        let (mut stream, now) = stream();
        stream.close(now, true).unwrap();
        assert_eq!(stream.write(now, b"late"), Err(StreamError::ConnectionClosing));
        assert_eq!(stream.close(now, false), Err(StreamError::ConnectionClosing));
        assert_eq!(stream.our_resolution(), Some(Resolution::Success));
    }

    #[test]
    fn test_close_waits_for_all_acks() {
        let (mut stream, now) = stream();
        let write = stream.write(now, b"hello").unwrap();
        let close = stream.close(now, true).unwrap();
        stream.handle_timeout(now);

        let sent = frames(&mut stream);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].resolution, Some(Resolution::Success));
        assert_eq!(sent[1].data_pos, 5);

        // Only the marker acked: the write is still outstanding.
        stream.handle_frame(now, ack_of(&[(5, 6)], 0));
        assert!(events(&mut stream).is_empty());
        assert_eq!(stream.writes(), HalfState::Closing);

        stream.handle_frame(now, ack_of(&[(0, 6)], 0));
        assert_eq!(
            events(&mut stream),
            vec![StreamEvent::WriteAcked(write), StreamEvent::WriteAcked(close)]
        );
        assert_eq!(stream.writes(), HalfState::Closed);
        assert!(!stream.is_finished());
    }

    #[test]
    fn test_peer_resolution_closes_reads() {
        let (mut stream, now) = stream();
        let end = MessageFrame {
            id: 2,
            resolution: Some(Resolution::Failure),
            data_pos: 3,
            ..MessageFrame::default()
        };
        stream.handle_frame(now, end);
        assert_eq!(stream.reads(), HalfState::Closing);
        assert!(events(&mut stream).is_empty());

        stream.handle_frame(now, data(1, 0, b"abc"));
        assert_eq!(
            events(&mut stream),
            vec![
                StreamEvent::DataReceived(b"abc".to_vec()),
                StreamEvent::ReadClosed
            ]
        );
        assert_eq!(stream.reads(), HalfState::Closed);
        assert_eq!(stream.their_resolution(), Some(Resolution::Failure));

        // The end marker shows up in our acknowledgments.
        let acks = frames(&mut stream);
        assert_eq!(acks.last().unwrap().ranges, vec![Interval::new(0, 4)]);
    }

    #[test]
    fn test_first_resolution_wins() {
        let (mut stream, now) = stream();
        let success = MessageFrame {
            id: 1,
            resolution: Some(Resolution::Success),
            ..MessageFrame::default()
        };
        stream.handle_frame(now, success);
        let failure = MessageFrame {
            id: 2,
            resolution: Some(Resolution::Failure),
            data_pos: 10,
            ..MessageFrame::default()
        };
        stream.handle_frame(now, failure);
        assert_eq!(stream.their_resolution(), Some(Resolution::Success));
        assert_eq!(stream.received().as_slice(), &[Interval::new(0, 1)]);
    }

    #[test]
    fn test_finished_after_both_directions() {
        let (mut stream, now) = stream();
        stream.close(now, true).unwrap();
        stream.handle_timeout(now);
        frames(&mut stream);

        stream.handle_frame(
            now,
            MessageFrame {
                id: 1,
                resolution: Some(Resolution::Success),
                ranges: vec![Interval::new(0, 1)],
                ..MessageFrame::default()
            },
        );
        let seen = events(&mut stream);
        assert!(seen.contains(&StreamEvent::ReadClosed));
        assert_eq!(seen.last(), Some(&StreamEvent::Finished(Resolution::Success)));
        assert!(stream.is_finished());
        assert_eq!(stream.poll_timeout(), None);
        assert_eq!(stream.write(now, b"x"), Err(StreamError::ConnectionDone));

        frames(&mut stream);
        stream.handle_frame(
            now,
            MessageFrame {
                id: 2,
                resolution: Some(Resolution::Success),
                ..MessageFrame::default()
            },
        );
        let acks = frames(&mut stream);
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].previous_id, 2);
        assert!(events(&mut stream).is_empty());
    }

    #[test]
    fn test_retransmit_after_timeout() {
        let (mut stream, stats, now) = stream_with(None);
        stream.write(now, b"lost").unwrap();
        stream.handle_timeout(now);
        let first = frames(&mut stream);
        assert_eq!(first[0].id, 1);
        assert_eq!(stream.poll_timeout(), Some(now + Duration::from_secs(1)));

        let later = now + Duration::from_secs(1);
        stream.handle_timeout(later);
        let again = frames(&mut stream);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, 2);
        assert_eq!(again[0].data, b"lost".to_vec());
        assert_eq!(stats.lock().unwrap().timeouts, 1);
        assert_eq!(stream.outstanding(), 1);

        // An ack for the stale id gives no RTT sample.
        stream.handle_frame(later, ack_of(&[(0, 4)], 1));
        assert!(stats.lock().unwrap().samples.is_empty());
        assert_eq!(stream.outstanding(), 0);
    }

    #[test]
    fn test_range_only_acks_forget_send_times() {
        let (mut stream, stats, now) = stream_with(None);
        for i in 0..100u64 {
            stream.write(now, &[i as u8]).unwrap();
            stream.handle_timeout(now);
            assert_eq!(frames(&mut stream).len(), 1);
            stream.handle_frame(now, ack_of(&[(0, i + 1)], 0));
        }
        assert_eq!(stream.outstanding(), 0);
        assert!(stream.sent_message_at.is_empty());
        assert!(stats.lock().unwrap().samples.is_empty());
    }

    #[test]
    fn test_retransmits_jump_the_queue() {
        let (mut stream, _, now) = stream_with(Some(0));
        stream.write(now, &[1u8; 1500]).unwrap();
        stream.handle_timeout(now);
        // Window 0 still lets the first chunk out, then blocks.
        let first = frames(&mut stream);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].data_pos, 0);
        assert_eq!(stream.poll_timeout(), Some(now + Duration::from_secs(1)));

        stream.handle_timeout(now + Duration::from_secs(1));
        let resent = frames(&mut stream);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].data_pos, 0);
    }

    #[test]
    fn test_window_block_waits_for_ack() {
        let (mut stream, _, now) = stream_with(Some(0));
        stream.write(now, &[1u8; 1500]).unwrap();
        stream.handle_timeout(now);
        let first = frames(&mut stream);
        assert_eq!(first.len(), 1);

        // No busy wakeups while blocked.
        let soon = now + Duration::from_millis(10);
        stream.handle_timeout(soon);
        assert!(frames(&mut stream).is_empty());

        stream.handle_frame(soon, ack_of(&[(0, 1024)], first[0].id));
        stream.handle_timeout(soon);
        let second = frames(&mut stream);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].data_pos, 1024);
    }

    #[test]
    fn test_outbound_frames_piggyback_ranges() {
        let (mut stream, now) = stream();
        stream.handle_frame(now, data(1, 0, b"in"));
        frames(&mut stream);
        stream.write(now, b"out").unwrap();
        stream.handle_timeout(now);
        let sent = frames(&mut stream);
        assert_eq!(sent[0].ranges, vec![Interval::new(0, 2)]);
        assert_eq!(sent[0].previous_id, 0);
    }
}
