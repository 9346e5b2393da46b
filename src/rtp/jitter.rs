/// RTP Jitter Buffer
/// Absorbs arrival jitter, repairs reordering and decides when playout may start
///
/// Packets are kept in a fixed ring of slots indexed by sequence distance from
/// the last in-order packet, so a gap in sequence numbers leaves empty slots
/// that a late arrival can still fill. Every slot with a known duration
/// contributes to `buffered_ms`; playout starts once that reaches the target
/// latency.
///
/// The writer (network side) and the reader (fixed ~20 ms playout cadence)
/// may run on different threads. All state sits behind one mutex, and the
/// critical sections are a handful of slot updates.

use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, trace, warn};

use super::clock::RtpClock;
use super::packet::RtpPacket;

/// Ring size; 2 s of 20 ms packets
pub const DEFAULT_CAPACITY: usize = 100;

/// Default playout latency target
pub const DEFAULT_TARGET_JITTER_MS: i64 = 60;

/// Size of the 16-bit sequence space
const SEQ_MODULUS: i64 = 1 << 16;

/// A gap longer than this many average packet durations is a talk spurt
/// boundary, not loss
const SILENCE_GAP_FACTOR: i64 = 3;

/// Consecutive far-behind packets after which the sender is assumed to have
/// renumbered its stream
const RESYNC_RUN: u32 = 5;

/// Configuration for the jitter buffer
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    /// Buffered media (ms) required before the first packet is released
    pub target_jitter_ms: i64,
    /// Number of packet slots in the ring
    pub capacity: usize,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            target_jitter_ms: DEFAULT_TARGET_JITTER_MS,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Lifecycle of a receive stream's buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BufferState {
    /// Nothing written since construction or `reset()`
    Empty,
    /// Collecting packets, `read()` returns `None`
    Buffering,
    /// Serving `read()`
    Ready,
}

/// Snapshot of buffer counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JitterBufferStats {
    pub packets_written: u64,
    pub packets_read: u64,
    /// Unread packets evicted because the ring ran out of room
    pub overrun_drops: u64,
    /// Reordered packets that arrived after their slot was already played
    pub late_drops: u64,
    pub duplicates: u64,
    pub silence_resets: u64,
    /// Restarts after a sequence discontinuity
    pub resyncs: u64,
    pub sequence_wraps: u32,
    pub expected_packets: u64,
    pub buffered_ms: i64,
    pub occupied_slots: usize,
    pub jitter_ms: f64,
    pub max_jitter_ms: f64,
}

/// Advance a ring index
#[inline]
pub fn inc(index: usize, step: usize, capacity: usize) -> usize {
    (index + step % capacity) % capacity
}

/// Move a ring index backwards
#[inline]
pub fn dec(index: usize, step: usize, capacity: usize) -> usize {
    (index + capacity - step % capacity) % capacity
}

/// Forward distance from `from` to `to` around the ring
#[inline]
fn ring_distance(from: usize, to: usize, capacity: usize) -> usize {
    (to + capacity - from) % capacity
}

/// Signed distance between two sequence numbers, in the shortest direction
#[inline]
fn seq_delta(prev: u16, next: u16) -> i64 {
    next.wrapping_sub(prev) as i16 as i64
}

/// Jitter buffer shared between the network writer and the playout reader
#[derive(Debug)]
pub struct JitterBuffer {
    inner: Mutex<Inner>,
    epoch: Instant,
}

#[derive(Debug)]
struct Inner {
    target_jitter_ms: i64,
    clock: RtpClock,
    slots: Vec<Option<RtpPacket>>,
    read_cursor: usize,
    write_cursor: usize,
    /// Sum of the known durations of all occupied slots
    buffered_ms: i64,
    ready: bool,
    write_started: bool,
    read_started: bool,
    drift_ms: i64,
    remote_time_ms: i64,

    /// (arrival, playout) of the previous packet, for interarrival jitter
    transit: Option<(i64, i64)>,
    jitter: f64,
    max_jitter: f64,
    last_arrival_ms: i64,

    first_sequence: Option<u16>,
    /// (extended seq, playout) the average packet duration is measured from
    baseline: (i64, i64),
    /// Far-behind packets seen in a row
    behind_run: u32,
    /// Sequence number of the packet at the write cursor, extended past 16 bits
    last_extended_seq: i64,
    sequence_wraps: u32,

    packets_written: u64,
    packets_read: u64,
    overrun_drops: u64,
    late_drops: u64,
    duplicates: u64,
    silence_resets: u64,
    resyncs: u64,
}

impl JitterBuffer {
    pub fn new(config: JitterBufferConfig, clock: RtpClock) -> Self {
        let capacity = config.capacity.max(2);
        Self {
            inner: Mutex::new(Inner::new(config.target_jitter_ms, capacity, clock)),
            epoch: Instant::now(),
        }
    }

    /// Replace target latency and clock. Meant to be called once, before the
    /// first `write()`.
    pub fn configure(&self, target_jitter_ms: i64, clock: RtpClock) {
        let mut inner = self.lock();
        inner.target_jitter_ms = target_jitter_ms;
        inner.clock = clock;
    }

    /// Set the media clock rate once the payload format is known
    pub fn set_clock_rate(&self, clock_rate: u32) {
        self.lock().clock.set_clock_rate(clock_rate);
    }

    /// Milliseconds on the buffer's own monotonic clock
    pub fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    /// Store a packet that just arrived
    pub fn write(&self, packet: RtpPacket) {
        let arrival_ms = self.now_ms();
        self.write_at(packet, arrival_ms);
    }

    /// Store a packet that arrived at `arrival_ms` (local clock)
    pub fn write_at(&self, packet: RtpPacket, arrival_ms: i64) {
        self.lock().write(packet, arrival_ms);
    }

    /// Next packet to play, or `None` while buffering or on underrun.
    /// Never blocks.
    pub fn read(&self, now_ms: i64) -> Option<RtpPacket> {
        self.lock().read(now_ms)
    }

    /// Drop buffered media but keep the long-run sequence bookkeeping
    pub fn soft_reset(&self) {
        self.lock().soft_reset();
    }

    /// Full stream restart: also clears the clock and sequence counters
    pub fn reset(&self) {
        self.lock().reset();
    }

    pub fn state(&self) -> BufferState {
        self.lock().state()
    }

    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    pub fn buffered_duration_ms(&self) -> i64 {
        self.lock().buffered_ms
    }

    pub fn target_jitter_ms(&self) -> i64 {
        self.lock().target_jitter_ms
    }

    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    /// Smoothed interarrival jitter (RFC 3550 section 6.4.1), in ms
    pub fn inter_arrival_jitter_ms(&self) -> f64 {
        self.lock().jitter
    }

    pub fn max_jitter_ms(&self) -> f64 {
        self.lock().max_jitter
    }

    /// Packets expected since the first one, counting across wraps
    pub fn expected_packet_count(&self) -> u64 {
        self.lock().expected_packet_count()
    }

    pub fn sequence_wrap_count(&self) -> u32 {
        self.lock().sequence_wraps
    }

    /// Local arrival time of the most recent packet
    pub fn last_received_timestamp(&self) -> i64 {
        self.lock().last_arrival_ms
    }

    /// The most recent in-order packet
    pub fn last_received_packet(&self) -> Option<RtpPacket> {
        let inner = self.lock();
        if !inner.write_started {
            return None;
        }
        inner.slots[inner.write_cursor].clone()
    }

    /// Offset from the reader's clock to the stream timeline, fixed on the
    /// first read after (re)start
    pub fn drift_ms(&self) -> i64 {
        self.lock().drift_ms
    }

    /// The last read's `now_ms` expressed on the stream timeline
    pub fn remote_time_ms(&self) -> i64 {
        self.lock().remote_time_ms
    }

    pub fn stats(&self) -> JitterBufferStats {
        self.lock().stats()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic elsewhere must not take the audio path down with it
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn new(target_jitter_ms: i64, capacity: usize, clock: RtpClock) -> Self {
        Self {
            target_jitter_ms,
            clock,
            slots: vec![None; capacity],
            read_cursor: 0,
            write_cursor: 0,
            buffered_ms: 0,
            ready: false,
            write_started: false,
            read_started: false,
            drift_ms: 0,
            remote_time_ms: 0,
            transit: None,
            jitter: 0.0,
            max_jitter: 0.0,
            last_arrival_ms: 0,
            first_sequence: None,
            baseline: (0, 0),
            behind_run: 0,
            last_extended_seq: 0,
            sequence_wraps: 0,
            packets_written: 0,
            packets_read: 0,
            overrun_drops: 0,
            late_drops: 0,
            duplicates: 0,
            silence_resets: 0,
            resyncs: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn write(&mut self, mut packet: RtpPacket, arrival_ms: i64) {
        if !self.clock.is_synchronized() {
            self.clock.synchronize(0);
        }
        packet.playout_time_ms = self.clock.get_time(packet.timestamp);
        packet.duration_ms = None;
        trace!(
            "Write seq={} ts={} playout={}ms",
            packet.sequence,
            packet.timestamp,
            packet.playout_time_ms
        );

        self.update_jitter(arrival_ms, packet.playout_time_ms);
        self.last_arrival_ms = arrival_ms;
        self.packets_written += 1;

        if self.write_started {
            self.process(packet, arrival_ms);
        } else if self.first_sequence.is_some() {
            // Restart after soft_reset(): keep numbering continuous
            let prev_seq = self.last_extended_seq.rem_euclid(SEQ_MODULUS) as u16;
            let diff = seq_delta(prev_seq, packet.sequence);
            if diff > 0 && packet.sequence < prev_seq {
                self.sequence_wraps += 1;
            }
            let extended = self.last_extended_seq + diff;
            self.baseline = (extended, packet.playout_time_ms);
            self.seed(packet, extended);
        } else {
            let extended = packet.sequence as i64 + self.sequence_wraps as i64 * SEQ_MODULUS;
            self.seed(packet, extended);
        }

        if !self.ready && self.buffered_ms >= self.target_jitter_ms {
            self.ready = true;
            debug!(
                "Jitter buffer ready: {}ms buffered (target {}ms)",
                self.buffered_ms, self.target_jitter_ms
            );
        }
    }

    fn update_jitter(&mut self, arrival_ms: i64, playout_ms: i64) {
        if let Some((prev_arrival, prev_playout)) = self.transit {
            let d = ((arrival_ms - prev_arrival) - (playout_ms - prev_playout)).abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
            if self.jitter > self.max_jitter {
                self.max_jitter = self.jitter;
            }
        }
        self.transit = Some((arrival_ms, playout_ms));
    }

    /// Start a fresh ring holding only `packet`
    fn seed(&mut self, packet: RtpPacket, extended_seq: i64) {
        if self.first_sequence.is_none() {
            self.first_sequence = Some(packet.sequence);
            self.baseline = (extended_seq, packet.playout_time_ms);
            debug!("Jitter buffer initialized with first sequence: {}", packet.sequence);
        }
        self.read_cursor = 0;
        self.write_cursor = 0;
        self.slots[0] = Some(packet);
        self.last_extended_seq = extended_seq;
        self.write_started = true;
    }

    fn process(&mut self, packet: RtpPacket, arrival_ms: i64) {
        let Some((prev_seq, prev_playout)) = self.slots[self.write_cursor]
            .as_ref()
            .map(|p| (p.sequence, p.playout_time_ms))
        else {
            // Write cursor always holds the last in-order packet once started
            warn!("Jitter buffer lost its write position, reseeding");
            let extended = self.last_extended_seq + 1;
            self.seed(packet, extended);
            return;
        };

        let diff = seq_delta(prev_seq, packet.sequence);
        if diff > 0 && packet.sequence < prev_seq {
            self.sequence_wraps += 1;
            debug!(
                "Sequence number wrapped: {} -> {} (wraps={})",
                prev_seq, packet.sequence, self.sequence_wraps
            );
        }

        let back = diff.unsigned_abs() as usize;
        if diff < 0 && back >= self.capacity() {
            self.far_behind(packet, prev_seq, prev_playout, arrival_ms);
            return;
        }
        self.behind_run = 0;

        match diff {
            d if d > 0 => self.advance(packet, d as usize, prev_playout, arrival_ms),
            0 => {
                self.duplicates += 1;
                trace!("Dropping duplicate packet: seq={}", packet.sequence);
            }
            _ => self.splice(packet, back),
        }
    }

    /// Packet too far behind the write cursor to have a slot. Media time
    /// moving forward means the sender jumped ahead by more than half the
    /// sequence space; a run of them means it renumbered. Either way the
    /// buffer restarts on the new numbering.
    fn far_behind(&mut self, packet: RtpPacket, prev_seq: u16, prev_playout: i64, arrival_ms: i64) {
        self.behind_run += 1;
        if packet.playout_time_ms <= prev_playout && self.behind_run < RESYNC_RUN {
            self.late_drops += 1;
            debug!(
                "Dropping late packet: seq={} ({} behind)",
                packet.sequence,
                seq_delta(packet.sequence, prev_seq)
            );
            return;
        }

        let forward = packet.sequence.wrapping_sub(prev_seq) as i64;
        if packet.sequence < prev_seq {
            self.sequence_wraps += 1;
        }
        let extended = self.last_extended_seq + forward;
        warn!(
            "Sequence discontinuity {} -> {}, restarting buffer",
            prev_seq, packet.sequence
        );

        let playout = packet.playout_time_ms;
        self.soft_reset();
        self.resyncs += 1;
        self.transit = Some((arrival_ms, playout));
        self.last_arrival_ms = arrival_ms;
        self.baseline = (extended, playout);
        self.seed(packet, extended);
    }

    /// In-order packet, possibly after `diff - 1` missing ones
    fn advance(&mut self, packet: RtpPacket, diff: usize, prev_playout: i64, arrival_ms: i64) {
        let extended = self.last_extended_seq + diff as i64;
        let gap_ms = packet.playout_time_ms - prev_playout;

        if self.is_silence_gap(gap_ms, prev_playout) {
            debug!(
                "Silence gap of {}ms before seq={}, restarting buffer",
                gap_ms, packet.sequence
            );
            let playout = packet.playout_time_ms;
            self.soft_reset();
            self.silence_resets += 1;
            self.transit = Some((arrival_ms, playout));
            self.last_arrival_ms = arrival_ms;
            self.seed(packet, extended);
            return;
        }

        let duration = gap_ms.max(0);
        if let Some(prev) = self.slots[self.write_cursor].as_mut() {
            prev.duration_ms = Some(duration);
        }
        self.buffered_ms += duration;

        let capacity = self.capacity();
        if diff >= capacity {
            // The jump laps the whole ring: nothing buffered can be kept
            for pos in 0..capacity {
                self.evict(pos);
            }
            self.write_cursor = inc(self.write_cursor, diff, capacity);
            self.read_cursor = self.write_cursor;
        } else {
            let mut read_crossed = false;
            for step in 1..=diff {
                let pos = inc(self.write_cursor, step, capacity);
                if pos == self.read_cursor {
                    read_crossed = true;
                }
                self.evict(pos);
            }
            let old_write = self.write_cursor;
            self.write_cursor = inc(old_write, diff, capacity);
            if read_crossed {
                // Oldest surviving packet; the previous write slot is occupied
                self.read_cursor = self.next_occupied(inc(self.write_cursor, 1, capacity), old_write);
            }
        }

        self.slots[self.write_cursor] = Some(packet);
        self.last_extended_seq = extended;
    }

    /// Reordered packet belonging `back` slots behind the write cursor
    fn splice(&mut self, mut packet: RtpPacket, back: usize) {
        let capacity = self.capacity();
        let pos = dec(self.write_cursor, back, capacity);
        if self.slots[pos].is_some() {
            self.duplicates += 1;
            trace!("Dropping duplicate packet: seq={}", packet.sequence);
            return;
        }

        let window = ring_distance(self.read_cursor, self.write_cursor, capacity);
        if ring_distance(self.read_cursor, pos, capacity) >= window {
            // Its slot has already been played or evicted
            self.late_drops += 1;
            debug!("Dropping late packet: seq={} (slot already consumed)", packet.sequence);
            return;
        }

        let left = self.prev_occupied(pos);
        let right = self.next_occupied(inc(pos, 1, capacity), self.write_cursor);

        let right_playout = self.slots[right].as_ref().map_or(packet.playout_time_ms, |p| p.playout_time_ms);
        let own_duration = (right_playout - packet.playout_time_ms).max(0);

        if let Some(left_packet) = self.slots[left].as_mut() {
            let old = left_packet.duration_ms.unwrap_or(0);
            let new = (packet.playout_time_ms - left_packet.playout_time_ms).max(0);
            left_packet.duration_ms = Some(new);
            // Zero when timestamps are monotonic: the gap was already counted
            self.buffered_ms += new + own_duration - old;
        } else {
            self.buffered_ms += own_duration;
        }

        trace!("Spliced late packet: seq={} into slot {}", packet.sequence, pos);
        packet.duration_ms = Some(own_duration);
        self.slots[pos] = Some(packet);
    }

    fn is_silence_gap(&self, gap_ms: i64, prev_playout: i64) -> bool {
        // Only meaningful with a single packet left in the ring
        if self.read_cursor != self.write_cursor {
            return false;
        }
        let (base_seq, base_playout) = self.baseline;
        let distance = self.last_extended_seq - base_seq;
        if distance <= 0 {
            return false;
        }
        let average = (prev_playout - base_playout) / distance;
        gap_ms > SILENCE_GAP_FACTOR * average
    }

    /// Remove an unread packet to make room for newer ones
    fn evict(&mut self, pos: usize) {
        if let Some(removed) = self.slots[pos].take() {
            self.buffered_ms -= removed.duration_ms.unwrap_or(0);
            self.overrun_drops += 1;
            warn!(
                "Buffer overrun, dropped unread packet: seq={} ({}ms buffered)",
                removed.sequence, self.buffered_ms
            );
        }
    }

    /// First occupied slot scanning forward from `from`, stopping at `limit`
    fn next_occupied(&self, from: usize, limit: usize) -> usize {
        let capacity = self.capacity();
        let mut pos = from;
        while pos != limit && self.slots[pos].is_none() {
            pos = inc(pos, 1, capacity);
        }
        pos
    }

    /// Nearest occupied slot strictly before `from`
    fn prev_occupied(&self, from: usize) -> usize {
        let capacity = self.capacity();
        let mut pos = dec(from, 1, capacity);
        for _ in 0..capacity {
            if self.slots[pos].is_some() || pos == self.read_cursor {
                break;
            }
            pos = dec(pos, 1, capacity);
        }
        pos
    }

    fn read(&mut self, now_ms: i64) -> Option<RtpPacket> {
        if !self.ready {
            return None;
        }

        if !self.read_started {
            self.read_started = true;
            if let Some(first) = self.slots[self.read_cursor].as_ref() {
                self.drift_ms = first.playout_time_ms - now_ms;
            }
        }
        self.remote_time_ms = now_ms + self.drift_ms;

        if self.buffered_ms == 0 || self.read_cursor == self.write_cursor {
            trace!("Jitter buffer underrun");
            return None;
        }

        let packet = self.slots[self.read_cursor].take()?;
        self.buffered_ms -= packet.duration_ms.unwrap_or(0);
        self.packets_read += 1;

        let capacity = self.capacity();
        self.read_cursor = self.next_occupied(inc(self.read_cursor, 1, capacity), self.write_cursor);

        trace!(
            "Read seq={} duration={:?} buffered={}ms",
            packet.sequence,
            packet.duration_ms,
            self.buffered_ms
        );
        Some(packet)
    }

    fn soft_reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.read_cursor = 0;
        self.write_cursor = 0;
        self.buffered_ms = 0;
        self.ready = false;
        self.write_started = false;
        self.read_started = false;
        self.drift_ms = 0;
        self.remote_time_ms = 0;
        self.transit = None;
        self.last_arrival_ms = 0;
        self.behind_run = 0;
    }

    fn reset(&mut self) {
        self.soft_reset();
        self.clock.reset();
        self.jitter = 0.0;
        self.max_jitter = 0.0;
        self.first_sequence = None;
        self.baseline = (0, 0);
        self.last_extended_seq = 0;
        self.sequence_wraps = 0;
        self.packets_written = 0;
        self.packets_read = 0;
        self.overrun_drops = 0;
        self.late_drops = 0;
        self.duplicates = 0;
        self.silence_resets = 0;
        self.resyncs = 0;
    }

    fn state(&self) -> BufferState {
        if self.ready {
            BufferState::Ready
        } else if self.write_started || self.first_sequence.is_some() {
            BufferState::Buffering
        } else {
            BufferState::Empty
        }
    }

    fn expected_packet_count(&self) -> u64 {
        match self.first_sequence {
            Some(first) => (self.last_extended_seq - first as i64 + 1).max(0) as u64,
            None => 0,
        }
    }

    fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            packets_written: self.packets_written,
            packets_read: self.packets_read,
            overrun_drops: self.overrun_drops,
            late_drops: self.late_drops,
            duplicates: self.duplicates,
            silence_resets: self.silence_resets,
            resyncs: self.resyncs,
            sequence_wraps: self.sequence_wraps,
            expected_packets: self.expected_packet_count(),
            buffered_ms: self.buffered_ms,
            occupied_slots: self.slots.iter().filter(|s| s.is_some()).count(),
            jitter_ms: self.jitter,
            max_jitter_ms: self.max_jitter,
        }
    }
}
