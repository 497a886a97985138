//! Bounded priority queue for outbound packets held while disconnected or
//! while traffic is being shaped.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Outbound priority: Critical ≻ High ≻ Normal ≻ Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SendPriority {
    /// Bulk traffic; first to be shed.
    Low,
    /// Default.
    Normal,
    /// Chat-like traffic.
    High,
    /// Connection control.
    Critical,
}

fn bucket_index(priority: SendPriority) -> usize {
    match priority {
        SendPriority::Critical => 0,
        SendPriority::High => 1,
        SendPriority::Normal => 2,
        SendPriority::Low => 3,
    }
}

/// One queued outbound packet, already in its canonical framed form.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedPacket {
    /// Framed wire bytes.
    pub payload: Vec<u8>,
    /// Reliability flag to use on transmission.
    pub reliable: bool,
    /// Queue priority.
    pub priority: SendPriority,
    /// When the packet was admitted.
    pub enqueued_at: Instant,
}

/// Fixed set of priority buckets with recency order inside each bucket.
///
/// The whole queue is capacity-bounded: new entries are dropped once full.
/// Entries older than the max age are evicted before replay.
#[derive(Debug)]
pub struct OutboundQueue {
    buckets: [VecDeque<QueuedPacket>; 4],
    max_size: usize,
    max_age: Duration,
    next_replay_at: Option<Instant>,
    dropped_full: u64,
    dropped_aged: u64,
}

impl OutboundQueue {
    /// Empty queue with the given capacity and entry max age.
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Self {
            buckets: std::array::from_fn(|_| VecDeque::new()),
            max_size,
            max_age,
            next_replay_at: None,
            dropped_full: 0,
            dropped_aged: 0,
        }
    }

    /// Entries currently queued across all priorities.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    /// Enqueue a packet. Returns `false` (dropping the packet) once the
    /// queue is at capacity.
    pub fn push(&mut self, packet: QueuedPacket) -> bool {
        if self.len() >= self.max_size {
            self.dropped_full += 1;
            return false;
        }
        self.buckets[bucket_index(packet.priority)].push_back(packet);
        true
    }

    /// Dequeue the next packet honoring Critical ≻ High ≻ Normal ≻ Low, FIFO
    /// within a priority.
    pub fn pop_next(&mut self) -> Option<QueuedPacket> {
        self.buckets
            .iter_mut()
            .find_map(|bucket| bucket.pop_front())
    }

    /// Silently drop entries older than the max age. Returns how many were
    /// evicted.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let max_age = self.max_age;
        let mut evicted = 0;
        for bucket in &mut self.buckets {
            let before = bucket.len();
            bucket.retain(|packet| now.saturating_duration_since(packet.enqueued_at) <= max_age);
            evicted += before - bucket.len();
        }
        self.dropped_aged += evicted as u64;
        evicted
    }

    /// Drop everything below `min` priority (zone-transition trim). Returns
    /// how many entries were shed.
    pub fn retain_priority_at_least(&mut self, min: SendPriority) -> usize {
        let mut shed = 0;
        for (index, bucket) in self.buckets.iter_mut().enumerate() {
            if index > bucket_index(min) {
                shed += bucket.len();
                bucket.clear();
            }
        }
        shed
    }

    /// Whether a replay batch may run at `now` (the inter-batch pause has
    /// elapsed).
    pub fn replay_due(&self, now: Instant) -> bool {
        self.next_replay_at.map_or(true, |at| now >= at)
    }

    /// Note that a replay batch just ran; the next one waits `pause`.
    pub fn note_replay(&mut self, pause: Duration, now: Instant) {
        self.next_replay_at = Some(now + pause);
    }

    /// Entries dropped because the queue was full.
    pub fn dropped_full(&self) -> u64 {
        self.dropped_full
    }

    /// Entries evicted for exceeding the max age.
    pub fn dropped_aged(&self) -> u64 {
        self.dropped_aged
    }
}
