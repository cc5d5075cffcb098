//! Reassembly of Redundant Multi-Link Frames
//!
//! In native multi-link mode every media frame reaches the relay once per up
//! link. The reorder buffer drops the extra copies, restores sequence order,
//! and bounds how long it waits for a missing frame by the configured
//! latency budget.

use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Skipped sequence numbers remembered to tell late frames from duplicates
const SKIP_HISTORY: usize = 4096;

/// Reorder errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReorderError {
    #[error("Buffer is full")]
    BufferFull,

    #[error("Frame {0} arrived after its slot was skipped")]
    TooOld(u64),
}

#[derive(Debug, Clone)]
struct BufferedFrame {
    payload: Bytes,
    link_id: u8,
    received_at: Instant,
    copies: u32,
}

/// Frame released in sequence order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredFrame {
    pub seq: u64,
    pub payload: Bytes,
    /// Link that delivered the first copy
    pub link_id: u8,
    /// Copies received, the first one included
    pub copies: u32,
}

/// Reorder statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReorderStats {
    /// Unique frames accepted
    pub frames_received: u64,
    /// Frames released in order
    pub frames_delivered: u64,
    /// Redundant copies dropped
    pub duplicates_dropped: u64,
    /// Frames that arrived after their slot was skipped
    pub frames_too_old: u64,
    /// Sequence numbers given up on after the latency budget
    pub frames_lost: u64,
    /// Buffer full events
    pub buffer_full_events: u64,
}

impl ReorderStats {
    /// Fraction of expected frames that never arrived in time
    pub fn loss_ratio(&self) -> f64 {
        let expected = self.frames_delivered + self.frames_lost;
        if expected == 0 {
            0.0
        } else {
            self.frames_lost as f64 / expected as f64
        }
    }

    /// Counter deltas since an earlier snapshot
    pub fn since(&self, earlier: &ReorderStats) -> ReorderStats {
        ReorderStats {
            frames_received: self.frames_received.saturating_sub(earlier.frames_received),
            frames_delivered: self.frames_delivered.saturating_sub(earlier.frames_delivered),
            duplicates_dropped: self
                .duplicates_dropped
                .saturating_sub(earlier.duplicates_dropped),
            frames_too_old: self.frames_too_old.saturating_sub(earlier.frames_too_old),
            frames_lost: self.frames_lost.saturating_sub(earlier.frames_lost),
            buffer_full_events: self
                .buffer_full_events
                .saturating_sub(earlier.buffer_full_events),
        }
    }
}

/// Sequence-ordered, deduplicating buffer bounded by a latency budget
pub struct ReorderBuffer {
    buffer: BTreeMap<u64, BufferedFrame>,
    /// Next sequence number to release; unset until delivery starts
    next_expected: Option<u64>,
    /// Slots given up on, newest last
    skipped: BTreeSet<u64>,
    latency: Duration,
    max_buffer_size: usize,
    stats: ReorderStats,
}

impl ReorderBuffer {
    pub fn new(latency: Duration, max_buffer_size: usize) -> Self {
        ReorderBuffer {
            buffer: BTreeMap::new(),
            next_expected: None,
            skipped: BTreeSet::new(),
            latency,
            max_buffer_size: max_buffer_size.max(1),
            stats: ReorderStats::default(),
        }
    }

    /// Add one received copy of frame `seq`
    ///
    /// Returns `Ok(true)` for the first copy and `Ok(false)` for a
    /// redundant one.
    pub fn push(
        &mut self,
        seq: u64,
        link_id: u8,
        payload: Bytes,
        now: Instant,
    ) -> Result<bool, ReorderError> {
        if let Some(next) = self.next_expected {
            if seq < next {
                if self.skipped.remove(&seq) {
                    self.stats.frames_too_old += 1;
                    return Err(ReorderError::TooOld(seq));
                }
                self.stats.duplicates_dropped += 1;
                return Ok(false);
            }
        }

        if let Some(existing) = self.buffer.get_mut(&seq) {
            existing.copies += 1;
            self.stats.duplicates_dropped += 1;
            return Ok(false);
        }

        if self.buffer.len() >= self.max_buffer_size {
            self.stats.buffer_full_events += 1;
            return Err(ReorderError::BufferFull);
        }

        self.buffer.insert(
            seq,
            BufferedFrame {
                payload,
                link_id,
                received_at: now,
                copies: 1,
            },
        );
        self.stats.frames_received += 1;
        Ok(true)
    }

    /// Release every frame that is ready at `now`
    ///
    /// Consecutive frames are released immediately. A gap is skipped once the
    /// frame waiting behind it has been held for the latency budget, or when
    /// the buffer is full.
    pub fn pop_ready(&mut self, now: Instant) -> Vec<DeliveredFrame> {
        let mut ready = Vec::new();
        if self.next_expected.is_none() && !self.start_position(now) {
            return ready;
        }

        while let Some(next) = self.next_expected {
            if let Some(frame) = self.buffer.remove(&next) {
                self.next_expected = Some(next.wrapping_add(1));
                self.stats.frames_delivered += 1;
                ready.push(DeliveredFrame {
                    seq: next,
                    payload: frame.payload,
                    link_id: frame.link_id,
                    copies: frame.copies,
                });
                continue;
            }

            let Some((&head, frame)) = self.buffer.iter().next() else {
                break;
            };

            let waited = now.saturating_duration_since(frame.received_at);
            if waited < self.latency && self.buffer.len() < self.max_buffer_size {
                break;
            }

            self.skip_to(next, head);
        }

        ready
    }

    /// Pick where delivery starts
    ///
    /// A run starting at sequence 0 is released at once. Joining a run
    /// midway waits one latency budget so early reordering settles first.
    fn start_position(&mut self, now: Instant) -> bool {
        let Some(&head) = self.buffer.keys().next() else {
            return false;
        };

        let oldest = self.buffer.values().map(|f| f.received_at).min();
        let waited = oldest.map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
        if head != 0 && waited < self.latency && self.buffer.len() < self.max_buffer_size {
            return false;
        }

        self.next_expected = Some(head);
        true
    }

    fn skip_to(&mut self, from: u64, to: u64) {
        let gap = to.saturating_sub(from);
        self.stats.frames_lost += gap;

        let remembered = (gap as usize).min(SKIP_HISTORY);
        for seq in to - remembered as u64..to {
            self.skipped.insert(seq);
        }
        while self.skipped.len() > SKIP_HISTORY {
            self.skipped.pop_first();
        }

        self.next_expected = Some(to);
    }

    /// Forget all state, keeping the counters
    ///
    /// Used when a new field agent run supersedes the previous one and
    /// sequence numbers start over.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.skipped.clear();
        self.next_expected = None;
    }

    pub fn stats(&self) -> &ReorderStats {
        &self.stats
    }

    pub fn buffered_count(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_expected(&self) -> Option<u64> {
        self.next_expected
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }
}
