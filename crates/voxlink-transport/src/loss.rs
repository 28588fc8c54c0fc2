//! # Loss Tracking
//!
//! Two trackers, one per traffic shape:
//!
//! - [`UnorderedLossTracker`] for unreliable streams (voice, pings, acks). A
//!   32-bit sliding bitmap remembers which of the last ids arrived; ids
//!   shifted out of the window are counted as received or lost.
//! - [`OrderedLossTracker`] for reliable commands, counted on the sending
//!   side. Each id owns one of 32 ack-count slots; a new send that finds its
//!   slot still unacknowledged counts the previous occupant as lost.
//!
//! Both keep short-window counts, decayed by `short_stats()`, next to
//! lifetime totals. Ids are full (generation-extended) ids.

use serde::Serialize;

/// Width of the unordered window in ids.
const HISTORY_BITS: u32 = 32;
const ACK_SLOTS: usize = 32;

/// Ids that must pass before unordered short counts are halved.
const UNORDERED_SHORT_INTERVAL: u32 = 32;
/// Sends that must pass before ordered short counts are rescaled.
const ORDERED_SHORT_INTERVAL: u32 = 64;

/// Received/lost counts of one tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LossCounters {
    pub received: u32,
    pub lost: u32,
    pub received_total: u32,
    pub lost_total: u32,
}

impl LossCounters {
    fn add_received(&mut self, n: u32) {
        self.received = self.received.saturating_add(n);
        self.received_total = self.received_total.saturating_add(n);
    }

    fn add_lost(&mut self, n: u32) {
        self.lost = self.lost.saturating_add(n);
        self.lost_total = self.lost_total.saturating_add(n);
    }
}

// ─── Unordered ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct UnorderedLossTracker {
    counters: LossCounters,
    /// Bit `n` set: id `offset - n` arrived.
    history: u32,
    offset: u32,
    last_short_offset: u32,
}

impl UnorderedLossTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packet_received(&mut self, id: u32) {
        if id <= self.offset {
            let age = self.offset - id;
            if age < HISTORY_BITS {
                self.history |= 1 << age;
            }
            return;
        }

        let age = id - self.offset;
        if age < HISTORY_BITS {
            let received = (self.history >> (HISTORY_BITS - age)).count_ones();
            self.history <<= age;
            self.counters.add_received(received);
            self.counters.add_lost(age - received);
        } else {
            let received = std::mem::take(&mut self.history).count_ones();
            self.counters.add_received(received);
            self.counters.add_lost(HISTORY_BITS - received);

            if age >= HISTORY_BITS * 2 {
                self.counters.add_lost(age - HISTORY_BITS * 2);
            } else {
                self.history |= 1 << (age - HISTORY_BITS);
            }
        }
        self.history |= 1;
        self.offset = id;

        if id < HISTORY_BITS {
            // the first window only shifts in ids that never existed
            self.counters = LossCounters::default();
        }
    }

    /// Halve the short-window counts once enough ids passed.
    pub fn short_stats(&mut self) {
        if self.offset.wrapping_sub(self.last_short_offset) < UNORDERED_SHORT_INTERVAL {
            return;
        }
        self.counters.received /= 2;
        self.counters.lost /= 2;
        self.last_short_offset = self.offset;
    }

    pub fn reset(&mut self) {
        self.counters = LossCounters::default();
        self.reset_offsets();
    }

    pub fn reset_offsets(&mut self) {
        self.offset = 0;
        self.last_short_offset = 0;
        self.history = 0;
    }

    pub fn counters(&self) -> LossCounters {
        self.counters
    }

    pub fn last_packet_id(&self) -> u32 {
        self.offset
    }

    /// A full window has been observed.
    pub fn valid_data(&self) -> bool {
        self.offset >= HISTORY_BITS
    }

    /// Arrivals still inside the window.
    pub fn unconfirmed_received(&self) -> u32 {
        self.history.count_ones()
    }

    /// Gaps still inside the window; may yet be filled.
    pub fn unconfirmed_lost(&self) -> u32 {
        HISTORY_BITS - self.history.count_ones()
    }
}

// ─── Ordered ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct OrderedLossTracker {
    counters: LossCounters,
    ack_counts: [u8; ACK_SLOTS],
    offset: u32,
    sends_since_short: u32,
}

impl OrderedLossTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a send of `id`; resends of older ids only add a pending copy.
    pub fn packet_send(&mut self, id: u32) {
        let slot = &mut self.ack_counts[id as usize % ACK_SLOTS];
        if id > self.offset {
            let lost = std::mem::replace(slot, 1);
            self.counters.add_lost(lost as u32);
            self.offset = id;
        } else {
            *slot = slot.saturating_add(1);
        }
        self.sends_since_short += 1;
    }

    pub fn ack_received(&mut self, id: u32) {
        let slot = &mut self.ack_counts[id as usize % ACK_SLOTS];
        *slot = slot.saturating_sub(1);
        self.counters.add_received(1);
    }

    /// Rescale the short-window counts to a 64-send window.
    pub fn short_stats(&mut self) {
        let passed = self.sends_since_short;
        if passed < ORDERED_SHORT_INTERVAL {
            return;
        }
        self.sends_since_short = 0;
        let scale = |n: u32| ((n as u64 * ORDERED_SHORT_INTERVAL as u64) / passed as u64) as u32;
        self.counters.received = scale(self.counters.received);
        self.counters.lost = scale(self.counters.lost);
    }

    pub fn reset(&mut self) {
        self.counters = LossCounters::default();
        self.reset_offsets();
    }

    pub fn reset_offsets(&mut self) {
        self.offset = 0;
        self.sends_since_short = 0;
        self.ack_counts = [0; ACK_SLOTS];
    }

    pub fn counters(&self) -> LossCounters {
        self.counters
    }

    /// Sends still waiting for an acknowledgement.
    pub fn unconfirmed_lost(&self) -> u32 {
        self.ack_counts.iter().map(|&c| c as u32).sum()
    }
}
