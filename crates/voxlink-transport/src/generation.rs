//! # Sequence Generations
//!
//! Wire ids are 16 bits and wrap every 65536 packets. The receiver infers how
//! often an id stream has wrapped (its *generation*) from the order ids arrive
//! in, which extends every id to a 32-bit full id:
//!
//! ```text
//! full_id = generation << 16 | wire_id
//! ```
//!
//! The id space is split into a low band `[0, W)` and a high band
//! `[65535 - W, 65535]`. Moving from the high band into the low band is a
//! wrap; an id from the high band arriving while the stream sits in the low
//! band is a late packet of the previous generation.

use crate::wire::PacketType;

/// Default width of the low/high bands.
pub const DEFAULT_GENERATION_WINDOW: u32 = 8192;

// ─── Generation Estimator ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GenerationEstimator {
    window: u16,
    last_wire_id: u16,
    last_generation: u16,
}

impl Default for GenerationEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_GENERATION_WINDOW)
    }
}

impl GenerationEstimator {
    /// `window` is clamped to `1..=32767` so the two bands never overlap.
    pub fn new(window: u32) -> Self {
        GenerationEstimator {
            window: window.clamp(1, 0x7FFF) as u16,
            last_wire_id: 0,
            last_generation: 0,
        }
    }

    #[inline]
    fn in_low_band(&self, id: u16) -> bool {
        id < self.window
    }

    #[inline]
    fn in_high_band(&self, id: u16) -> bool {
        id >= u16::MAX - self.window
    }

    /// Estimate the generation of `wire_id`. Call once per received id, in
    /// arrival order.
    pub fn visit_packet(&mut self, wire_id: u16) -> u16 {
        let last_high = self.in_high_band(self.last_wire_id);

        if last_high {
            if self.in_low_band(wire_id) {
                self.last_generation = self.last_generation.wrapping_add(1);
                self.last_wire_id = wire_id;
            } else if wire_id > self.last_wire_id {
                self.last_wire_id = wire_id;
            }
            return self.last_generation;
        }

        if self.in_low_band(self.last_wire_id) && self.in_high_band(wire_id) {
            // late packet from before the wrap; state stays as is
            return self.last_generation.saturating_sub(1);
        }

        if wire_id > self.last_wire_id {
            self.last_wire_id = wire_id;
        }
        self.last_generation
    }

    pub fn reset(&mut self) {
        self.last_wire_id = 0;
        self.last_generation = 0;
    }

    pub fn set_last_state(&mut self, wire_id: u16, generation: u16) {
        self.last_wire_id = wire_id;
        self.last_generation = generation;
    }

    #[inline]
    pub fn generation(&self) -> u16 {
        self.last_generation
    }

    #[inline]
    pub fn last_wire_id(&self) -> u16 {
        self.last_wire_id
    }
}

// ─── Outgoing Id Allocation ─────────────────────────────────────────────────

/// Allocates monotonically increasing full ids per packet type for sending.
#[derive(Debug, Clone, Default)]
pub struct PacketIdManager {
    next: [u32; PacketType::COUNT],
}

impl PacketIdManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next full id of `packet_type`.
    pub fn next_full_id(&mut self, packet_type: PacketType) -> u32 {
        let slot = &mut self.next[packet_type.index()];
        let id = *slot;
        *slot = slot.wrapping_add(1);
        id
    }

    /// The full id the next call to `next_full_id` will return.
    pub fn peek_full_id(&self, packet_type: PacketType) -> u32 {
        self.next[packet_type.index()]
    }

    pub fn generation(&self, packet_type: PacketType) -> u16 {
        (self.next[packet_type.index()] >> 16) as u16
    }

    pub fn reset(&mut self) {
        self.next = [0; PacketType::COUNT];
    }
}
