//! # Command Reorder Buffer
//!
//! Fixed-capacity ring of slots addressed by full packet id relative to the
//! current front. Command fragments may arrive in any order within the
//! window; they leave the buffer strictly in sequence.
//!
//! A command spans one slot, or a run of slots from a fragment carrying
//! `FRAGMENTED` to the next one that does. The first fragment's flags decide
//! whether the reassembled payload is compressed.
//!
//! Reassembly runs in two phases so callers holding a lock around the buffer
//! can drop it before decompression:
//!
//! 1. [`ReorderBuffer::take_command`] moves the fragments out (under lock).
//! 2. [`RawCommand::finish`] decompresses and size-checks (lock free).

use bytes::{Bytes, BytesMut};

use crate::compression;
use crate::error::CompressionError;
use crate::pool::BufferPool;
use crate::wire::PacketFlags;

// ─── Fragment ───────────────────────────────────────────────────────────────

/// One received command datagram, decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFragment {
    pub wire_id: u16,
    pub generation: u16,
    pub flags: PacketFlags,
    pub payload: Bytes,
}

impl CommandFragment {
    pub fn new(wire_id: u16, generation: u16, flags: PacketFlags, payload: Bytes) -> Self {
        CommandFragment {
            wire_id,
            generation,
            flags,
            payload,
        }
    }

    #[inline]
    pub fn full_id(&self) -> u32 {
        ((self.generation as u32) << 16) | self.wire_id as u32
    }

    #[inline]
    pub fn is_fragment_marker(&self) -> bool {
        self.flags.contains(PacketFlags::FRAGMENTED)
    }
}

// ─── Results ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    /// The slot already holds a fragment.
    Duplicate,
    /// Older than the current front; already delivered.
    Underflow,
    /// Too far ahead of the front for the buffer capacity.
    Overflow,
}

/// A complete, defragmented and decompressed command.
#[derive(Debug, PartialEq, Eq)]
pub struct ReassembledCommand {
    /// Full id of the first fragment.
    pub first_full_id: u32,
    /// Number of datagrams the command spanned.
    pub fragment_count: usize,
    /// Flags of the first fragment.
    pub flags: PacketFlags,
    payload: BytesMut,
}

impl ReassembledCommand {
    pub fn command(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn was_compressed(&self) -> bool {
        self.flags.contains(PacketFlags::COMPRESSED)
    }

    pub fn into_bytes(self) -> Bytes {
        self.payload.freeze()
    }

    pub fn into_inner(self) -> BytesMut {
        self.payload
    }
}

/// Fragments concatenated in sequence order, not yet decompressed.
#[derive(Debug)]
pub struct RawCommand {
    pub first_full_id: u32,
    pub fragment_count: usize,
    pub flags: PacketFlags,
    pub payload: BytesMut,
    /// Whether the next command's first slot was already filled when this
    /// one was taken.
    pub more_pending: bool,
}

/// Outcome of taking the front command out of the buffer.
#[derive(Debug)]
pub enum TakeResult {
    NoCommandsPending,
    /// No terminal fragment within the buffer capacity.
    SequenceLengthTooLong { length: usize },
    Taken(RawCommand),
}

#[derive(Debug)]
pub enum ReassembleResult {
    NoCommandsPending,
    Success(ReassembledCommand),
    /// A command was produced and another one is ready.
    MoreCommandsPending(ReassembledCommand),
    SequenceLengthTooLong { length: usize },
    CommandTooLarge { declared: usize, max: usize },
    CommandDecompressFailed(CompressionError),
}

impl RawCommand {
    /// Decompress (when flagged) and wrap into a [`ReassembledCommand`].
    pub fn finish(self, max_command_size: usize, pool: &BufferPool) -> ReassembleResult {
        let RawCommand {
            first_full_id,
            fragment_count,
            flags,
            payload,
            more_pending,
        } = self;

        let payload = if flags.contains(PacketFlags::COMPRESSED) {
            let declared = compression::decompressed_size(&payload);
            if declared > max_command_size {
                pool.release(payload);
                return ReassembleResult::CommandTooLarge {
                    declared,
                    max: max_command_size,
                };
            }

            let mut out = pool.acquire(declared);
            out.resize(declared, 0);
            let result = compression::decompress(&payload, &mut out);
            pool.release(payload);
            match result {
                Ok(len) => {
                    out.truncate(len);
                    out
                }
                Err(e) => {
                    pool.release(out);
                    return ReassembleResult::CommandDecompressFailed(e);
                }
            }
        } else {
            payload
        };

        let command = ReassembledCommand {
            first_full_id,
            fragment_count,
            flags,
            payload,
        };
        if more_pending {
            ReassembleResult::MoreCommandsPending(command)
        } else {
            ReassembleResult::Success(command)
        }
    }
}

// ─── Reorder Buffer ─────────────────────────────────────────────────────────

pub struct ReorderBuffer {
    slots: Vec<Option<CommandFragment>>,
    /// Ring index of the front slot.
    head: usize,
    /// Full id stored at the front slot.
    front: u32,
    occupied: usize,
}

impl ReorderBuffer {
    /// `capacity` must be a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity >= 2 && capacity.is_power_of_two(),
            "reorder capacity must be a power of two"
        );
        ReorderBuffer {
            slots: vec![None; capacity],
            head: 0,
            front: 0,
            occupied: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Full id expected at the front.
    #[inline]
    pub fn current_index(&self) -> u32 {
        self.front
    }

    /// Number of filled slots.
    #[inline]
    pub fn occupancy(&self) -> usize {
        self.occupied
    }

    #[inline]
    fn ring_index(&self, offset: usize) -> usize {
        (self.head + offset) & (self.capacity() - 1)
    }

    pub fn front_set(&self) -> bool {
        self.slot_set(0)
    }

    pub fn slot_set(&self, offset: usize) -> bool {
        offset < self.capacity() && self.slots[self.ring_index(offset)].is_some()
    }

    pub fn slot(&self, offset: usize) -> Option<&CommandFragment> {
        if offset >= self.capacity() {
            return None;
        }
        self.slots[self.ring_index(offset)].as_ref()
    }

    pub fn insert(&mut self, full_id: u32, fragment: CommandFragment) -> InsertResult {
        let offset = full_id.wrapping_sub(self.front);
        if (offset as i32) < 0 {
            return InsertResult::Underflow;
        }
        let offset = offset as usize;
        if offset >= self.capacity() {
            return InsertResult::Overflow;
        }

        let idx = self.ring_index(offset);
        if self.slots[idx].is_some() {
            return InsertResult::Duplicate;
        }
        self.slots[idx] = Some(fragment);
        self.occupied += 1;
        InsertResult::Inserted
    }

    /// Remove slot 0 and advance the front by one, filled or not.
    pub fn pop_front(&mut self) -> Option<CommandFragment> {
        let taken = self.slots[self.head].take();
        if taken.is_some() {
            self.occupied -= 1;
        }
        self.head = self.ring_index(1);
        self.front = self.front.wrapping_add(1);
        taken
    }

    /// Drop all fragments and move the front to `full_id`.
    pub fn set_full_index_to(&mut self, full_id: u32) {
        self.clear_slots();
        self.front = full_id;
    }

    pub fn reset(&mut self) {
        self.set_full_index_to(0);
    }

    fn clear_slots(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.head = 0;
        self.occupied = 0;
    }

    /// Move the next complete command out of the buffer.
    pub fn take_command(&mut self, pool: &BufferPool) -> TakeResult {
        let Some(first) = self.slot(0) else {
            return TakeResult::NoCommandsPending;
        };
        let first_full_id = self.front;
        let flags = first.flags;

        let mut length = 1usize;
        let mut total = first.payload.len();
        if first.is_fragment_marker() {
            loop {
                if length >= self.capacity() {
                    return TakeResult::SequenceLengthTooLong { length };
                }
                let Some(next) = self.slot(length) else {
                    return TakeResult::NoCommandsPending;
                };
                length += 1;
                total += next.payload.len();
                if next.is_fragment_marker() {
                    break;
                }
            }
        }

        let mut payload = pool.acquire(total);
        for _ in 0..length {
            if let Some(fragment) = self.pop_front() {
                payload.extend_from_slice(&fragment.payload);
            }
        }
        debug_assert_eq!(payload.len(), total);

        TakeResult::Taken(RawCommand {
            first_full_id,
            fragment_count: length,
            flags,
            payload,
            more_pending: self.front_set(),
        })
    }

    /// [`take_command`](Self::take_command) and [`RawCommand::finish`] in one
    /// step.
    pub fn try_reassemble(
        &mut self,
        max_command_size: usize,
        pool: &BufferPool,
    ) -> ReassembleResult {
        match self.take_command(pool) {
            TakeResult::NoCommandsPending => ReassembleResult::NoCommandsPending,
            TakeResult::SequenceLengthTooLong { length } => {
                ReassembleResult::SequenceLengthTooLong { length }
            }
            TakeResult::Taken(raw) => raw.finish(max_command_size, pool),
        }
    }
}
