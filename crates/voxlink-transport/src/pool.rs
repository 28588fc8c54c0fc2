//! # Command Buffer Pool
//!
//! Bounded free list of `BytesMut` buffers for reassembled commands. The pool
//! owns free buffers; an acquired buffer is exclusively owned by the caller
//! until it is released back (or simply dropped).

use bytes::BytesMut;
use parking_lot::Mutex;

/// Buffers that grew beyond this are dropped instead of cached.
pub const MAX_POOLED_CAPACITY: usize = 64 * 1024;

// ─── BufferPool ─────────────────────────────────────────────────────────────

pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    /// Maximum number of cached free buffers.
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        BufferPool {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// An empty buffer able to hold at least `min_capacity` bytes.
    pub fn acquire(&self, min_capacity: usize) -> BytesMut {
        let cached = self.free.lock().pop();
        match cached {
            Some(mut buf) => {
                buf.clear();
                buf.reserve(min_capacity);
                buf
            }
            None => BytesMut::with_capacity(min_capacity),
        }
    }

    /// Hand a buffer back. Dropped when the pool is full or the buffer is
    /// oversized.
    pub fn release(&self, mut buf: BytesMut) {
        if buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buf);
        }
    }

    /// Number of cached free buffers.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every cached buffer.
    pub fn clear(&self) {
        self.free.lock().clear();
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64)
    }
}
