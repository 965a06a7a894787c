//! Fixed-capacity FIFO of audio chunks that drops the oldest on overflow.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::trace;

use parley_core::error::{ParleyError, Result};

pub struct AudioRingBuffer {
    capacity: usize,
    chunks: VecDeque<Bytes>,
    total_bytes: usize,
    dropped: u64,
}

impl AudioRingBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < 1 {
            return Err(ParleyError::Media(
                "ring buffer capacity must be at least 1".into(),
            ));
        }
        Ok(Self {
            capacity,
            chunks: VecDeque::with_capacity(capacity),
            total_bytes: 0,
            dropped: 0,
        })
    }

    /// Append a chunk, evicting the oldest one first when full.
    pub fn push(&mut self, chunk: Bytes) {
        if self.chunks.len() == self.capacity {
            if let Some(oldest) = self.chunks.pop_front() {
                self.total_bytes -= oldest.len();
                self.dropped += 1;
                trace!(dropped = self.dropped, "Ring buffer full, evicted oldest chunk");
            }
        }
        self.total_bytes += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Drain every buffered chunk in FIFO order.
    pub fn take_all(&mut self) -> Vec<Bytes> {
        self.total_bytes = 0;
        self.chunks.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Chunks evicted since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
