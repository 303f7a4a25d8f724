//! Lock-free pool of copy buffers
//!
//! Buffers come from a `crossbeam_queue::ArrayQueue` free-list and go back
//! to it when the [`PooledBuffer`] is dropped. An empty pool allocates and a
//! full pool lets the buffer go.

use crossbeam_queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Size of each relay buffer
pub const RELAY_BUFFER_SIZE: usize = 4096;

/// Buffers kept for reuse
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Shared free-list of fixed-size buffers
#[derive(Debug)]
pub struct BufferPool {
    buffers: ArrayQueue<Vec<u8>>,
    buffer_size: usize,
}

impl BufferPool {
    #[must_use]
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity),
            buffer_size,
        }
    }

    /// Take a buffer, allocating when the pool is empty
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .buffers
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Buffers currently idle in the pool
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, RELAY_BUFFER_SIZE)
    }
}

/// A buffer on loan from a [`BufferPool`]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        // a full pool just frees the buffer
        let _ = self.pool.buffers.push(buf);
    }
}
