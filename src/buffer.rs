//! Zero-copy scratch-buffer pool for outgoing datagrams.
//!
//! The transport core itself is single-threaded and cooperative (see the
//! concurrency design notes), but a [`TransportFactory`](crate::factory::TransportFactory)
//! is commonly driven from a thread reading off a shared socket while
//! encode/decode scratch space is reused across turns. This pool is the one
//! deliberately thread-safe piece of state in the crate.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Shared pool of reusable byte buffers.
#[derive(Clone, Debug)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    buffers: Mutex<VecDeque<Vec<u8>>>,
    buffer_size: usize,
    max_buffers: usize,
}

impl BufferPool {
    /// Create a pool of `max_buffers` buffers, each `buffer_size` bytes.
    #[must_use]
    pub fn new(buffer_size: usize, max_buffers: usize) -> Self {
        assert!(buffer_size > 0, "buffer_size must be positive");
        assert!(max_buffers > 0, "max_buffers must be positive");

        let mut deque = VecDeque::with_capacity(max_buffers);
        for _ in 0..max_buffers {
            deque.push_back(vec![0u8; buffer_size]);
        }

        Self {
            inner: Arc::new(PoolInner {
                buffers: Mutex::new(deque),
                buffer_size,
                max_buffers,
            }),
        }
    }

    /// Lease a buffer from the pool, allocating fresh if the pool is empty.
    pub fn acquire(&self) -> Buffer {
        let mut guard = self
            .inner
            .buffers
            .lock()
            .expect("buffer pool mutex poisoned");

        let buffer = guard
            .pop_front()
            .unwrap_or_else(|| vec![0u8; self.inner.buffer_size]);

        Buffer {
            data: Some(buffer),
            pool: Arc::clone(&self.inner),
            len: 0,
        }
    }
}

/// Buffer leased from a [`BufferPool`]; returned to the pool on drop.
pub struct Buffer {
    data: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
    len: usize,
}

impl Buffer {
    /// Expose the buffer as a mutable slice for writes.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data.as_mut().expect("buffer already returned to pool")
    }

    /// Expose the filled portion of the buffer.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data.as_ref().expect("buffer already returned to pool")[..self.len]
    }

    /// Record how many leading bytes are meaningful.
    pub fn set_len(&mut self, len: usize) {
        let capacity = self.data.as_ref().map_or(0, Vec::len);
        assert!(len <= capacity, "buffer length exceeds capacity");
        self.len = len;
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(mut data) = self.data.take() {
            data.fill(0);
            let mut guard = self
                .pool
                .buffers
                .lock()
                .expect("buffer pool mutex poisoned");
            if guard.len() < self.pool.max_buffers {
                guard.push_back(data);
            }
        }
    }
}
