//! Pool of reusable encode buffers for the spill path.

use bytes::BytesMut;
use crossbeam_queue::SegQueue;

const DEFAULT_BUF_CAPACITY: usize = 4 * 1024;

/// Lock-free pool of `BytesMut` buffers. Buffers that grew far past their
/// nominal capacity are dropped on release instead of being retained.
pub struct BufferPool {
    pool: SegQueue<BytesMut>,
    capacity: usize,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            pool: SegQueue::new(),
            capacity: DEFAULT_BUF_CAPACITY,
            max_pooled,
        }
    }

    pub fn acquire(&self) -> BytesMut {
        match self.pool.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => BytesMut::with_capacity(self.capacity),
        }
    }

    pub fn release(&self, buf: BytesMut) {
        if self.pool.len() < self.max_pooled && buf.capacity() <= self.capacity * 2 {
            self.pool.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64)
    }
}
