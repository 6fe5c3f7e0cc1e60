//! Durable spill queue abstraction.
//!
//! Topics and channels spill messages here when their memory queues fill
//! up. The on-disk format lives behind this trait; in-process the broker
//! only needs `put` on one side and a readable channel of frames on the
//! other.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend queue closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub trait BackendQueue: Send + Sync {
    fn put(&self, data: &[u8]) -> Result<(), BackendError>;

    /// Receiver yielding one spill frame per message.
    fn read_chan(&self) -> &flume::Receiver<Bytes>;

    fn close(&self) -> Result<(), BackendError>;

    /// Close and remove any persistent state.
    fn delete(&self) -> Result<(), BackendError>;

    /// Drop all queued frames.
    fn empty(&self) -> Result<(), BackendError>;

    fn depth(&self) -> i64;
}

/// Discard sink used by ephemeral topics and channels: writes vanish and the
/// read side never yields.
pub struct DummyBackendQueue {
    // held so the receiver pends forever instead of disconnecting
    _tx: flume::Sender<Bytes>,
    rx: flume::Receiver<Bytes>,
}

impl DummyBackendQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(0);
        Self { _tx: tx, rx }
    }
}

impl Default for DummyBackendQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendQueue for DummyBackendQueue {
    fn put(&self, _data: &[u8]) -> Result<(), BackendError> {
        Ok(())
    }

    fn read_chan(&self) -> &flume::Receiver<Bytes> {
        &self.rx
    }

    fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn delete(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn empty(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn depth(&self) -> i64 {
        0
    }
}

/// Memory-backed spill queue, the default backend factory target. Frames
/// survive only as long as the process; a disk implementation plugs in
/// through [`BackendQueue`] without touching the engine.
pub struct MemoryBackendQueue {
    tx: flume::Sender<Bytes>,
    rx: flume::Receiver<Bytes>,
    closed: AtomicBool,
}

impl MemoryBackendQueue {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            closed: AtomicBool::new(false),
        }
    }
}

impl Default for MemoryBackendQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendQueue for MemoryBackendQueue {
    fn put(&self, data: &[u8]) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed);
        }
        self.tx
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| BackendError::Closed)
    }

    fn read_chan(&self) -> &flume::Receiver<Bytes> {
        &self.rx
    }

    fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn delete(&self) -> Result<(), BackendError> {
        self.close()?;
        self.empty()
    }

    fn empty(&self) -> Result<(), BackendError> {
        while self.rx.try_recv().is_ok() {}
        Ok(())
    }

    fn depth(&self) -> i64 {
        self.rx.len() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_backend_is_fifo() {
        let q = MemoryBackendQueue::new();
        q.put(b"one").unwrap();
        q.put(b"two").unwrap();
        assert_eq!(q.depth(), 2);

        assert_eq!(&q.read_chan().try_recv().unwrap()[..], b"one");
        assert_eq!(&q.read_chan().try_recv().unwrap()[..], b"two");
        assert_eq!(q.depth(), 0);
    }

    #[test]
    fn memory_backend_rejects_writes_after_close() {
        let q = MemoryBackendQueue::new();
        q.put(b"x").unwrap();
        q.close().unwrap();
        assert!(matches!(q.put(b"y"), Err(BackendError::Closed)));
        // already queued frames are still readable
        assert!(q.read_chan().try_recv().is_ok());
    }

    #[test]
    fn empty_discards_queued_frames() {
        let q = MemoryBackendQueue::new();
        for _ in 0..5 {
            q.put(b"f").unwrap();
        }
        q.empty().unwrap();
        assert_eq!(q.depth(), 0);
    }

    #[test]
    fn dummy_backend_discards_and_reports_zero_depth() {
        let q = DummyBackendQueue::new();
        q.put(b"gone").unwrap();
        assert_eq!(q.depth(), 0);
        assert!(q.read_chan().try_recv().is_err());
    }
}
