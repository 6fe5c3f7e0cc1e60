//! Shared broker state handed to every topic and channel.
//!
//! The options snapshot sits behind an atomic pointer swap so hot paths
//! read it without locking; the health sentinel records the most recent
//! backend failure.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::config::Options;
use crate::core::backend::{BackendQueue, MemoryBackendQueue};
use crate::core::buffer_pool::BufferPool;

/// Builds the durable backend for a (non-ephemeral) topic or channel. The
/// name uniquely identifies the queue (`topic` or `topic:channel`).
pub type BackendFactory = dyn Fn(&str, &Options) -> Arc<dyn BackendQueue> + Send + Sync;

pub struct Context {
    opts: ArcSwap<Options>,
    health: Mutex<Option<String>>,
    pub buffer_pool: BufferPool,
    backend_factory: Box<BackendFactory>,
}

impl Context {
    pub fn new(opts: Options) -> Arc<Self> {
        Self::with_backend_factory(opts, Box::new(|_, _| Arc::new(MemoryBackendQueue::new())))
    }

    pub fn with_backend_factory(opts: Options, backend_factory: Box<BackendFactory>) -> Arc<Self> {
        Arc::new(Self {
            opts: ArcSwap::from_pointee(opts),
            health: Mutex::new(None),
            buffer_pool: BufferPool::default(),
            backend_factory,
        })
    }

    pub fn opts(&self) -> Arc<Options> {
        self.opts.load_full()
    }

    pub fn swap_opts(&self, opts: Options) {
        self.opts.store(Arc::new(opts));
    }

    pub fn new_backend(&self, name: &str) -> Arc<dyn BackendQueue> {
        (self.backend_factory)(name, &self.opts())
    }

    /// Record the outcome of the latest backend write. `None` clears the
    /// sentinel.
    pub fn set_health(&self, err: Option<String>) {
        *self.health.lock() = err;
    }

    pub fn is_healthy(&self) -> bool {
        self.health.lock().is_none()
    }

    pub fn health(&self) -> String {
        match &*self.health.lock() {
            None => "OK".to_string(),
            Some(err) => format!("NOK - {err}"),
        }
    }
}
