#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Once;
use std::time::Duration;

use fanmq::core::consumer::Consumer;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let guard = fanmq::logging::init_logging();
        std::mem::forget(guard);
    });
}

/// Default options pointed at a fresh scratch directory. Keep the returned
/// tempdir alive for the duration of the test.
pub fn test_opts() -> (tempfile::TempDir, fanmq::config::Options) {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let opts = fanmq::config::Options {
        data_path: dir.path().to_string_lossy().into_owned(),
        ..fanmq::config::Options::default()
    };
    (dir, opts)
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Minimal consumer that counts the notifications it receives.
#[derive(Default)]
pub struct TestConsumer {
    pub id: i64,
    pub closed: AtomicBool,
    pub emptied: AtomicU64,
    pub timeouts: AtomicU64,
}

impl TestConsumer {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

impl Consumer for TestConsumer {
    fn id(&self) -> i64 {
        self.id
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn empty(&self) {
        self.emptied.fetch_add(1, Ordering::SeqCst);
    }

    fn pause(&self) {}

    fn un_pause(&self) {}

    fn timed_out_message(&self) {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
    }

    fn ready_count(&self) -> i64 {
        1
    }
}
