//! Broker configuration.
//!
//! Options load from a TOML file into one flat struct; every field has a
//! default so a missing file or a partial file both work. Durations are
//! plain millisecond integers in the file.
//!
//! # Example `fanmq.toml`
//! ```toml
//! node_id = 7
//! data_path = "/var/lib/fanmq"
//! mem_queue_size = 10000
//!
//! msg_timeout_ms     = 60000
//! max_msg_timeout_ms = 900000
//!
//! queue_scan_interval_ms         = 100
//! queue_scan_refresh_interval_ms = 5000
//! queue_scan_selection_count     = 20
//! queue_scan_dirty_percent       = 0.25
//! queue_scan_worker_pool_max     = 4
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Node id mixed into generated message ids. Must be in `[0, 1024)`.
    pub node_id: i64,

    /// Directory for the metadata snapshot. Empty means current directory.
    pub data_path: String,

    /// Capacity of each topic/channel memory queue; overflow spills to the
    /// backend queue.
    pub mem_queue_size: usize,

    /// Largest accepted message body, in bytes.
    pub max_msg_size: u64,

    /// Default in-flight timeout before redelivery.
    pub msg_timeout_ms: u64,

    /// Hard cap on the in-flight deadline a TOUCH can reach.
    pub max_msg_timeout_ms: u64,

    /// Hard cap on a requeue defer delay.
    pub max_req_timeout_ms: u64,

    /// Per-channel consumer cap. Zero means unlimited.
    pub max_channel_consumers: usize,

    pub queue_scan_interval_ms: u64,
    pub queue_scan_refresh_interval_ms: u64,
    pub queue_scan_selection_count: usize,
    pub queue_scan_dirty_percent: f64,
    pub queue_scan_worker_pool_max: usize,

    /// Fsync cadence, passed through to the backend queue factory.
    pub sync_every: u64,
    pub sync_timeout_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            node_id: 0,
            data_path: String::new(),
            mem_queue_size: 10_000,
            max_msg_size: 1024 * 1024,
            msg_timeout_ms: 60_000,
            max_msg_timeout_ms: 15 * 60_000,
            max_req_timeout_ms: 60 * 60_000,
            max_channel_consumers: 0,
            queue_scan_interval_ms: 100,
            queue_scan_refresh_interval_ms: 5_000,
            queue_scan_selection_count: 20,
            queue_scan_dirty_percent: 0.25,
            queue_scan_worker_pool_max: 4,
            sync_every: 2_500,
            sync_timeout_ms: 2_000,
        }
    }
}

impl Options {
    pub fn msg_timeout(&self) -> Duration {
        Duration::from_millis(self.msg_timeout_ms)
    }

    pub fn max_msg_timeout(&self) -> Duration {
        Duration::from_millis(self.max_msg_timeout_ms)
    }

    pub fn max_req_timeout(&self) -> Duration {
        Duration::from_millis(self.max_req_timeout_ms)
    }

    pub fn queue_scan_interval(&self) -> Duration {
        Duration::from_millis(self.queue_scan_interval_ms)
    }

    pub fn queue_scan_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.queue_scan_refresh_interval_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}

/// Load configuration from a TOML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Options, anyhow::Error> {
    let raw = std::fs::read_to_string(&path)?;
    let opts: Options = toml::from_str(&raw)?;
    Ok(opts)
}
