//! Broker root: topic and client registries, metadata persistence and the
//! queue-scan loop.
//!
//! The scan loop drives in-flight and deferred maintenance with uniform
//! random sampling: every tick it hands a handful of channels to a small
//! worker pool and, when enough of them report expired work, immediately
//! samples again instead of waiting for the next tick. Work per tick stays
//! O(selection count) no matter how many channels exist.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::Options;
use crate::core::channel::Channel;
use crate::core::consumer::Consumer;
use crate::core::context::{BackendFactory, Context};
use crate::core::guid::MAX_NODE_ID;
use crate::core::message::unix_nanos;
use crate::core::topic::{Topic, TopicError};
use crate::util::{is_valid_name, uniq_rands};

const METADATA_FILE: &str = "fanmq.dat";

pub struct Broker {
    ctx: Arc<Context>,

    topics: RwLock<HashMap<String, Arc<Topic>>>,

    clients: DashMap<i64, Arc<dyn Consumer>>,
    client_id_seq: AtomicI64,

    is_loading: AtomicBool,
    start_time: Instant,

    exit_tx: Mutex<Option<flume::Sender<()>>>,
    exit_rx: flume::Receiver<()>,

    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Broker {
    pub fn new(opts: Options) -> anyhow::Result<Arc<Self>> {
        Self::with_backend_factory(opts, None)
    }

    pub fn with_backend_factory(
        opts: Options,
        backend_factory: Option<Box<BackendFactory>>,
    ) -> anyhow::Result<Arc<Self>> {
        if opts.node_id < 0 || opts.node_id > MAX_NODE_ID {
            anyhow::bail!("node_id must be in [0, {MAX_NODE_ID}]");
        }

        let ctx = match backend_factory {
            Some(factory) => Context::with_backend_factory(opts, factory),
            None => Context::new(opts),
        };

        let (exit_tx, exit_rx) = flume::bounded(0);
        Ok(Arc::new(Self {
            ctx,
            topics: RwLock::new(HashMap::new()),
            clients: DashMap::new(),
            client_id_seq: AtomicI64::new(0),
            is_loading: AtomicBool::new(false),
            start_time: Instant::now(),
            exit_tx: Mutex::new(Some(exit_tx)),
            exit_rx,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn opts(&self) -> Arc<Options> {
        self.ctx.opts()
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn is_healthy(&self) -> bool {
        self.ctx.is_healthy()
    }

    pub fn health(&self) -> String {
        self.ctx.health()
    }

    /// Spawn the maintenance machinery. Call once after metadata load.
    pub fn start(self: &Arc<Self>) {
        let scan = tokio::spawn(Arc::clone(self).queue_scan_loop());
        self.tasks.lock().push(scan);
    }

    // ---- clients ----

    pub fn next_client_id(&self) -> i64 {
        self.client_id_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add_client(&self, client_id: i64, client: Arc<dyn Consumer>) {
        self.clients.insert(client_id, client);
    }

    pub fn remove_client(&self, client_id: i64) {
        self.clients.remove(&client_id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    // ---- topics ----

    /// Get or lazily create a topic. New topics start their pump right away
    /// unless the broker is loading metadata, in which case the loader
    /// starts them once all channels are attached.
    pub fn get_topic(self: &Arc<Self>, name: &str) -> Arc<Topic> {
        if let Some(topic) = self.topics.read().get(name) {
            return Arc::clone(topic);
        }

        let (topic, created) = {
            let mut topics = self.topics.write();
            match topics.get(name) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let broker = Arc::downgrade(self);
                    let topic_name = name.to_string();
                    let callback: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
                        delete_topic_callback(&broker, &topic_name);
                    });
                    let topic = Topic::new(name, Arc::clone(&self.ctx), callback);
                    topics.insert(name.to_string(), Arc::clone(&topic));
                    (topic, true)
                }
            }
        };

        if created && !self.is_loading.load(Ordering::SeqCst) {
            topic.start();
        }
        topic
    }

    pub fn get_existing_topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.read().get(name).cloned()
    }

    /// Delete a topic and all of its channels. The topic is emptied before
    /// it leaves the registry so concurrent publishes error instead of
    /// resurrecting it.
    pub async fn delete_existing_topic(&self, name: &str) -> Result<(), TopicError> {
        let Some(topic) = self.get_existing_topic(name) else {
            return Ok(());
        };

        topic.delete().await?;
        self.topics.write().remove(name);
        Ok(())
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    /// Flat snapshot of every channel across all topics.
    fn channels(&self) -> Vec<Arc<Channel>> {
        let topics: Vec<Arc<Topic>> = self.topics.read().values().cloned().collect();
        topics.iter().flat_map(|t| t.channels()).collect()
    }

    // ---- queue scan ----

    async fn queue_scan_loop(self: Arc<Self>) {
        let opts = self.opts();
        let mut pool = ScanPool::new(opts.queue_scan_selection_count);

        // first tick lands one interval out, not immediately
        let now = tokio::time::Instant::now();
        let mut work_ticker =
            tokio::time::interval_at(now + opts.queue_scan_interval(), opts.queue_scan_interval());
        work_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut refresh_ticker = tokio::time::interval_at(
            now + opts.queue_scan_refresh_interval(),
            opts.queue_scan_refresh_interval(),
        );
        refresh_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut channels = self.channels();
        pool.resize(channels.len(), opts.queue_scan_worker_pool_max);

        let exit_rx = self.exit_rx.clone();
        'main: loop {
            tokio::select! {
                _ = work_ticker.tick() => {
                    if channels.is_empty() {
                        continue;
                    }
                }
                _ = refresh_ticker.tick() => {
                    channels = self.channels();
                    pool.resize(channels.len(), self.opts().queue_scan_worker_pool_max);
                    continue;
                }
                _ = exit_rx.recv_async() => break,
            }

            // sample; if enough of the sample was dirty, immediately sample
            // again instead of waiting for the next tick
            loop {
                let opts = self.opts();
                let num = opts.queue_scan_selection_count.min(channels.len());

                for i in uniq_rands(num, channels.len()) {
                    if pool.work_tx.send_async(Arc::clone(&channels[i])).await.is_err() {
                        break 'main;
                    }
                }

                let mut num_dirty = 0usize;
                for _ in 0..num {
                    match pool.resp_rx.recv_async().await {
                        Ok(true) => num_dirty += 1,
                        Ok(false) => {}
                        Err(_) => break 'main,
                    }
                }

                if num == 0 || (num_dirty as f64) / (num as f64) <= opts.queue_scan_dirty_percent {
                    break;
                }
            }
        }

        info!("queue scan: closing");
        pool.shutdown().await;
    }

    // ---- metadata ----

    fn metadata_path(&self) -> PathBuf {
        let opts = self.opts();
        let dir = if opts.data_path.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(&opts.data_path)
        };
        dir.join(METADATA_FILE)
    }

    /// Recreate the non-ephemeral topic/channel set recorded by a previous
    /// run. Topics are started only after all their channels attach.
    pub fn load_metadata(self: &Arc<Self>) -> anyhow::Result<()> {
        self.is_loading.store(true, Ordering::SeqCst);
        let result = self.load_metadata_inner();
        self.is_loading.store(false, Ordering::SeqCst);
        result
    }

    fn load_metadata_inner(self: &Arc<Self>) -> anyhow::Result<()> {
        let path = self.metadata_path();
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            // fresh start
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(anyhow::anyhow!("failed to read metadata from {path:?}: {e}")),
        };

        let meta: Metadata = serde_json::from_slice(&data)
            .map_err(|e| anyhow::anyhow!("failed to parse metadata in {path:?}: {e}"))?;

        for topic_meta in meta.topics {
            if !is_valid_name(&topic_meta.name) {
                warn!(topic = %topic_meta.name, "skipping creation of invalid topic");
                continue;
            }
            let topic = self.get_topic(&topic_meta.name);
            if topic_meta.paused {
                topic.pause();
            }
            for channel_meta in topic_meta.channels {
                if !is_valid_name(&channel_meta.name) {
                    warn!(channel = %channel_meta.name, "skipping creation of invalid channel");
                    continue;
                }
                let channel = topic.get_channel(&channel_meta.name);
                if channel_meta.paused {
                    channel.pause();
                }
            }
            topic.start();
        }
        Ok(())
    }

    /// Snapshot the non-ephemeral topic/channel set. Written to a temp file
    /// and renamed into place so a crash never leaves a torn snapshot.
    pub fn persist_metadata(&self) -> anyhow::Result<()> {
        let path = self.metadata_path();
        info!(path = %path.display(), "persisting topic/channel metadata");

        let mut meta = Metadata { topics: Vec::new() };
        for topic in self.topics.read().values() {
            if topic.is_ephemeral() {
                continue;
            }
            let mut channels = Vec::new();
            for channel in topic.channels() {
                if channel.is_ephemeral() {
                    continue;
                }
                channels.push(ChannelMetadata {
                    name: channel.name().to_string(),
                    paused: channel.is_paused(),
                });
            }
            meta.topics.push(TopicMetadata {
                name: topic.name().to_string(),
                paused: topic.is_paused(),
                channels,
            });
        }

        let data = serde_json::to_vec(&meta)?;
        let tmp = path.with_extension(format!("{}.tmp", std::process::id()));
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    // ---- shutdown ----

    /// Persist metadata, close every topic and stop the maintenance tasks.
    pub async fn exit(&self) {
        if let Err(e) = self.persist_metadata() {
            error!("failed to persist metadata: {e}");
        }

        info!("closing topics");
        let topics: Vec<Arc<Topic>> = self.topics.read().values().cloned().collect();
        for topic in topics {
            if let Err(e) = topic.close().await {
                error!(topic = %topic.name(), "topic close failed: {e}");
            }
        }

        info!("stopping subsystems");
        self.exit_tx.lock().take();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("bye");
    }
}

/// The queue-scan worker pool and its plumbing. Work and response channels
/// are bounded to the selection count; each send on the close channel
/// retires exactly one worker, and dropping the sender retires all of them.
struct ScanPool {
    size: usize,
    workers: Vec<tokio::task::JoinHandle<()>>,
    work_tx: flume::Sender<Arc<Channel>>,
    work_rx: flume::Receiver<Arc<Channel>>,
    resp_tx: flume::Sender<bool>,
    resp_rx: flume::Receiver<bool>,
    close_tx: Option<flume::Sender<()>>,
    close_rx: flume::Receiver<()>,
}

impl ScanPool {
    fn new(selection_count: usize) -> Self {
        let (work_tx, work_rx) = flume::bounded(selection_count);
        let (resp_tx, resp_rx) = flume::bounded(selection_count);
        let (close_tx, close_rx) = flume::unbounded();
        Self {
            size: 0,
            workers: Vec::new(),
            work_tx,
            work_rx,
            resp_tx,
            resp_rx,
            close_tx: Some(close_tx),
            close_rx,
        }
    }

    /// Track `clamp(1, num_channels / 4, pool_max)` workers.
    fn resize(&mut self, num_channels: usize, pool_max: usize) {
        let ideal = (num_channels / 4).clamp(1, pool_max.max(1));
        while self.size != ideal {
            if self.size > ideal {
                if let Some(close_tx) = &self.close_tx {
                    let _ = close_tx.send(());
                }
                self.size -= 1;
            } else {
                self.workers.push(tokio::spawn(queue_scan_worker(
                    self.work_rx.clone(),
                    self.resp_tx.clone(),
                    self.close_rx.clone(),
                )));
                self.size += 1;
            }
        }
    }

    async fn shutdown(mut self) {
        self.close_tx.take();
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn queue_scan_worker(
    work_rx: flume::Receiver<Arc<Channel>>,
    resp_tx: flume::Sender<bool>,
    close_rx: flume::Receiver<()>,
) {
    loop {
        tokio::select! {
            res = work_rx.recv_async() => {
                let Ok(channel) = res else { return };
                let now = unix_nanos();
                let mut dirty = false;
                if channel.process_in_flight_queue(now) {
                    dirty = true;
                }
                if channel.process_deferred_queue(now) {
                    dirty = true;
                }
                if resp_tx.send_async(dirty).await.is_err() {
                    return;
                }
            }
            // one message retires one worker; a dropped sender retires all
            _ = close_rx.recv_async() => return,
        }
    }
}

fn delete_topic_callback(broker: &Weak<Broker>, name: &str) {
    if let Some(broker) = broker.upgrade() {
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = broker.delete_existing_topic(&name).await {
                error!(topic = %name, "ephemeral topic delete failed: {e}");
            }
        });
    }
}

#[derive(Serialize, Deserialize)]
struct Metadata {
    topics: Vec<TopicMetadata>,
}

#[derive(Serialize, Deserialize)]
struct TopicMetadata {
    name: String,
    paused: bool,
    channels: Vec<ChannelMetadata>,
}

#[derive(Serialize, Deserialize)]
struct ChannelMetadata {
    name: String,
    paused: bool,
}
