//! Named publish point.
//!
//! A topic owns a bounded memory queue with backend spill and a pump task
//! that copies every inbound message into every attached channel. The pump
//! idles until the one-shot start signal fires (so channels restored from
//! metadata attach first) and hides its data inputs while the topic is
//! paused or has no channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::core::backend::{BackendError, BackendQueue, DummyBackendQueue};
use crate::core::channel::Channel;
use crate::core::context::Context;
use crate::core::guid::GuidFactory;
use crate::core::message::{
    decode_message, write_message_to_backend, Message, MessageId, MIN_VALID_MSG_LENGTH,
};

#[derive(Debug, Error)]
pub enum TopicError {
    #[error("exiting")]
    Exiting,
    #[error("channel does not exist")]
    ChannelNotFound,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub struct Topic {
    message_count: AtomicU64,
    message_bytes: AtomicU64,

    ctx: Arc<Context>,
    name: String,
    ephemeral: bool,

    channel_map: RwLock<HashMap<String, Arc<Channel>>>,

    mem_tx: flume::Sender<Message>,
    mem_rx: flume::Receiver<Message>,
    backend: Arc<dyn BackendQueue>,

    start_tx: flume::Sender<()>,
    start_rx: flume::Receiver<()>,
    update_tx: flume::Sender<()>,
    update_rx: flume::Receiver<()>,
    pause_tx: flume::Sender<()>,
    pause_rx: flume::Receiver<()>,

    // dropping the sender broadcasts exit to every select loop
    exit_tx: Mutex<Option<flume::Sender<()>>>,
    exit_rx: flume::Receiver<()>,

    exiting: AtomicBool,
    paused: AtomicBool,

    id_factory: Mutex<GuidFactory>,

    delete_callback: Arc<dyn Fn() + Send + Sync>,
    deleter: AtomicBool,

    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Topic {
    pub fn new(
        name: &str,
        ctx: Arc<Context>,
        delete_callback: Arc<dyn Fn() + Send + Sync>,
    ) -> Arc<Self> {
        let opts = ctx.opts();
        let (mem_tx, mem_rx) = flume::bounded(opts.mem_queue_size);
        let (start_tx, start_rx) = flume::bounded(1);
        let (update_tx, update_rx) = flume::unbounded();
        let (pause_tx, pause_rx) = flume::unbounded();
        let (exit_tx, exit_rx) = flume::bounded(0);

        let ephemeral = name.ends_with("#ephemeral");
        let backend: Arc<dyn BackendQueue> = if ephemeral {
            Arc::new(DummyBackendQueue::new())
        } else {
            ctx.new_backend(name)
        };

        let node_id = opts.node_id;
        let topic = Arc::new(Self {
            message_count: AtomicU64::new(0),
            message_bytes: AtomicU64::new(0),
            ctx,
            name: name.to_string(),
            ephemeral,
            channel_map: RwLock::new(HashMap::new()),
            mem_tx,
            mem_rx,
            backend,
            start_tx,
            start_rx,
            update_tx,
            update_rx,
            pause_tx,
            pause_rx,
            exit_tx: Mutex::new(Some(exit_tx)),
            exit_rx,
            exiting: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            id_factory: Mutex::new(GuidFactory::new(node_id)),
            delete_callback,
            deleter: AtomicBool::new(false),
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(Arc::clone(&topic).message_pump());
        *topic.pump.lock() = Some(pump);

        info!(topic = name, "created");
        topic
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    /// Release the pump: called once boot-time channel creation completed.
    pub fn start(&self) {
        let _ = self.start_tx.try_send(());
    }

    pub fn depth(&self) -> i64 {
        self.mem_rx.len() as i64 + self.backend.depth()
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    pub fn message_bytes(&self) -> u64 {
        self.message_bytes.load(Ordering::Relaxed)
    }

    /// Generate the next message id. Transient factory failures (clock skew,
    /// sequence exhaustion) are retried until they clear.
    pub fn generate_id(&self) -> MessageId {
        loop {
            match self.id_factory.lock().new_guid() {
                Ok(id) => return id,
                Err(_) => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    // ---- channels ----

    /// Get or lazily create a channel, notifying the pump on creation.
    pub fn get_channel(self: &Arc<Self>, name: &str) -> Arc<Channel> {
        let (channel, is_new) = {
            let mut channels = self.channel_map.write();
            match channels.get(name) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let topic = Arc::downgrade(self);
                    let channel_name = name.to_string();
                    let callback: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
                        delete_channel_callback(&topic, &channel_name);
                    });
                    let channel = Channel::new(&self.name, name, Arc::clone(&self.ctx), callback);
                    channels.insert(name.to_string(), Arc::clone(&channel));
                    (channel, true)
                }
            }
        };

        if is_new {
            let _ = self.update_tx.send(());
        }
        channel
    }

    pub fn get_existing_channel(&self, name: &str) -> Result<Arc<Channel>, TopicError> {
        self.channel_map
            .read()
            .get(name)
            .cloned()
            .ok_or(TopicError::ChannelNotFound)
    }

    /// Remove and delete a channel. Deleting a channel that does not exist
    /// is a no-op, which makes ephemeral cleanup idempotent.
    pub fn delete_existing_channel(self: &Arc<Self>, name: &str) -> Result<(), TopicError> {
        let (channel, remaining) = {
            let mut channels = self.channel_map.write();
            let Some(channel) = channels.remove(name) else {
                return Ok(());
            };
            (channel, channels.len())
        };

        info!(topic = %self.name, channel = name, "deleting channel");

        // delete empties the channel before closing so no messages linger
        if let Err(e) = channel.delete() {
            error!(topic = %self.name, channel = name, "channel delete failed: {e}");
        }

        let _ = self.update_tx.send(());

        if remaining == 0 && self.ephemeral && !self.deleter.swap(true, Ordering::SeqCst) {
            let callback = Arc::clone(&self.delete_callback);
            tokio::spawn(async move { callback() });
        }

        Ok(())
    }

    pub fn channel_count(&self) -> usize {
        self.channel_map.read().len()
    }

    /// Snapshot of the attached channels.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channel_map.read().values().cloned().collect()
    }

    // ---- publish ----

    pub fn put_message(&self, msg: Message) -> Result<(), TopicError> {
        if self.exiting() {
            return Err(TopicError::Exiting);
        }
        let body_len = msg.body.len() as u64;
        self.put(msg)?;
        self.message_count.fetch_add(1, Ordering::Relaxed);
        self.message_bytes.fetch_add(body_len, Ordering::Relaxed);
        Ok(())
    }

    /// Append a batch. On failure, counters reflect only the messages that
    /// made it in before the failing one.
    pub fn put_messages(&self, msgs: Vec<Message>) -> Result<(), TopicError> {
        if self.exiting() {
            return Err(TopicError::Exiting);
        }

        let total = msgs.len() as u64;
        let mut total_bytes = 0u64;
        for (i, msg) in msgs.into_iter().enumerate() {
            let body_len = msg.body.len() as u64;
            if let Err(e) = self.put(msg) {
                self.message_count.fetch_add(i as u64, Ordering::Relaxed);
                self.message_bytes.fetch_add(total_bytes, Ordering::Relaxed);
                return Err(e);
            }
            total_bytes += body_len;
        }

        self.message_count.fetch_add(total, Ordering::Relaxed);
        self.message_bytes.fetch_add(total_bytes, Ordering::Relaxed);
        Ok(())
    }

    fn put(&self, msg: Message) -> Result<(), TopicError> {
        match self.mem_tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(msg)) | Err(flume::TrySendError::Disconnected(msg)) => {
                let mut buf = self.ctx.buffer_pool.acquire();
                let res = write_message_to_backend(&mut buf, &msg, &*self.backend);
                self.ctx.buffer_pool.release(buf);
                self.ctx.set_health(res.as_ref().err().map(|e| e.to_string()));
                if let Err(e) = res {
                    error!(topic = %self.name, "failed to write message to backend: {e}");
                    return Err(e.into());
                }
                Ok(())
            }
        }
    }

    // ---- pause ----

    pub fn pause(&self) {
        self.do_pause(true)
    }

    pub fn un_pause(&self) {
        self.do_pause(false)
    }

    fn do_pause(&self, pause: bool) {
        self.paused.store(pause, Ordering::SeqCst);
        let _ = self.pause_tx.send(());
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    // ---- fan-out pump ----

    async fn message_pump(self: Arc<Self>) {
        let exit_rx = self.exit_rx.clone();

        // hold fan-out until start(), but keep servicing signals
        loop {
            tokio::select! {
                _ = self.start_rx.recv_async() => break,
                _ = self.update_rx.recv_async() => continue,
                _ = self.pause_rx.recv_async() => continue,
                _ = exit_rx.recv_async() => return,
            }
        }

        let mut chans = self.channels();
        let mut active = !chans.is_empty() && !self.is_paused();
        let backend_rx = self.backend.read_chan().clone();

        loop {
            let msg: Message;
            tokio::select! {
                res = self.mem_rx.recv_async(), if active => {
                    match res {
                        Ok(m) => msg = m,
                        Err(_) => break,
                    }
                }
                res = backend_rx.recv_async(), if active => {
                    let Ok(buf) = res else {
                        active = false;
                        continue;
                    };
                    let max_len =
                        self.ctx.opts().max_msg_size as usize + MIN_VALID_MSG_LENGTH;
                    if buf.len() > max_len {
                        warn!(topic = %self.name, len = buf.len(), "dropping oversized frame");
                        continue;
                    }
                    match decode_message(&buf) {
                        Ok(m) => msg = m,
                        Err(e) => {
                            error!(topic = %self.name, "failed to decode message: {e}");
                            continue;
                        }
                    }
                }
                _ = self.update_rx.recv_async() => {
                    chans = self.channels();
                    active = !chans.is_empty() && !self.is_paused();
                    continue;
                }
                _ = self.pause_rx.recv_async() => {
                    active = !chans.is_empty() && !self.is_paused();
                    continue;
                }
                _ = exit_rx.recv_async() => break,
            }

            // every channel needs its own instance; the original is handed
            // to the final channel so the 1-channel path never copies
            let mut msg = Some(msg);
            for (i, channel) in chans.iter().enumerate() {
                let chan_msg = if i + 1 == chans.len() {
                    match msg.take() {
                        Some(m) => m,
                        None => break,
                    }
                } else {
                    match msg.as_ref() {
                        Some(m) => m.fanout_copy(),
                        None => break,
                    }
                };

                let deferred = chan_msg.deferred;
                let res = if !deferred.is_zero() {
                    channel.put_message_deferred(chan_msg, deferred)
                } else {
                    channel.put_message(chan_msg)
                };
                if let Err(e) = res {
                    error!(
                        topic = %self.name,
                        channel = %channel.name(),
                        "failed to put message to channel: {e}"
                    );
                }
            }
        }

        info!(topic = %self.name, "closing ... message pump");
    }

    // ---- teardown ----

    /// Persist outstanding data and close every channel.
    pub async fn close(&self) -> Result<(), TopicError> {
        self.exit(false).await
    }

    /// Empty the topic and all channels, removing backends.
    pub async fn delete(&self) -> Result<(), TopicError> {
        self.exit(true).await
    }

    async fn exit(&self, deleted: bool) -> Result<(), TopicError> {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return Err(TopicError::Exiting);
        }

        if deleted {
            info!(topic = %self.name, "deleting");
        } else {
            info!(topic = %self.name, "closing");
        }

        // broadcast exit and wait for the pump to wind down
        self.exit_tx.lock().take();
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }

        if deleted {
            let channels: Vec<Arc<Channel>> = {
                let mut map = self.channel_map.write();
                map.drain().map(|(_, c)| c).collect()
            };
            for channel in channels {
                if let Err(e) = channel.delete() {
                    error!(topic = %self.name, "channel delete failed: {e}");
                }
            }

            self.empty()?;
            return Ok(self.backend.delete()?);
        }

        for channel in self.channels() {
            if let Err(e) = channel.close() {
                error!(topic = %self.name, channel = %channel.name(), "channel close failed: {e}");
            }
        }

        self.flush();
        Ok(self.backend.close()?)
    }

    pub fn empty(&self) -> Result<(), TopicError> {
        while self.mem_rx.try_recv().is_ok() {}
        Ok(self.backend.empty()?)
    }

    fn flush(&self) {
        let pending = self.mem_rx.len();
        if pending > 0 {
            info!(topic = %self.name, "flushing {pending} memory messages to backend");
        }

        let mut buf = self.ctx.buffer_pool.acquire();
        while let Ok(msg) = self.mem_rx.try_recv() {
            if let Err(e) = write_message_to_backend(&mut buf, &msg, &*self.backend) {
                error!(topic = %self.name, "failed to write message to backend: {e}");
            }
        }
        self.ctx.buffer_pool.release(buf);
    }
}

fn delete_channel_callback(topic: &Weak<Topic>, channel_name: &str) {
    if let Some(topic) = topic.upgrade() {
        if let Err(e) = topic.delete_existing_channel(channel_name) {
            error!(channel = channel_name, "ephemeral channel delete failed: {e}");
        }
    }
}
