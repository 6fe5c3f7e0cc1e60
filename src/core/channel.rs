//! Per-subscription queue.
//!
//! A channel receives a copy of every message published to its topic and
//! delivers each one to at most one consumer. Messages flow memory-first
//! with spill to the backend queue, then through the in-flight priority
//! queue once handed to a consumer; unacknowledged messages come back via
//! the timeout scan, requeues with a delay park in the deferred queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::core::backend::{BackendError, BackendQueue, DummyBackendQueue};
use crate::core::consumer::Consumer;
use crate::core::context::Context;
use crate::core::message::{decode_message, unix_nanos, write_message_to_backend, Message, MessageId};
use crate::core::pqueue::PriorityQueue;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("exiting")]
    Exiting,
    #[error("client not found")]
    ClientNotFound,
    #[error("message not in flight")]
    MessageNotInFlight,
    #[error("message already in flight")]
    AlreadyInFlight,
    #[error("message already deferred")]
    AlreadyDeferred,
    #[error("too many clients")]
    TooManyClients,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub struct Channel {
    message_count: AtomicU64,
    requeue_count: AtomicU64,
    timeout_count: AtomicU64,

    ctx: Arc<Context>,
    topic_name: String,
    name: String,
    ephemeral: bool,

    mem_tx: flume::Sender<Message>,
    mem_rx: flume::Receiver<Message>,
    backend: Arc<dyn BackendQueue>,

    exiting: AtomicBool,
    paused: AtomicBool,

    clients: RwLock<HashMap<i64, Arc<dyn Consumer>>>,

    in_flight: Mutex<PriorityQueue>,
    deferred: Mutex<PriorityQueue>,

    // fired once when the last consumer leaves an ephemeral channel
    delete_callback: Arc<dyn Fn() + Send + Sync>,
    deleter: AtomicBool,
}

impl Channel {
    pub fn new(
        topic_name: &str,
        name: &str,
        ctx: Arc<Context>,
        delete_callback: Arc<dyn Fn() + Send + Sync>,
    ) -> Arc<Self> {
        let opts = ctx.opts();
        let (mem_tx, mem_rx) = flume::bounded(opts.mem_queue_size);

        let ephemeral = name.ends_with("#ephemeral");
        let backend: Arc<dyn BackendQueue> = if ephemeral {
            Arc::new(DummyBackendQueue::new())
        } else {
            ctx.new_backend(&format!("{topic_name}:{name}"))
        };

        info!(topic = topic_name, channel = name, "new channel");

        Arc::new(Self {
            message_count: AtomicU64::new(0),
            requeue_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            ctx,
            topic_name: topic_name.to_string(),
            name: name.to_string(),
            ephemeral,
            mem_tx,
            mem_rx,
            backend,
            exiting: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            clients: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(PriorityQueue::new()),
            deferred: Mutex::new(PriorityQueue::new()),
            delete_callback,
            deleter: AtomicBool::new(false),
        })
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

    /// Pending message count: memory queue plus backend.
    pub fn depth(&self) -> i64 {
        self.mem_rx.len() as i64 + self.backend.depth()
    }

    /// Frames currently spilled to the backend queue.
    pub fn backend_depth(&self) -> i64 {
        self.backend.depth()
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    pub fn requeue_count(&self) -> u64 {
        self.requeue_count.load(Ordering::Relaxed)
    }

    pub fn timeout_count(&self) -> u64 {
        self.timeout_count.load(Ordering::Relaxed)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    // ---- enqueue ----

    pub fn put_message(&self, msg: Message) -> Result<(), ChannelError> {
        if self.exiting() {
            return Err(ChannelError::Exiting);
        }
        self.put(msg)?;
        self.message_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn put_message_deferred(&self, msg: Message, timeout: Duration) -> Result<(), ChannelError> {
        if self.exiting() {
            return Err(ChannelError::Exiting);
        }
        self.message_count.fetch_add(1, Ordering::Relaxed);
        self.start_deferred_timeout(msg, timeout)
    }

    fn put(&self, msg: Message) -> Result<(), ChannelError> {
        match self.mem_tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(msg)) | Err(flume::TrySendError::Disconnected(msg)) => {
                let mut buf = self.ctx.buffer_pool.acquire();
                let res = write_message_to_backend(&mut buf, &msg, &*self.backend);
                self.ctx.buffer_pool.release(buf);
                self.ctx.set_health(res.as_ref().err().map(|e| e.to_string()));
                if let Err(e) = res {
                    error!(
                        topic = %self.topic_name,
                        channel = %self.name,
                        "failed to write message to backend: {e}"
                    );
                    return Err(e.into());
                }
                Ok(())
            }
        }
    }

    // ---- dequeue ----

    /// Non-blocking pop from the memory queue, falling back to the backend.
    /// Frames that fail to decode are dropped with a log line.
    pub fn try_pop_message(&self) -> Option<Message> {
        if let Ok(msg) = self.mem_rx.try_recv() {
            return Some(msg);
        }
        while let Ok(buf) = self.backend.read_chan().try_recv() {
            match decode_message(&buf) {
                Ok(msg) => return Some(msg),
                Err(e) => error!(channel = %self.name, "failed to decode message: {e}"),
            }
        }
        None
    }

    /// Wait for the next deliverable message.
    pub async fn pop_message(&self) -> Option<Message> {
        let backend_rx = self.backend.read_chan().clone();
        loop {
            tokio::select! {
                res = self.mem_rx.recv_async() => return res.ok(),
                res = backend_rx.recv_async() => {
                    let buf = res.ok()?;
                    match decode_message(&buf) {
                        Ok(msg) => return Some(msg),
                        Err(e) => {
                            error!(channel = %self.name, "failed to decode message: {e}");
                            continue;
                        }
                    }
                }
            }
        }
    }

    // ---- delivery lifecycle ----

    /// Record `msg` as delivered to `client_id`, due for redelivery at
    /// `now + timeout`. The message's attempt counter ticks here: it is
    /// leaving the channel toward a consumer.
    pub fn start_in_flight_timeout(
        &self,
        mut msg: Message,
        client_id: i64,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        if self.exiting() {
            return Err(ChannelError::Exiting);
        }
        msg.client_id = client_id;
        msg.attempts = msg.attempts.saturating_add(1);
        msg.pri = unix_nanos() + timeout.as_nanos() as i64;

        self.in_flight
            .lock()
            .push(msg)
            .map_err(|_| ChannelError::AlreadyInFlight)
    }

    /// Acknowledge and drop an in-flight message.
    pub fn finish_message(&self, client_id: i64, id: &MessageId) -> Result<(), ChannelError> {
        self.pop_in_flight(client_id, id).map(|_| ())
    }

    /// Return an in-flight message to the queue: immediately when `timeout`
    /// is zero, otherwise after parking in the deferred queue.
    pub fn requeue_message(
        &self,
        client_id: i64,
        id: &MessageId,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        let msg = self.pop_in_flight(client_id, id)?;
        self.requeue_count.fetch_add(1, Ordering::Relaxed);

        if timeout.is_zero() {
            if self.exiting() {
                return Err(ChannelError::Exiting);
            }
            return self.put(msg);
        }
        self.start_deferred_timeout(msg, timeout)
    }

    /// Push an in-flight message's redelivery deadline out to
    /// `now + timeout`, capped at the configured maximum. A zero timeout
    /// means the configured default. The deadline never moves backwards.
    pub fn touch_message(
        &self,
        client_id: i64,
        id: &MessageId,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        let opts = self.ctx.opts();
        let timeout = if timeout.is_zero() {
            opts.msg_timeout()
        } else {
            timeout.min(opts.max_msg_timeout())
        };

        let mut queue = self.in_flight.lock();
        let owner = queue.owner(id).ok_or(ChannelError::MessageNotInFlight)?;
        if owner != client_id {
            return Err(ChannelError::ClientNotFound);
        }
        let mut msg = queue.remove(id).ok_or(ChannelError::MessageNotInFlight)?;
        msg.pri = (unix_nanos() + timeout.as_nanos() as i64).max(msg.pri);
        queue.push(msg).map_err(|_| ChannelError::AlreadyInFlight)
    }

    fn pop_in_flight(&self, client_id: i64, id: &MessageId) -> Result<Message, ChannelError> {
        let mut queue = self.in_flight.lock();
        let owner = queue.owner(id).ok_or(ChannelError::MessageNotInFlight)?;
        if owner != client_id {
            return Err(ChannelError::ClientNotFound);
        }
        queue.remove(id).ok_or(ChannelError::MessageNotInFlight)
    }

    fn start_deferred_timeout(&self, mut msg: Message, timeout: Duration) -> Result<(), ChannelError> {
        let timeout = timeout.min(self.ctx.opts().max_req_timeout());
        msg.pri = unix_nanos() + timeout.as_nanos() as i64;
        self.deferred
            .lock()
            .push(msg)
            .map_err(|_| ChannelError::AlreadyDeferred)
    }

    // ---- priority queue maintenance ----

    /// Expire in-flight entries whose deadline is at or before `now` and
    /// feed them back into the queue. Returns true iff anything expired.
    pub fn process_in_flight_queue(&self, now: i64) -> bool {
        if self.exiting() {
            return false;
        }

        let mut dirty = false;
        loop {
            let mut msg = match self.in_flight.lock().peek_and_shift(now) {
                Some(msg) => msg,
                None => break,
            };
            dirty = true;

            self.timeout_count.fetch_add(1, Ordering::Relaxed);
            msg.attempts = msg.attempts.saturating_add(1);

            let client = self.clients.read().get(&msg.client_id).cloned();
            if let Some(client) = client {
                client.timed_out_message();
            }

            debug!(channel = %self.name, id = %msg.id, "message timed out");
            if let Err(e) = self.put(msg) {
                error!(channel = %self.name, "failed to requeue timed out message: {e}");
            }
        }
        dirty
    }

    /// Release deferred entries whose delay has elapsed. Returns true iff
    /// anything was released.
    pub fn process_deferred_queue(&self, now: i64) -> bool {
        if self.exiting() {
            return false;
        }

        let mut dirty = false;
        loop {
            let msg = match self.deferred.lock().peek_and_shift(now) {
                Some(msg) => msg,
                None => break,
            };
            dirty = true;

            if let Err(e) = self.put(msg) {
                error!(channel = %self.name, "failed to release deferred message: {e}");
            }
        }
        dirty
    }

    // ---- consumers ----

    pub fn add_client(&self, client_id: i64, client: Arc<dyn Consumer>) -> Result<(), ChannelError> {
        if self.exiting() {
            return Err(ChannelError::Exiting);
        }

        let mut clients = self.clients.write();
        if clients.contains_key(&client_id) {
            return Ok(());
        }
        let max = self.ctx.opts().max_channel_consumers;
        if max != 0 && clients.len() >= max {
            return Err(ChannelError::TooManyClients);
        }
        clients.insert(client_id, client);
        Ok(())
    }

    pub fn remove_client(&self, client_id: i64) {
        if self.exiting() {
            return;
        }

        let now_empty = {
            let mut clients = self.clients.write();
            clients.remove(&client_id);
            clients.is_empty()
        };

        if now_empty && self.ephemeral && !self.deleter.swap(true, Ordering::SeqCst) {
            let callback = Arc::clone(&self.delete_callback);
            tokio::spawn(async move { callback() });
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
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
        for client in self.clients.read().values() {
            if pause {
                client.pause();
            } else {
                client.un_pause();
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    // ---- teardown ----

    /// Drop every pending message: memory queue, backend, both priority
    /// queues and any per-client delivery state.
    pub fn empty(&self) -> Result<(), ChannelError> {
        self.in_flight.lock().clear();
        self.deferred.lock().clear();

        for client in self.clients.read().values() {
            client.empty();
        }

        while self.mem_rx.try_recv().is_ok() {}
        self.backend.empty()?;
        Ok(())
    }

    /// Flush pending state to the backend and close it. Consumers are
    /// closed; queued messages survive.
    pub fn close(&self) -> Result<(), ChannelError> {
        self.exit(false)
    }

    /// Close and additionally discard all state, removing the backend.
    pub fn delete(&self) -> Result<(), ChannelError> {
        self.exit(true)
    }

    fn exit(&self, deleted: bool) -> Result<(), ChannelError> {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::Exiting);
        }

        if deleted {
            info!(topic = %self.topic_name, channel = %self.name, "deleting");
        } else {
            info!(topic = %self.topic_name, channel = %self.name, "closing");
        }

        for client in self.clients.read().values() {
            client.close();
        }

        if deleted {
            // empty the queues so no messages linger, then drop the backend
            self.empty()?;
            return Ok(self.backend.delete()?);
        }

        self.flush();
        Ok(self.backend.close()?)
    }

    /// Write everything still held in memory (queue, in-flight, deferred)
    /// to the backend so unconsumed contents survive a restart.
    fn flush(&self) {
        let pending = self.mem_rx.len();
        if pending > 0 {
            info!(
                channel = %self.name,
                "flushing {pending} memory messages to backend"
            );
        }

        let mut buf = self.ctx.buffer_pool.acquire();
        while let Ok(msg) = self.mem_rx.try_recv() {
            if let Err(e) = write_message_to_backend(&mut buf, &msg, &*self.backend) {
                error!(channel = %self.name, "failed to write message to backend: {e}");
            }
        }
        for msg in self.in_flight.lock().drain() {
            if let Err(e) = write_message_to_backend(&mut buf, &msg, &*self.backend) {
                error!(channel = %self.name, "failed to write message to backend: {e}");
            }
        }
        for msg in self.deferred.lock().drain() {
            if let Err(e) = write_message_to_backend(&mut buf, &msg, &*self.backend) {
                error!(channel = %self.name, "failed to write message to backend: {e}");
            }
        }
        self.ctx.buffer_pool.release(buf);
    }
}
