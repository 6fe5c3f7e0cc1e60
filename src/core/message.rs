//! Message type and the bit-exact framing used on the spill path.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::core::backend::{BackendError, BackendQueue};

/// Length of a rendered message id in bytes (16 hex characters).
pub const MSG_ID_LENGTH: usize = 16;

/// Smallest frame that can hold a message: timestamp + attempts + id.
pub const MIN_VALID_MSG_LENGTH: usize = 8 + 2 + MSG_ID_LENGTH;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message buffer size ({0})")]
    InvalidBufferSize(usize),
}

/// A 16-byte, hex-renderable message identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; MSG_ID_LENGTH]);

impl MessageId {
    pub fn as_bytes(&self) -> &[u8; MSG_ID_LENGTH] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ids are produced as ASCII hex by the guid factory
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

/// A message flowing through the broker.
///
/// `client_id` and `pri` are only meaningful while the message sits in an
/// in-flight or deferred priority queue; elsewhere their values are
/// unspecified.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub body: Bytes,
    pub timestamp: i64,
    pub attempts: u16,

    /// Delay before the message becomes deliverable. Zero means immediate.
    pub deferred: Duration,

    pub client_id: i64,
    pub pri: i64,
}

impl Message {
    pub fn new(id: MessageId, body: Bytes) -> Self {
        Self {
            id,
            body,
            timestamp: unix_nanos(),
            attempts: 0,
            deferred: Duration::ZERO,
            client_id: 0,
            pri: 0,
        }
    }

    /// Copy produced at the topic fan-out step: same id, body, timestamp and
    /// defer delay, but a fresh delivery state.
    pub fn fanout_copy(&self) -> Self {
        let mut m = Message::new(self.id, self.body.clone());
        m.timestamp = self.timestamp;
        m.deferred = self.deferred;
        m
    }

    /// Encode the spill frame:
    ///
    /// ```text
    /// [8] timestamp (big-endian nanoseconds)
    /// [2] attempts
    /// [16] id
    /// [n] body
    /// ```
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.timestamp as u64);
        buf.put_u16(self.attempts);
        buf.put_slice(&self.id.0);
        buf.put_slice(&self.body);
    }
}

/// Decode a spill frame produced by [`Message::encode`].
pub fn decode_message(data: &[u8]) -> Result<Message, MessageError> {
    if data.len() < MIN_VALID_MSG_LENGTH {
        return Err(MessageError::InvalidBufferSize(data.len()));
    }

    let timestamp = u64::from_be_bytes(data[0..8].try_into().unwrap_or_default()) as i64;
    let attempts = u16::from_be_bytes(data[8..10].try_into().unwrap_or_default());
    let mut id = [0u8; MSG_ID_LENGTH];
    id.copy_from_slice(&data[10..10 + MSG_ID_LENGTH]);

    let mut msg = Message::new(MessageId(id), Bytes::copy_from_slice(&data[10 + MSG_ID_LENGTH..]));
    msg.timestamp = timestamp;
    msg.attempts = attempts;
    Ok(msg)
}

/// Encode `msg` into `buf` and hand the frame to the backend queue.
pub fn write_message_to_backend(
    buf: &mut BytesMut,
    msg: &Message,
    backend: &dyn BackendQueue,
) -> Result<(), BackendError> {
    buf.clear();
    msg.encode(buf);
    backend.put(buf)
}

/// Current wall-clock time in epoch nanoseconds.
pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}
