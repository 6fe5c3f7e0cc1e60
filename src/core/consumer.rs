//! The channel's view of a subscribed client.
//!
//! The protocol layer owns the concrete connection; the engine only needs
//! enough surface to close, drain and nudge it.

pub trait Consumer: Send + Sync {
    fn id(&self) -> i64;

    /// Tear down the connection.
    fn close(&self);

    /// Drop any buffered per-client delivery state.
    fn empty(&self);

    fn pause(&self);

    fn un_pause(&self);

    /// One of this client's in-flight messages timed out and was requeued.
    fn timed_out_message(&self);

    /// How many more messages the client is ready to receive.
    fn ready_count(&self) -> i64;
}
