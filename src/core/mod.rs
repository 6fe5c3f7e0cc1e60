pub mod backend;
pub mod buffer_pool;
pub mod channel;
pub mod consumer;
pub mod context;
pub mod guid;
pub mod message;
pub mod pqueue;
pub mod topic;
