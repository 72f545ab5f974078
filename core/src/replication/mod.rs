//! Replication between nodes
//!
//! - `sender`: pushes the local change log to one destination
//! - `receiver`: classifies and applies batches from peers
//! - `manager`: one sender task per configured destination
//! - `protocol`: wire messages, `backoff`: retry policy, `stats`: counters

pub mod backoff;
pub mod manager;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod stats;

pub use backoff::Backoff;
pub use manager::ReplicationManager;
pub use protocol::{
    Heartbeat, ItemStatus, ReplicationAck, ReplicationBatch, ReplicationItem, ReplicationMessage,
    ReplicationReply,
};
pub use receiver::Receiver;
pub use sender::{Cycle, Sender};
pub use stats::{DestinationStats, ReceiverStats, SenderStats};
