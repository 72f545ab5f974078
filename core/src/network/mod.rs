//! Networking module
//!
//! Replication senders talk to peers through the `Transport` trait. `tcp`
//! carries length-prefixed CBOR frames over TCP; `memory` connects receivers
//! in-process and can simulate partitions.

pub mod codec;
pub mod memory;
pub mod tcp;

use crate::replication::protocol::{ReplicationMessage, ReplicationReply};
use crate::types::Destination;
use crate::Result;
use async_trait::async_trait;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::{ReplicationListener, TcpTransport};

/// Request/response exchange with a destination's receiver
///
/// Failures to reach the peer are `Error::ReplicationUnavailable`; senders
/// retry them with backoff.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        destination: &Destination,
        message: ReplicationMessage,
    ) -> Result<ReplicationReply>;
}
