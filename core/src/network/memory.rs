//! In-process transport
//!
//! Receivers register under an address. Every message is framed and decoded
//! exactly as over TCP, so wire encoding is exercised without sockets. Links can
//! be cut to simulate partitions and downed peers.

use super::codec::{decode_frame, encode_frame};
use super::Transport;
use crate::replication::protocol::{ReplicationMessage, ReplicationReply};
use crate::replication::Receiver;
use crate::types::Destination;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<String, Arc<Receiver>>,
    /// Directed (from, to) links that drop every message
    cut: HashSet<(String, String)>,
    /// Addresses that are unreachable from anywhere
    down: HashSet<String>,
}

/// Shared in-memory network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: impl Into<String>, receiver: Arc<Receiver>) {
        self.lock().endpoints.insert(address.into(), receiver);
    }

    pub fn unregister(&self, address: &str) {
        self.lock().endpoints.remove(address);
    }

    /// Transport that sends from `local_address`
    pub fn transport(&self, local_address: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local: local_address.into(),
        }
    }

    /// Cut both directions between two addresses
    pub fn partition(&self, a: &str, b: &str) {
        let mut state = self.lock();
        state.cut.insert((a.to_string(), b.to_string()));
        state.cut.insert((b.to_string(), a.to_string()));
    }

    pub fn heal(&self, a: &str, b: &str) {
        let mut state = self.lock();
        state.cut.remove(&(a.to_string(), b.to_string()));
        state.cut.remove(&(b.to_string(), a.to_string()));
    }

    /// Make an address unreachable
    pub fn take_down(&self, address: &str) {
        self.lock().down.insert(address.to_string());
    }

    pub fn bring_up(&self, address: &str) {
        self.lock().down.remove(address);
    }

    pub fn heal_all(&self) {
        let mut state = self.lock();
        state.cut.clear();
        state.down.clear();
    }

    fn route(&self, from: &str, to: &str) -> Result<Arc<Receiver>> {
        let state = self.lock();
        if state.down.contains(to) || state.cut.contains(&(from.to_string(), to.to_string())) {
            return Err(Error::ReplicationUnavailable(format!("{} is unreachable", to)));
        }
        state
            .endpoints
            .get(to)
            .cloned()
            .ok_or_else(|| Error::ReplicationUnavailable(format!("no endpoint at {}", to)))
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock()
    }
}

/// One node's view of a `MemoryNetwork`
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(
        &self,
        destination: &Destination,
        message: ReplicationMessage,
    ) -> Result<ReplicationReply> {
        let receiver = self.network.route(&self.local, &destination.address)?;
        let request: ReplicationMessage = decode_frame(&encode_frame(&message)?)?;

        let reply = receiver.handle(request).await;

        // A partition can open while the request is in flight; the reply is lost.
        self.network.route(&destination.address, &self.local)?;
        decode_frame(&encode_frame(&reply)?)
    }
}
