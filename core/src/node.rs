//! Node facade
//!
//! Wires storage, the replication receiver, the sender manager and the
//! tombstone collector together behind the operations a client uses.

use crate::config::NodeConfig;
use crate::history::History;
use crate::network::{ReplicationListener, Transport};
use crate::replication::{DestinationStats, ReceiverStats, Receiver, ReplicationManager};
use crate::storage::{Conflict, Lookup, Storage};
use crate::types::{Content, Destination, DocumentId, NodeId, Version};
use crate::Result;
use std::net::SocketAddr;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct Node {
    config: NodeConfig,
    storage: Arc<Storage>,
    receiver: Arc<Receiver>,
    replication: Arc<ReplicationManager>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Open a node with RocksDB storage under `config.data_dir`
    pub fn open(config: NodeConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let storage = Arc::new(Storage::open_rocks(config.data_dir.join("db"))?);
        Self::with_storage(config, storage, transport)
    }

    pub fn with_storage(
        config: NodeConfig,
        storage: Arc<Storage>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let receiver = Arc::new(Receiver::new(Arc::clone(&storage)));
        let replication = Arc::new(ReplicationManager::new(
            Arc::clone(&storage),
            transport,
            config.replication.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            storage,
            receiver,
            replication,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start replication senders and the tombstone collector
    ///
    /// Destinations from the config seed the persisted list the first time.
    pub fn start(&self) -> Result<()> {
        if self.storage.stored_destinations()?.is_none() && !self.config.destinations.is_empty() {
            self.replication.seed(self.config.destinations.clone())?;
        } else {
            self.replication.start()?;
        }

        if let Some(interval) = self.config.tombstones.gc_interval() {
            let task = tokio::spawn(gc_loop(
                Arc::clone(&self.storage),
                Arc::clone(&self.replication),
                interval,
                self.config.tombstones.retention(),
                self.shutdown.subscribe(),
            ));
            self.track(task);
        }

        tracing::info!(
            node = %self.node_id(),
            name = %self.config.name,
            destinations = self.replication.active().len(),
            "Node started"
        );
        Ok(())
    }

    /// Accept replication traffic on `address`; returns the bound address
    pub async fn serve(&self, address: &str) -> Result<SocketAddr> {
        let listener = ReplicationListener::bind(address, Arc::clone(&self.receiver)).await?;
        let local = listener.local_addr()?;
        let task = tokio::spawn(listener.serve(self.shutdown.subscribe()));
        self.track(task);
        Ok(local)
    }

    pub fn node_id(&self) -> NodeId {
        self.storage.node_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn receiver(&self) -> Arc<Receiver> {
        Arc::clone(&self.receiver)
    }

    pub fn get(&self, identity: &DocumentId) -> Result<Lookup> {
        self.storage.get(identity)
    }

    pub fn put(&self, identity: &DocumentId, content: Content) -> Result<History> {
        self.storage.put(identity, content)
    }

    pub fn delete(&self, identity: &DocumentId) -> Result<()> {
        self.storage.delete(identity)
    }

    pub fn history(&self, identity: &DocumentId) -> Result<Option<History>> {
        self.storage.history(identity)
    }

    pub fn get_candidate(&self, candidate_id: &str) -> Result<Option<Version>> {
        self.storage.get_candidate(candidate_id)
    }

    pub fn conflicts(&self) -> Result<Vec<Conflict>> {
        self.storage.conflicts()
    }

    pub fn resolve_by_delete(&self, identity: &DocumentId) -> Result<()> {
        self.storage.resolve_by_delete(identity)
    }

    pub fn resolve_by_overwrite(&self, identity: &DocumentId, content: Content) -> Result<History> {
        self.storage.resolve_by_overwrite(identity, content)
    }

    pub fn destinations(&self) -> Result<Vec<Destination>> {
        self.replication.destinations()
    }

    pub async fn set_destinations(&self, destinations: Vec<Destination>) -> Result<()> {
        self.replication.set_destinations(destinations).await
    }

    pub async fn add_destination(&self, destination: Destination) -> Result<()> {
        let mut destinations = self.destinations()?;
        destinations.retain(|d| d.node_id != destination.node_id);
        destinations.push(destination);
        self.set_destinations(destinations).await
    }

    /// Returns false when the destination was not configured
    pub async fn remove_destination(&self, node_id: &NodeId) -> Result<bool> {
        let mut destinations = self.destinations()?;
        let before = destinations.len();
        destinations.retain(|d| &d.node_id != node_id);
        if destinations.len() == before {
            return Ok(false);
        }
        self.set_destinations(destinations).await?;
        Ok(true)
    }

    pub fn replication_stats(&self) -> Vec<DestinationStats> {
        self.replication.stats()
    }

    pub fn receiver_stats(&self) -> Vec<(NodeId, ReceiverStats)> {
        self.receiver.stats()
    }

    /// Run one tombstone collection pass now
    pub fn collect_garbage(&self) -> Result<usize> {
        let destinations: Vec<NodeId> = self.destinations()?.iter().map(|d| d.node_id).collect();
        self.storage
            .collect_garbage(&destinations, self.config.tombstones.retention())
    }

    /// Stop senders, the collector and any listener
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.replication.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock();
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!(node = %self.node_id(), "Node stopped");
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }
}

async fn gc_loop(
    storage: Arc<Storage>,
    replication: Arc<ReplicationManager>,
    interval: std::time::Duration,
    retention: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let destinations: Vec<NodeId> = match replication.destinations() {
                    Ok(dests) => dests.iter().map(|d| d.node_id).collect(),
                    Err(e) => {
                        tracing::warn!(error = %e, "Tombstone collection skipped");
                        continue;
                    }
                };
                let storage = Arc::clone(&storage);
                let result = tokio::task::spawn_blocking(move || {
                    storage.collect_garbage(&destinations, retention)
                })
                .await;
                match result {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!(error = %e, "Tombstone collection failed"),
                    Err(e) => tracing::warn!(error = %e, "Tombstone collector panicked"),
                }
            }
        }
    }
}
