//! Sender lifecycle per destination
//!
//! Keeps exactly one running sender per configured destination. Changing the
//! destination list persists it, stops senders for removed (or re-addressed)
//! destinations and starts senders for new ones.

use super::sender::Sender;
use super::stats::{DestinationStats, SenderStats};
use crate::config::ReplicationConfig;
use crate::network::Transport;
use crate::storage::Storage;
use crate::types::{Destination, NodeId};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct SenderHandle {
    destination: Destination,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    stats: Arc<Mutex<SenderStats>>,
}

impl SenderHandle {
    fn stop(self) -> JoinHandle<()> {
        let _ = self.shutdown.send(true);
        self.task
    }
}

pub struct ReplicationManager {
    storage: Arc<Storage>,
    transport: Arc<dyn Transport>,
    config: ReplicationConfig,
    senders: Mutex<HashMap<NodeId, SenderHandle>>,
    /// Serializes destination list changes across their await points
    updates: tokio::sync::Mutex<()>,
}

impl ReplicationManager {
    pub fn new(storage: Arc<Storage>, transport: Arc<dyn Transport>, config: ReplicationConfig) -> Self {
        Self {
            storage,
            transport,
            config,
            senders: Mutex::new(HashMap::new()),
            updates: tokio::sync::Mutex::new(()),
        }
    }

    /// Start senders for the persisted destinations
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let destinations = self.storage.destinations()?;
        for handle in self.stop_stale(&destinations) {
            drop(handle.stop());
        }
        self.spawn_missing(&destinations)
    }

    /// Persist an initial destination list and start its senders
    pub fn seed(&self, destinations: Vec<Destination>) -> Result<()> {
        self.check(&destinations)?;
        self.storage.save_destinations(&destinations)?;
        self.start()
    }

    pub fn destinations(&self) -> Result<Vec<Destination>> {
        self.storage.destinations()
    }

    /// Replace the destination list and restart senders accordingly
    ///
    /// Senders of removed destinations are stopped and awaited before their
    /// cursors are dropped, so a re-added destination resyncs from zero.
    pub async fn set_destinations(&self, destinations: Vec<Destination>) -> Result<()> {
        let _update = self.updates.lock().await;
        let keep = self.check(&destinations)?;

        let previous = self.storage.destinations()?;
        self.storage.save_destinations(&destinations)?;

        for handle in self.stop_stale(&destinations) {
            let destination = handle.destination.clone();
            if let Err(e) = handle.stop().await {
                tracing::warn!(destination = %destination, error = %e, "Sender task ended abnormally");
            }
        }
        for old in previous.iter().filter(|old| !keep.contains(&old.node_id)) {
            self.storage.remove_cursor(&old.node_id)?;
        }

        self.spawn_missing(&destinations)
    }

    fn check(&self, destinations: &[Destination]) -> Result<HashSet<NodeId>> {
        let me = self.storage.node_id();
        let mut seen = HashSet::new();
        for dest in destinations {
            if dest.node_id == me {
                return Err(Error::Config("a node cannot replicate to itself".into()));
            }
            if !seen.insert(dest.node_id) {
                return Err(Error::Config(format!("destination {} listed twice", dest.node_id)));
            }
        }
        Ok(seen)
    }

    /// Detach senders whose destination was removed or re-addressed
    fn stop_stale(&self, destinations: &[Destination]) -> Vec<SenderHandle> {
        let mut senders = self.senders.lock();
        let stale: Vec<NodeId> = senders
            .iter()
            .filter(|(id, handle)| !destinations.iter().any(|d| &d.node_id == *id && d == &handle.destination))
            .map(|(id, _)| *id)
            .collect();

        stale
            .into_iter()
            .filter_map(|id| senders.remove(&id))
            .inspect(|handle| {
                tracing::info!(destination = %handle.destination, "Stopping replication sender");
            })
            .collect()
    }

    fn spawn_missing(&self, destinations: &[Destination]) -> Result<()> {
        let mut senders = self.senders.lock();
        for dest in destinations {
            if senders.contains_key(&dest.node_id) {
                continue;
            }
            let sender = Sender::new(
                Arc::clone(&self.storage),
                Arc::clone(&self.transport),
                dest.clone(),
                self.config.clone(),
            )?;
            let stats = sender.stats();
            let (shutdown, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(sender.run(shutdown_rx));
            senders.insert(
                dest.node_id,
                SenderHandle {
                    destination: dest.clone(),
                    shutdown,
                    task,
                    stats,
                },
            );
        }
        Ok(())
    }

    /// Destinations that currently have a running sender
    pub fn active(&self) -> Vec<Destination> {
        let senders = self.senders.lock();
        let mut active: Vec<Destination> = senders.values().map(|h| h.destination.clone()).collect();
        active.sort_by_key(|d| d.node_id);
        active
    }

    pub fn stats(&self) -> Vec<DestinationStats> {
        let senders = self.senders.lock();
        let mut stats: Vec<DestinationStats> = senders
            .values()
            .map(|h| DestinationStats {
                node_id: h.destination.node_id,
                address: h.destination.address.clone(),
                stats: h.stats.lock().clone(),
            })
            .collect();
        stats.sort_by_key(|s| s.node_id);
        stats
    }

    /// Stop every sender and wait for them to exit
    pub async fn shutdown(&self) {
        let handles: Vec<SenderHandle> = {
            let mut senders = self.senders.lock();
            senders.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            let destination = handle.destination.clone();
            if let Err(e) = handle.stop().await {
                tracing::warn!(destination = %destination, error = %e, "Sender task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryNetwork;
    use crate::replication::Receiver;
    use crate::types::{Content, DocumentId};
    use std::time::Duration;

    fn manager() -> ReplicationManager {
        let network = MemoryNetwork::new();
        ReplicationManager::new(
            Arc::new(Storage::in_memory().unwrap()),
            Arc::new(network.transport("mem://self")),
            ReplicationConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_set_destinations_starts_and_stops_senders() {
        let manager = manager();
        let a = Destination::new(NodeId([1; 16]), "mem://a");
        let b = Destination::new(NodeId([2; 16]), "mem://b");

        manager.set_destinations(vec![a.clone(), b.clone()]).await.unwrap();
        assert_eq!(manager.active(), vec![a.clone(), b.clone()]);
        assert_eq!(manager.destinations().unwrap(), vec![a.clone(), b.clone()]);

        manager.set_destinations(vec![b.clone()]).await.unwrap();
        assert_eq!(manager.active(), vec![b.clone()]);

        manager.shutdown().await;
        assert!(manager.active().is_empty());
    }

    #[tokio::test]
    async fn test_removed_destination_cursor_stays_dropped() {
        let network = MemoryNetwork::new();
        let remote = Arc::new(Storage::in_memory().unwrap());
        network.register("mem://a", Arc::new(Receiver::new(Arc::clone(&remote))));

        let storage = Arc::new(Storage::in_memory().unwrap());
        storage.put(&DocumentId::from("users/1"), Content::new("a")).unwrap();
        let config = ReplicationConfig {
            poll_interval_ms: 10,
            ..ReplicationConfig::default()
        };
        let manager = ReplicationManager::new(
            Arc::clone(&storage),
            Arc::new(network.transport("mem://self")),
            config,
        );
        let a = Destination::new(remote.node_id(), "mem://a");

        manager.set_destinations(vec![a.clone()]).await.unwrap();
        for _ in 0..200 {
            if storage.cursor(&a.node_id).unwrap() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(storage.cursor(&a.node_id).unwrap(), 1);

        manager.set_destinations(Vec::new()).await.unwrap();
        assert_eq!(storage.cursor(&a.node_id).unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(storage.cursor(&a.node_id).unwrap(), 0);
        assert!(manager.active().is_empty());
    }

    #[tokio::test]
    async fn test_readdressed_destination_restarts_sender() {
        let manager = manager();
        let a = Destination::new(NodeId([1; 16]), "mem://a");
        manager.set_destinations(vec![a.clone()]).await.unwrap();

        let moved = Destination::new(a.node_id, "mem://a2");
        manager.set_destinations(vec![moved.clone()]).await.unwrap();
        assert_eq!(manager.active(), vec![moved]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejects_self_and_duplicates() {
        let manager = manager();
        let me = Destination::new(manager.storage.node_id(), "mem://self");
        assert!(matches!(manager.set_destinations(vec![me]).await, Err(Error::Config(_))));

        let a = Destination::new(NodeId([1; 16]), "mem://a");
        assert!(matches!(
            manager.set_destinations(vec![a.clone(), a]).await,
            Err(Error::Config(_))
        ));
        assert!(manager.active().is_empty());
    }
}
