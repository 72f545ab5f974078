//! A set of nodes wired together over an in-memory network

use crate::config::NodeConfig;
use crate::network::{MemoryNetwork, MemoryTransport, Transport};
use crate::node::Node;
use crate::storage::Storage;
use crate::types::Destination;
use anyhow::{bail, Result};
use std::ops::Index;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Node config with timings short enough for tests
///
/// The tombstone collector is disabled; tests call `collect_garbage` directly.
pub fn fast_config(name: impl Into<String>) -> NodeConfig {
    let mut config = NodeConfig {
        name: name.into(),
        ..NodeConfig::default()
    };
    config.replication.poll_interval_ms = 50;
    config.replication.heartbeat_interval_ms = 200;
    config.replication.request_timeout_ms = 1_000;
    config.replication.backoff_base_ms = 20;
    config.replication.backoff_max_ms = 200;
    config.tombstones.retention_ms = 0;
    config.tombstones.gc_interval_ms = 0;
    config
}

struct Member {
    address: String,
    node: Node,
    on_disk: bool,
}

/// Nodes addressed as `mem://node-<index>`
///
/// Nothing replicates until links are added with `replicate`.
pub struct TestCluster {
    network: MemoryNetwork,
    members: Vec<Member>,
}

impl TestCluster {
    /// Create `count` started nodes with in-memory storage
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(count: usize) -> Result<Self> {
        Self::build(count, false, |_, config, network, address| {
            let storage = Arc::new(Storage::in_memory()?);
            let node = Node::with_storage(config, storage, Arc::new(network.transport(address)))?;
            Ok(node)
        })
    }

    /// Create `count` started nodes backed by RocksDB under `base/node-<i>`
    pub fn on_disk(count: usize, base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref();
        Self::build(count, true, |index, mut config, network, address| {
            config.data_dir = base.join(format!("node-{}", index));
            Ok(Node::open(config, Arc::new(network.transport(address)))?)
        })
    }

    /// On-disk cluster in a fresh temporary directory, removed when dropped
    #[cfg(feature = "test-utils")]
    pub fn on_temp_disk(count: usize) -> Result<(Self, tempfile::TempDir)> {
        let dir = tempfile::tempdir()?;
        let cluster = Self::on_disk(count, dir.path())?;
        Ok((cluster, dir))
    }

    fn build<F>(count: usize, on_disk: bool, mut open: F) -> Result<Self>
    where
        F: FnMut(usize, NodeConfig, &MemoryNetwork, &str) -> Result<Node>,
    {
        let network = MemoryNetwork::new();
        let mut members = Vec::with_capacity(count);

        for index in 0..count {
            let address = format!("mem://node-{}", index);
            let node = open(index, fast_config(format!("node-{}", index)), &network, &address)?;
            network.register(address.clone(), node.receiver());
            node.start()?;
            members.push(Member {
                address,
                node,
                on_disk,
            });
        }

        Ok(Self { network, members })
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.members[index].node
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.members.iter().map(|m| &m.node)
    }

    pub fn address(&self, index: usize) -> &str {
        &self.members[index].address
    }

    /// How other nodes reach node `index`
    pub fn destination(&self, index: usize) -> Destination {
        Destination::new(self.node(index).node_id(), self.address(index))
    }

    /// Add a one-way replication link
    pub async fn replicate(&self, from: usize, to: usize) -> Result<()> {
        if from == to {
            bail!("node {} cannot replicate to itself", from);
        }
        self.node(from).add_destination(self.destination(to)).await?;
        Ok(())
    }

    /// Replicate every node to every other node
    pub async fn replicate_all(&self) -> Result<()> {
        for from in 0..self.len() {
            for to in 0..self.len() {
                if from != to {
                    self.replicate(from, to).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn stop_replication(&self, from: usize, to: usize) -> Result<bool> {
        Ok(self.node(from).remove_destination(&self.node(to).node_id()).await?)
    }

    /// Cut both directions between two nodes
    pub fn partition(&self, a: usize, b: usize) {
        self.network.partition(self.address(a), self.address(b));
    }

    pub fn heal(&self, a: usize, b: usize) {
        self.network.heal(self.address(a), self.address(b));
    }

    /// Stop node `index` and start it again over the same storage
    ///
    /// Persisted destinations and cursors are picked up on restart.
    pub async fn restart(&mut self, index: usize) -> Result<()> {
        let old = self.members.remove(index);
        let address = old.address.clone();
        old.node.shutdown().await;
        self.network.unregister(&address);

        let config = old.node.config().clone();
        let transport = Arc::new(self.network.transport(address.clone()));
        let node = if old.on_disk {
            drop(old.node);
            reopen(config, transport).await?
        } else {
            Node::with_storage(config, Arc::clone(old.node.storage()), transport)?
        };

        self.network.register(address.clone(), node.receiver());
        node.start()?;
        self.members.insert(
            index,
            Member {
                address,
                node,
                on_disk: old.on_disk,
            },
        );
        Ok(())
    }

    /// Stop every node
    pub async fn shutdown(&self) {
        for member in &self.members {
            member.node.shutdown().await;
        }
    }
}

/// Open a RocksDB node, waiting out in-flight requests that still hold the old handle
async fn reopen(config: NodeConfig, transport: Arc<MemoryTransport>) -> Result<Node> {
    let mut attempts = 0;
    loop {
        match Node::open(config.clone(), Arc::clone(&transport) as Arc<dyn Transport>) {
            Ok(node) => return Ok(node),
            Err(e) if attempts < 20 => {
                attempts += 1;
                tracing::debug!(error = %e, attempts, "Storage still locked, retrying open");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

impl Index<usize> for TestCluster {
    type Output = Node;

    fn index(&self, index: usize) -> &Self::Output {
        self.node(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Content, DocumentId};

    #[tokio::test]
    async fn test_cluster_nodes_are_distinct() {
        let cluster = TestCluster::new(3).unwrap();
        assert_eq!(cluster.len(), 3);
        assert_ne!(cluster[0].node_id(), cluster[1].node_id());
        assert_eq!(cluster.address(2), "mem://node-2");
        assert!(cluster.replicate(1, 1).await.is_err());
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_keeps_documents_and_destinations() {
        let mut cluster = TestCluster::new(2).unwrap();
        cluster.replicate(0, 1).await.unwrap();
        let id = DocumentId::from("users/1");
        cluster[0].put(&id, Content::new("a")).unwrap();

        cluster.restart(0).await.unwrap();
        assert!(cluster[0].get(&id).unwrap().document().is_some());
        assert_eq!(cluster[0].destinations().unwrap(), vec![cluster.destination(1)]);
        cluster.shutdown().await;
    }
}
