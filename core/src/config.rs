//! Node configuration
//!
//! Stored as JSON; missing fields fall back to defaults so a config file only
//! needs to name what it changes.

use crate::types::Destination;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Human-readable name used in logs and the CLI prompt
    pub name: String,

    /// Storage directory
    pub data_dir: PathBuf,

    /// Address the replication listener binds to
    pub listen_addr: String,

    /// Initial destinations; persisted destinations take precedence once set
    pub destinations: Vec<Destination>,

    pub replication: ReplicationConfig,

    pub tombstones: TombstoneConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "replidoc".to_string(),
            data_dir: PathBuf::from("./replidoc-data"),
            listen_addr: "127.0.0.1:7400".to_string(),
            destinations: Vec::new(),
            replication: ReplicationConfig::default(),
            tombstones: TombstoneConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.replication.validate()?;
        for dest in &self.destinations {
            if dest.address.is_empty() {
                return Err(Error::Config(format!("destination {} has no address", dest.node_id)));
            }
        }
        Ok(())
    }
}

/// Sender tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Periodic scan of the change log when no write wakes the sender
    pub poll_interval_ms: u64,

    /// Idle time after which a heartbeat is sent
    pub heartbeat_interval_ms: u64,

    /// Upper bound on one send/ack round trip
    pub request_timeout_ms: u64,

    pub backoff_base_ms: u64,

    pub backoff_max_ms: u64,

    /// Maximum change-log entries per batch
    pub batch_size: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            heartbeat_interval_ms: 5_000,
            request_timeout_ms: 10_000,
            backoff_base_ms: 250,
            backoff_max_ms: 30_000,
            batch_size: 128,
        }
    }
}

impl ReplicationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("replication.batch_size must be positive".into()));
        }
        if self.poll_interval_ms == 0
            || self.heartbeat_interval_ms == 0
            || self.request_timeout_ms == 0
            || self.backoff_base_ms == 0
        {
            return Err(Error::Config(
                "replication intervals and timeouts must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Tombstone retention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TombstoneConfig {
    /// Minimum age before an acknowledged tombstone may be purged
    pub retention_ms: u64,

    /// How often the collector runs; zero disables it
    pub gc_interval_ms: u64,
}

impl Default for TombstoneConfig {
    fn default() -> Self {
        Self {
            retention_ms: 24 * 60 * 60 * 1000,
            gc_interval_ms: 60_000,
        }
    }
}

impl TombstoneConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn gc_interval(&self) -> Option<Duration> {
        (self.gc_interval_ms > 0).then(|| Duration::from_millis(self.gc_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeId;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"name": "node-a", "replication": {"batch_size": 8}}"#).unwrap();
        assert_eq!(config.name, "node-a");
        assert_eq!(config.replication.batch_size, 8);
        assert_eq!(config.replication.poll_interval_ms, 1_000);
        assert_eq!(config.tombstones, TombstoneConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("node.json");

        let mut config = NodeConfig::default();
        config.destinations.push(Destination::new(NodeId::new(), "127.0.0.1:7401"));
        config.save(&path).unwrap();

        assert_eq!(NodeConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let mut config = NodeConfig::default();
        config.replication.batch_size = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_gc_interval_zero_disables() {
        let tombstones = TombstoneConfig {
            retention_ms: 0,
            gc_interval_ms: 0,
        };
        assert!(tombstones.gc_interval().is_none());
    }
}
