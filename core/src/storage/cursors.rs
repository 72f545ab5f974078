//! Replication positions and destination configuration
//!
//! Outbound cursors record the last local sequence a destination acknowledged.
//! Inbound positions record the last sequence accepted from a source, which is
//! what heartbeat replies report back.

use super::Storage;
use crate::storage::kv::Column;
use crate::types::{now_millis, Destination, NodeId};
use crate::Result;
use serde::{Deserialize, Serialize};

const OUTBOUND: &[u8] = b"out/";
const INBOUND: &[u8] = b"in/";
const META_DESTINATIONS: &[u8] = b"destinations";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct CursorRecord {
    seq: u64,
    updated_at: u64,
}

fn cursor_key(prefix: &[u8], node: &NodeId) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(node.as_bytes());
    key
}

impl Storage {
    /// Last local sequence acknowledged by `destination`
    pub fn cursor(&self, destination: &NodeId) -> Result<u64> {
        self.read_position(OUTBOUND, destination)
    }

    pub fn save_cursor(&self, destination: &NodeId, seq: u64) -> Result<()> {
        self.write_position(OUTBOUND, destination, seq)
    }

    pub fn remove_cursor(&self, destination: &NodeId) -> Result<()> {
        let mut batch = crate::storage::WriteBatch::new();
        batch.delete(Column::Cursors, cursor_key(OUTBOUND, destination));
        self.kv().write(batch)
    }

    /// Last sequence of `source` that this node accepted
    pub fn inbound_position(&self, source: &NodeId) -> Result<u64> {
        self.read_position(INBOUND, source)
    }

    pub fn save_inbound_position(&self, source: &NodeId, seq: u64) -> Result<()> {
        self.write_position(INBOUND, source, seq)
    }

    /// Persisted destinations, empty when never configured
    pub fn destinations(&self) -> Result<Vec<Destination>> {
        Ok(self.stored_destinations()?.unwrap_or_default())
    }

    /// `None` until a destination list has been saved, even an empty one
    pub fn stored_destinations(&self) -> Result<Option<Vec<Destination>>> {
        match self.kv().get(Column::Meta, META_DESTINATIONS)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save_destinations(&self, destinations: &[Destination]) -> Result<()> {
        let bytes = serde_json::to_vec(destinations)?;
        self.kv().put(Column::Meta, META_DESTINATIONS, &bytes)
    }

    fn read_position(&self, prefix: &[u8], node: &NodeId) -> Result<u64> {
        match self.kv().get(Column::Cursors, &cursor_key(prefix, node))? {
            Some(bytes) => {
                let record: CursorRecord = bincode::deserialize(&bytes)?;
                Ok(record.seq)
            }
            None => Ok(0),
        }
    }

    fn write_position(&self, prefix: &[u8], node: &NodeId, seq: u64) -> Result<()> {
        let record = CursorRecord {
            seq,
            updated_at: now_millis(),
        };
        let bytes = bincode::serialize(&record)?;
        self.kv().put(Column::Cursors, &cursor_key(prefix, node), &bytes)
    }
}
