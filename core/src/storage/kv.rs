//! Keyed store abstraction
//!
//! The replication engine only needs ordered keyspaces ("columns") with
//! atomic multi-key writes. `MemoryKv` backs tests and embedded use,
//! `RocksKv` (see `rocks.rs`) backs real nodes.

use crate::Result;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Logical keyspaces of a node's store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    /// identity -> Document
    Documents,
    /// identity -> Tombstone
    Tombstones,
    /// identity -> ConflictSet
    Conflicts,
    /// big-endian local sequence -> identity
    Changes,
    /// destination node id -> replication cursor
    Cursors,
    /// node identity, destinations
    Meta,
}

impl Column {
    pub const ALL: [Column; 6] = [
        Column::Documents,
        Column::Tombstones,
        Column::Conflicts,
        Column::Changes,
        Column::Cursors,
        Column::Meta,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Column::Documents => "documents",
            Column::Tombstones => "tombstones",
            Column::Conflicts => "conflicts",
            Column::Changes => "changes",
            Column::Cursors => "cursors",
            Column::Meta => "meta",
        }
    }
}

/// A single mutation inside a `WriteBatch`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put {
        column: Column,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        column: Column,
        key: Vec<u8>,
    },
}

/// Mutations applied atomically and in order
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Ordered key-value store with atomic batches
pub trait KvStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Apply every operation of the batch or none of them
    fn write(&self, batch: WriteBatch) -> Result<()>;

    /// Up to `limit` entries with key >= `start`, in key order
    fn scan(&self, column: Column, start: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Greatest key in the column
    fn last_key(&self, column: Column) -> Result<Option<Vec<u8>>>;

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(column, key, value);
        self.write(batch)
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryKv {
    columns: RwLock<HashMap<Column, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let columns = self.columns.read();
        Ok(columns.get(&column).and_then(|c| c.get(key)).cloned())
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut columns = self.columns.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { column, key, value } => {
                    columns.entry(column).or_default().insert(key, value);
                }
                BatchOp::Delete { column, key } => {
                    if let Some(c) = columns.get_mut(&column) {
                        c.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn scan(&self, column: Column, start: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let columns = self.columns.read();
        let Some(c) = columns.get(&column) else {
            return Ok(Vec::new());
        };
        Ok(c.range(start.to_vec()..)
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn last_key(&self, column: Column) -> Result<Option<Vec<u8>>> {
        let columns = self.columns.read();
        Ok(columns
            .get(&column)
            .and_then(|c| c.keys().next_back().cloned()))
    }
}
