//! Storage module
//!
//! Persists the replicated state of a node on top of a `KvStore`:
//! - Live documents, tombstones and conflict sets (one column each)
//! - The change log that replication senders scan
//! - Replication cursors, configured destinations and node identity
//!
//! Every identity lives in exactly one of the document, tombstone or conflict
//! columns. A state transition rewrites that record, moves its change-log entry
//! to a freshly allocated sequence, and commits both in a single write batch.

pub mod changes;
pub mod conflicts;
pub mod cursors;
pub mod documents;
pub mod kv;
pub mod locks;
pub mod rocks;
pub mod tombstones;

use crate::history::{History, SeqGuard, VersionTracker};
use crate::types::{DocumentId, NodeId, Version};
use crate::{Error, Result};
use parking_lot::MutexGuard;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;

pub use changes::ChangeEntry;
pub use conflicts::{Conflict, ConflictSet};
pub use documents::Lookup;
pub use kv::{Column, KvStore, MemoryKv, WriteBatch};
pub use locks::IdentityLocks;
pub use rocks::RocksKv;
pub use tombstones::Tombstone;

const META_NODE_ID: &[u8] = b"node_id";
const META_SEQUENCE: &[u8] = b"sequence";

/// Current state of one identity
#[derive(Debug, Clone, PartialEq)]
pub enum DocState {
    Missing,
    Live(crate::types::Document),
    Deleted(Tombstone),
    Conflicted(ConflictSet),
}

impl DocState {
    /// Local sequence at which this state was committed
    pub fn etag(&self) -> Option<u64> {
        match self {
            DocState::Missing => None,
            DocState::Live(doc) => Some(doc.etag),
            DocState::Deleted(tombstone) => Some(tombstone.etag),
            DocState::Conflicted(set) => Some(set.etag),
        }
    }

    /// History incoming writes are compared against; merged over candidates
    pub fn history(&self) -> History {
        match self {
            DocState::Missing => History::new(),
            DocState::Live(doc) => doc.history.clone(),
            DocState::Deleted(tombstone) => tombstone.history.clone(),
            DocState::Conflicted(set) => set.merged_history(),
        }
    }

    /// Versions a replication sender ships for this state
    pub fn versions(&self) -> Vec<Version> {
        match self {
            DocState::Missing => Vec::new(),
            DocState::Live(doc) => vec![doc.to_version()],
            DocState::Deleted(tombstone) => vec![tombstone.to_version()],
            DocState::Conflicted(set) => set.candidates.clone(),
        }
    }

    fn column(&self) -> Option<Column> {
        match self {
            DocState::Missing => None,
            DocState::Live(_) => Some(Column::Documents),
            DocState::Deleted(_) => Some(Column::Tombstones),
            DocState::Conflicted(_) => Some(Column::Conflicts),
        }
    }

    fn encode(&self) -> Result<Option<Vec<u8>>> {
        Ok(match self {
            DocState::Missing => None,
            DocState::Live(doc) => Some(encode(doc)?),
            DocState::Deleted(tombstone) => Some(encode(tombstone)?),
            DocState::Conflicted(set) => Some(encode(set)?),
        })
    }
}

/// Replicated document storage for one node
pub struct Storage {
    kv: Arc<dyn KvStore>,
    tracker: VersionTracker,
    locks: IdentityLocks,
    changed: Notify,
}

impl Storage {
    /// Open storage on an existing keyed store
    ///
    /// Loads (or creates and persists) the node identity and resumes the local
    /// sequence after the highest one ever committed.
    pub fn open(kv: Arc<dyn KvStore>) -> Result<Self> {
        let node_id = match kv.get(Column::Meta, META_NODE_ID)? {
            Some(bytes) => {
                let raw: [u8; 16] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Storage(format!("Corrupt node id ({} bytes)", bytes.len())))?;
                NodeId(raw)
            }
            None => {
                let id = NodeId::new();
                kv.put(Column::Meta, META_NODE_ID, id.as_bytes())?;
                tracing::info!(node = %id, "Generated new node identity");
                id
            }
        };

        let last_change = match kv.last_key(Column::Changes)? {
            Some(key) => decode_seq(&key)?,
            None => 0,
        };
        let purged_high = match kv.get(Column::Meta, META_SEQUENCE)? {
            Some(bytes) => decode_seq(&bytes)?,
            None => 0,
        };
        let last_committed = last_change.max(purged_high);

        tracing::debug!(node = %node_id, sequence = last_committed, "Storage opened");

        Ok(Self {
            kv,
            tracker: VersionTracker::new(node_id, last_committed),
            locks: IdentityLocks::new(),
            changed: Notify::new(),
        })
    }

    /// Volatile storage for tests and embedded use
    pub fn in_memory() -> Result<Self> {
        Self::open(Arc::new(MemoryKv::new()))
    }

    /// Persistent storage backed by RocksDB
    pub fn open_rocks(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(Arc::new(RocksKv::open(path)?))
    }

    pub fn node_id(&self) -> NodeId {
        self.tracker.node_id()
    }

    /// Last local sequence handed out
    pub fn last_sequence(&self) -> u64 {
        self.tracker.sequence().last()
    }

    /// Highest sequence below which every change has committed
    pub fn watermark(&self) -> u64 {
        self.tracker.sequence().watermark()
    }

    /// Notified after every committed state change
    pub fn changed(&self) -> &Notify {
        &self.changed
    }

    pub(crate) fn kv(&self) -> &dyn KvStore {
        self.kv.as_ref()
    }

    pub(crate) fn tracker(&self) -> &VersionTracker {
        &self.tracker
    }

    pub(crate) fn lock(&self, identity: &DocumentId) -> MutexGuard<'_, ()> {
        self.locks.lock(identity)
    }

    /// Read an identity's state; callers hold its lock when they act on it
    pub(crate) fn load_state(&self, identity: &DocumentId) -> Result<DocState> {
        let key = identity.as_bytes();
        if let Some(bytes) = self.kv.get(Column::Conflicts, key)? {
            return Ok(DocState::Conflicted(decode(&bytes)?));
        }
        if let Some(bytes) = self.kv.get(Column::Documents, key)? {
            return Ok(DocState::Live(decode(&bytes)?));
        }
        if let Some(bytes) = self.kv.get(Column::Tombstones, key)? {
            return Ok(DocState::Deleted(decode(&bytes)?));
        }
        Ok(DocState::Missing)
    }

    /// Atomically replace `prior` with `next` at the guard's sequence
    pub(crate) fn commit(
        &self,
        identity: &DocumentId,
        prior: &DocState,
        next: &DocState,
        seq: SeqGuard<'_>,
    ) -> Result<()> {
        debug_assert_eq!(next.etag(), Some(seq.value()));

        let key = identity.as_bytes().to_vec();
        let mut batch = WriteBatch::new();

        if let Some(column) = prior.column() {
            if prior.column() != next.column() {
                batch.delete(column, key.clone());
            }
        }
        if let Some(etag) = prior.etag() {
            batch.delete(Column::Changes, encode_seq(etag));
        }

        if let (Some(column), Some(value)) = (next.column(), next.encode()?) {
            batch.put(column, key.clone(), value);
            batch.put(Column::Changes, encode_seq(seq.value()), key);
        }

        self.kv.write(batch)?;
        drop(seq);
        self.changed.notify_waiters();
        Ok(())
    }
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>> {
    Ok(minicbor::to_vec(value)?)
}

pub(crate) fn decode<T>(bytes: &[u8]) -> Result<T>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}

pub(crate) fn encode_seq(seq: u64) -> Vec<u8> {
    seq.to_be_bytes().to_vec()
}

pub(crate) fn decode_seq(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Storage(format!("Corrupt sequence key ({} bytes)", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}
