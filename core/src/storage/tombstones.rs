//! Tombstones and their garbage collection
//!
//! A tombstone keeps a deleted identity's history so that stale writes arriving
//! later are recognised as superseded. It may only be purged once every
//! configured destination has acknowledged it and the retention window passed.

use super::{decode, encode, encode_seq, DocState, Storage};
use crate::history::History;
use crate::storage::kv::{Column, WriteBatch};
use crate::types::{now_millis, Body, DocumentId, NodeId, Version};
use crate::Result;
use minicbor::{Decode, Encode};
use std::collections::BTreeSet;
use std::time::Duration;

const SCAN_PAGE: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Tombstone {
    #[n(0)]
    pub identity: DocumentId,

    /// Node that authored the delete
    #[n(1)]
    pub deleted_by: NodeId,

    /// Local sequence at which the tombstone was committed
    #[n(2)]
    pub etag: u64,

    #[n(3)]
    pub history: History,

    /// Unix milliseconds at the deleting node
    #[n(4)]
    pub deleted_at: u64,

    /// Unix milliseconds when this node recorded the tombstone
    #[n(5)]
    pub created_at: u64,

    /// Destinations that have acknowledged this tombstone
    #[n(6)]
    pub acked_by: BTreeSet<NodeId>,
}

impl Tombstone {
    pub fn to_version(&self) -> Version {
        Version {
            origin: self.deleted_by,
            history: self.history.clone(),
            body: Body::Tombstone,
            last_modified: self.deleted_at,
        }
    }

    pub fn is_acknowledged_by(&self, destinations: &[NodeId]) -> bool {
        destinations.iter().all(|d| self.acked_by.contains(d))
    }

    fn is_collectable(&self, destinations: &[NodeId], retention: Duration, now: u64) -> bool {
        let age = now.saturating_sub(self.created_at);
        self.is_acknowledged_by(destinations) && age >= retention.as_millis() as u64
    }
}

impl Storage {
    pub fn tombstone(&self, identity: &DocumentId) -> Result<Option<Tombstone>> {
        let _guard = self.lock(identity);
        match self.load_state(identity)? {
            DocState::Deleted(tombstone) => Ok(Some(tombstone)),
            _ => Ok(None),
        }
    }

    /// Record that `destination` accepted the tombstone committed at `etag`
    ///
    /// Returns false when the identity has moved on since.
    pub fn acknowledge_tombstone(
        &self,
        identity: &DocumentId,
        etag: u64,
        destination: NodeId,
    ) -> Result<bool> {
        let _guard = self.lock(identity);
        let DocState::Deleted(mut tombstone) = self.load_state(identity)? else {
            return Ok(false);
        };
        if tombstone.etag != etag {
            return Ok(false);
        }
        if tombstone.acked_by.insert(destination) {
            // Acknowledgments are bookkeeping; the change-log position stays.
            self.kv()
                .put(Column::Tombstones, identity.as_bytes(), &encode(&tombstone)?)?;
        }
        Ok(true)
    }

    /// Purge tombstones acknowledged by all `destinations` and older than `retention`
    pub fn collect_garbage(&self, destinations: &[NodeId], retention: Duration) -> Result<usize> {
        self.collect_garbage_at(destinations, retention, now_millis())
    }

    pub fn collect_garbage_at(
        &self,
        destinations: &[NodeId],
        retention: Duration,
        now: u64,
    ) -> Result<usize> {
        let mut purged = 0;
        let mut start = Vec::new();
        loop {
            let page = self.kv().scan(Column::Tombstones, &start, SCAN_PAGE)?;
            let done = page.len() < SCAN_PAGE;
            for (key, value) in page {
                let candidate: Tombstone = decode(&value)?;
                if candidate.is_collectable(destinations, retention, now)
                    && self.purge_tombstone(&candidate.identity, destinations, retention, now)?
                {
                    purged += 1;
                }
                start = key;
                start.push(0);
            }
            if done {
                break;
            }
        }

        if purged > 0 {
            tracing::info!(purged, "Collected tombstones");
        }
        Ok(purged)
    }

    /// Re-check under the identity lock and remove the tombstone
    fn purge_tombstone(
        &self,
        identity: &DocumentId,
        destinations: &[NodeId],
        retention: Duration,
        now: u64,
    ) -> Result<bool> {
        let _guard = self.lock(identity);
        let DocState::Deleted(tombstone) = self.load_state(identity)? else {
            return Ok(false);
        };
        if !tombstone.is_collectable(destinations, retention, now) {
            return Ok(false);
        }

        let mut batch = WriteBatch::new();
        batch.delete(Column::Tombstones, identity.as_bytes().to_vec());
        batch.delete(Column::Changes, encode_seq(tombstone.etag));
        // The purged entry may be the highest in the change log; keep the
        // sequence from going backwards on the next open.
        batch.put(Column::Meta, super::META_SEQUENCE.to_vec(), encode_seq(self.last_sequence()));
        self.kv().write(batch)?;

        tracing::debug!(identity = %identity, etag = tombstone.etag, "Tombstone purged");
        Ok(true)
    }
}
