//! Replication receiver
//!
//! Admits batches from peers and applies every item under its identity lock:
//! the incoming history is classified against the local one and the item is
//! dropped, applied, or kept next to the local version as a conflict.

use super::protocol::{
    accepted_prefix, Heartbeat, ItemStatus, ReplicationAck, ReplicationBatch, ReplicationItem,
    ReplicationMessage, ReplicationReply,
};
use super::stats::ReceiverStats;
use crate::history::{classify, Classification};
use crate::storage::documents::validate_identity;
use crate::storage::{ConflictSet, DocState, Storage, Tombstone};
use crate::types::{now_millis, Body, Document, DocumentId, NodeId, Version};
use crate::version::is_protocol_compatible;
use crate::{Error, Result};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct Receiver {
    storage: Arc<Storage>,
    stats: DashMap<NodeId, ReceiverStats>,
    /// Frames that never decoded, so their source is unknown
    undecodable: AtomicU64,
}

impl Receiver {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            stats: DashMap::new(),
            undecodable: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.storage.node_id()
    }

    /// Handle one message from a peer
    ///
    /// Admitted batches are applied on a blocking worker, which finishes even if
    /// the caller stops waiting for the reply.
    pub async fn handle(self: &Arc<Self>, message: ReplicationMessage) -> ReplicationReply {
        match message {
            ReplicationMessage::Heartbeat(heartbeat) => self.handle_heartbeat(&heartbeat),
            ReplicationMessage::Batch(batch) => {
                if let Err(e) = self.validate(&batch) {
                    tracing::warn!(source = %batch.source, error = %e, "Rejected replication batch");
                    self.update_stats(batch.source, |s| s.malformed += 1);
                    return ReplicationReply::Reject(e.to_string());
                }

                let receiver = Arc::clone(self);
                let task = tokio::task::spawn_blocking(move || receiver.process_batch(&batch));
                match task.await {
                    Ok(Ok(ack)) => ReplicationReply::Ack(ack),
                    Ok(Err(e)) => ReplicationReply::Reject(e.to_string()),
                    Err(e) => ReplicationReply::Reject(format!("batch worker failed: {}", e)),
                }
            }
        }
    }

    fn handle_heartbeat(&self, heartbeat: &Heartbeat) -> ReplicationReply {
        if let Err(e) = self.check_peer(heartbeat.source, heartbeat.protocol) {
            return ReplicationReply::Reject(e.to_string());
        }
        let last_accepted_seq = match self.storage.inbound_position(&heartbeat.source) {
            Ok(seq) => seq,
            Err(e) => return ReplicationReply::Reject(e.to_string()),
        };

        self.update_stats(heartbeat.source, |s| {
            s.heartbeats += 1;
            s.last_seen = Some(now_millis());
        });
        tracing::trace!(source = %heartbeat.source, last_accepted_seq, "Heartbeat");

        ReplicationReply::Ack(ReplicationAck {
            responder: self.node_id(),
            statuses: Vec::new(),
            last_accepted_seq,
        })
    }

    fn check_peer(&self, source: NodeId, protocol: u32) -> Result<()> {
        if source == self.node_id() {
            return Err(Error::MalformedBatch("message originates from this node".into()));
        }
        if !is_protocol_compatible(protocol) {
            return Err(Error::MalformedBatch(format!(
                "incompatible protocol version {}",
                protocol
            )));
        }
        Ok(())
    }

    /// Check a whole batch before anything is applied
    pub fn validate(&self, batch: &ReplicationBatch) -> Result<()> {
        self.check_peer(batch.source, batch.protocol)?;

        let mut previous: Option<(u64, &DocumentId)> = None;
        for item in &batch.items {
            let last = previous.map_or(0, |(seq, _)| seq);
            if item.seq == 0 || item.seq < last {
                return Err(Error::MalformedBatch(format!(
                    "sequence {} out of order (previous {})",
                    item.seq, last
                )));
            }
            // Only the candidates of one conflicted identity share a sequence
            if let Some((seq, identity)) = previous {
                if item.seq == seq && &item.identity != identity {
                    return Err(Error::MalformedBatch(format!(
                        "sequence {} used for both {} and {}",
                        seq, identity, item.identity
                    )));
                }
            }
            previous = Some((item.seq, &item.identity));

            validate_identity(&item.identity)
                .map_err(|e| Error::MalformedBatch(e.to_string()))?;

            let history = item.history();
            if history.is_empty() || !history.is_well_formed() {
                return Err(Error::MalformedBatch(format!(
                    "malformed history {} for {}",
                    history, item.identity
                )));
            }
        }
        Ok(())
    }

    /// Apply an admitted batch item by item
    pub fn process_batch(&self, batch: &ReplicationBatch) -> Result<ReplicationAck> {
        let mut statuses = Vec::with_capacity(batch.items.len());
        for item in &batch.items {
            let status = match self.apply_item(batch.source, item) {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(
                        source = %batch.source,
                        identity = %item.identity,
                        error = %e,
                        "Failed to apply replicated item"
                    );
                    ItemStatus::Rejected(e.to_string())
                }
            };
            statuses.push(status);
        }

        let mut last_accepted_seq = self.storage.inbound_position(&batch.source)?;
        if let Some(seq) = accepted_prefix(&batch.items, &statuses) {
            if seq > last_accepted_seq {
                self.storage.save_inbound_position(&batch.source, seq)?;
                last_accepted_seq = seq;
            }
        }

        self.update_stats(batch.source, |s| {
            s.batches += 1;
            s.last_seen = Some(now_millis());
            s.last_accepted_seq = last_accepted_seq;
            for status in &statuses {
                match status {
                    ItemStatus::Applied => s.applied += 1,
                    ItemStatus::Superseded => s.superseded += 1,
                    ItemStatus::Conflicted => s.conflicted += 1,
                    ItemStatus::Rejected(_) => s.rejected += 1,
                }
            }
        });

        tracing::debug!(
            source = %batch.source,
            items = batch.items.len(),
            last_accepted_seq,
            "Processed replication batch"
        );

        Ok(ReplicationAck {
            responder: self.node_id(),
            statuses,
            last_accepted_seq,
        })
    }

    /// Classify one incoming version and transition the identity
    pub fn apply_item(&self, source: NodeId, item: &ReplicationItem) -> Result<ItemStatus> {
        let identity = &item.identity;
        let incoming = &item.version;

        let _guard = self.storage.lock(identity);
        let prior = self.storage.load_state(identity)?;

        if let DocState::Conflicted(set) = &prior {
            return self.merge_into_conflict(source, identity, &prior, set, incoming);
        }

        match classify(&prior.history(), &incoming.history) {
            Classification::Superseded => Ok(ItemStatus::Superseded),
            Classification::Descendant => {
                self.apply_version(identity, &prior, incoming)?;
                Ok(ItemStatus::Applied)
            }
            Classification::Concurrent => {
                let mut candidates = prior.versions();
                candidates.push(incoming.clone());
                self.write_conflict(identity, &prior, candidates)?;
                tracing::info!(
                    identity = %identity,
                    source = %source,
                    local = %prior.history(),
                    incoming = %incoming.history,
                    "Conflict detected"
                );
                Ok(ItemStatus::Conflicted)
            }
        }
    }

    fn merge_into_conflict(
        &self,
        source: NodeId,
        identity: &DocumentId,
        prior: &DocState,
        set: &ConflictSet,
        incoming: &Version,
    ) -> Result<ItemStatus> {
        let known = set
            .candidates
            .iter()
            .any(|c| classify(&c.history, &incoming.history) == Classification::Superseded);
        if known {
            return Ok(ItemStatus::Superseded);
        }

        let remaining: Vec<Version> = set
            .candidates
            .iter()
            .filter(|c| !incoming.history.dominates(&c.history))
            .cloned()
            .collect();

        if remaining.is_empty() {
            self.apply_version(identity, prior, incoming)?;
            tracing::info!(identity = %identity, source = %source, "Conflict resolved by replicated write");
            return Ok(ItemStatus::Applied);
        }

        let mut candidates = remaining;
        candidates.push(incoming.clone());
        tracing::info!(
            identity = %identity,
            source = %source,
            candidates = candidates.len(),
            "Conflict extended"
        );
        self.write_conflict(identity, prior, candidates)?;
        Ok(ItemStatus::Conflicted)
    }

    /// Replace local state with the incoming version at a fresh local sequence
    fn apply_version(&self, identity: &DocumentId, prior: &DocState, incoming: &Version) -> Result<()> {
        let seq = self.storage.tracker().allocate();
        let next = match &incoming.body {
            Body::Document(content) => DocState::Live(Document {
                identity: identity.clone(),
                content: content.clone(),
                etag: seq.value(),
                origin: incoming.origin,
                history: incoming.history.clone(),
                last_modified: incoming.last_modified,
            }),
            Body::Tombstone => DocState::Deleted(Tombstone {
                identity: identity.clone(),
                deleted_by: incoming.origin,
                etag: seq.value(),
                history: incoming.history.clone(),
                deleted_at: incoming.last_modified,
                created_at: now_millis(),
                acked_by: BTreeSet::new(),
            }),
        };
        self.storage.commit(identity, prior, &next, seq)
    }

    fn write_conflict(
        &self,
        identity: &DocumentId,
        prior: &DocState,
        candidates: Vec<Version>,
    ) -> Result<()> {
        let created_at = match prior {
            DocState::Conflicted(set) => set.created_at,
            _ => now_millis(),
        };
        let seq = self.storage.tracker().allocate();
        let next = DocState::Conflicted(ConflictSet {
            identity: identity.clone(),
            etag: seq.value(),
            candidates,
            created_at,
        });
        self.storage.commit(identity, prior, &next, seq)
    }

    /// Snapshot of per-source counters
    pub fn stats(&self) -> Vec<(NodeId, ReceiverStats)> {
        let mut snapshot: Vec<_> = self
            .stats
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        snapshot.sort_by_key(|(k, _)| *k);
        snapshot
    }

    /// Reply to a frame that could not be decoded into a message
    pub fn reject_undecodable(&self, error: &Error) -> ReplicationReply {
        tracing::warn!(error = %error, "Rejected undecodable replication frame");
        self.undecodable.fetch_add(1, Ordering::Relaxed);
        ReplicationReply::Reject(error.to_string())
    }

    pub fn undecodable_frames(&self) -> u64 {
        self.undecodable.load(Ordering::Relaxed)
    }

    fn update_stats(&self, source: NodeId, f: impl FnOnce(&mut ReceiverStats)) {
        let mut entry = self.stats.entry(source).or_default();
        f(entry.value_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{History, HistoryEntry};
    use crate::storage::Lookup;
    use crate::types::Content;

    fn receiver() -> Arc<Receiver> {
        Arc::new(Receiver::new(Arc::new(Storage::in_memory().unwrap())))
    }

    fn history(entries: &[(NodeId, u64)]) -> History {
        History::from_entries(entries.iter().map(|&(node, etag)| HistoryEntry { node, etag }))
    }

    fn doc_item(seq: u64, id: &str, origin: NodeId, history: History, data: &str) -> ReplicationItem {
        ReplicationItem {
            seq,
            identity: DocumentId::from(id),
            version: Version {
                origin,
                history,
                body: Body::Document(Content::new(data)),
                last_modified: now_millis(),
            },
        }
    }

    fn tombstone_item(seq: u64, id: &str, origin: NodeId, history: History) -> ReplicationItem {
        ReplicationItem {
            seq,
            identity: DocumentId::from(id),
            version: Version {
                origin,
                history,
                body: Body::Tombstone,
                last_modified: now_millis(),
            },
        }
    }

    #[test]
    fn test_new_identity_is_applied() {
        let receiver = receiver();
        let peer = NodeId([1; 16]);

        let status = receiver
            .apply_item(peer, &doc_item(1, "users/1", peer, history(&[(peer, 1)]), "a"))
            .unwrap();
        assert_eq!(status, ItemStatus::Applied);

        let doc = receiver.storage.get(&DocumentId::from("users/1")).unwrap();
        let doc = doc.document().unwrap();
        assert_eq!(doc.origin, peer);
        assert_eq!(doc.history, history(&[(peer, 1)]));
    }

    #[test]
    fn test_replay_is_superseded() {
        let receiver = receiver();
        let peer = NodeId([1; 16]);
        let item = doc_item(1, "users/1", peer, history(&[(peer, 1)]), "a");

        receiver.apply_item(peer, &item).unwrap();
        let seq = receiver.storage.last_sequence();
        assert_eq!(receiver.apply_item(peer, &item).unwrap(), ItemStatus::Superseded);
        assert_eq!(receiver.storage.last_sequence(), seq);
    }

    #[test]
    fn test_concurrent_write_creates_conflict() {
        let receiver = receiver();
        let peer = NodeId([1; 16]);
        let id = DocumentId::from("users/1");
        let local = receiver.storage.put(&id, Content::new("local")).unwrap();

        let status = receiver
            .apply_item(peer, &doc_item(1, "users/1", peer, history(&[(peer, 1)]), "remote"))
            .unwrap();
        assert_eq!(status, ItemStatus::Conflicted);

        let Lookup::Conflict(conflict) = receiver.storage.get(&id).unwrap() else {
            panic!("expected conflict");
        };
        assert_eq!(conflict.candidates.len(), 2);
        let first = receiver
            .storage
            .get_candidate(conflict.candidates[0].as_str())
            .unwrap()
            .unwrap();
        assert_eq!(first.history, local);
    }

    #[test]
    fn test_stale_write_against_tombstone_is_superseded() {
        let receiver = receiver();
        let peer = NodeId([1; 16]);

        receiver
            .apply_item(peer, &doc_item(1, "users/1", peer, history(&[(peer, 1)]), "a"))
            .unwrap();
        receiver
            .apply_item(peer, &tombstone_item(2, "users/1", peer, history(&[(peer, 2)])))
            .unwrap();

        let stale = doc_item(3, "users/1", peer, history(&[(peer, 1)]), "a");
        assert_eq!(receiver.apply_item(peer, &stale).unwrap(), ItemStatus::Superseded);

        let newer = doc_item(4, "users/1", peer, history(&[(peer, 3)]), "b");
        assert_eq!(receiver.apply_item(peer, &newer).unwrap(), ItemStatus::Applied);
        assert!(receiver.storage.tombstone(&DocumentId::from("users/1")).unwrap().is_none());
    }

    #[test]
    fn test_dominating_write_resolves_conflict() {
        let receiver = receiver();
        let (a, b) = (NodeId([1; 16]), NodeId([2; 16]));

        receiver
            .apply_item(a, &doc_item(1, "users/1", a, history(&[(a, 1)]), "a"))
            .unwrap();
        receiver
            .apply_item(b, &doc_item(1, "users/1", b, history(&[(b, 1)]), "b"))
            .unwrap();
        assert!(receiver.storage.get(&DocumentId::from("users/1")).unwrap().is_conflict());

        // Dominated by a candidate: dropped, conflict stays
        let old = doc_item(2, "users/1", a, history(&[(a, 1)]), "a");
        assert_eq!(receiver.apply_item(a, &old).unwrap(), ItemStatus::Superseded);

        // Dominates one candidate only: replaces it, conflict stays
        let partial = doc_item(3, "users/1", a, history(&[(a, 2)]), "a2");
        assert_eq!(receiver.apply_item(a, &partial).unwrap(), ItemStatus::Conflicted);
        let conflicts = receiver.storage.conflicts().unwrap();
        assert_eq!(conflicts[0].candidates.len(), 2);

        // Dominates everything: resolution
        let resolution = doc_item(4, "users/1", a, history(&[(a, 3), (b, 1)]), "merged");
        assert_eq!(receiver.apply_item(a, &resolution).unwrap(), ItemStatus::Applied);
        let lookup = receiver.storage.get(&DocumentId::from("users/1")).unwrap();
        assert_eq!(lookup.document().unwrap().content.data, b"merged");
    }

    #[test]
    fn test_third_concurrent_write_extends_conflict() {
        let receiver = receiver();
        let (a, b, c) = (NodeId([1; 16]), NodeId([2; 16]), NodeId([3; 16]));

        for (node, data) in [(a, "a"), (b, "b"), (c, "c")] {
            receiver
                .apply_item(node, &doc_item(1, "users/1", node, history(&[(node, 1)]), data))
                .unwrap();
        }
        let conflicts = receiver.storage.conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].candidates.len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_batch_applies_nothing() {
        let receiver = receiver();
        let peer = NodeId([1; 16]);
        let batch = ReplicationBatch::new(
            peer,
            vec![
                doc_item(2, "users/1", peer, history(&[(peer, 2)]), "a"),
                doc_item(1, "users/2", peer, history(&[(peer, 1)]), "b"),
            ],
        );

        let reply = receiver.handle(ReplicationMessage::Batch(batch)).await;
        assert!(matches!(reply, ReplicationReply::Reject(_)));
        assert_eq!(receiver.storage.last_sequence(), 0);
        assert_eq!(receiver.stats()[0].1.malformed, 1);
    }

    #[tokio::test]
    async fn test_rejects_own_and_incompatible_batches() {
        let receiver = receiver();
        let me = receiver.node_id();

        let own = ReplicationBatch::new(me, vec![doc_item(1, "x", me, history(&[(me, 1)]), "x")]);
        assert!(matches!(
            receiver.handle(ReplicationMessage::Batch(own)).await,
            ReplicationReply::Reject(_)
        ));

        let peer = NodeId([1; 16]);
        let mut future = ReplicationBatch::new(peer, Vec::new());
        future.protocol += 1;
        assert!(matches!(
            receiver.handle(ReplicationMessage::Batch(future)).await,
            ReplicationReply::Reject(_)
        ));

        let empty_history = ReplicationBatch::new(peer, vec![doc_item(1, "x", peer, History::new(), "x")]);
        assert!(receiver.validate(&empty_history).is_err());
    }

    #[test]
    fn test_distinct_identities_cannot_share_a_sequence() {
        let receiver = receiver();
        let peer = NodeId([1; 16]);
        let other = NodeId([2; 16]);

        let shared = ReplicationBatch::new(
            peer,
            vec![
                doc_item(4, "users/1", peer, history(&[(peer, 4)]), "a"),
                doc_item(4, "users/2", peer, history(&[(peer, 4)]), "b"),
            ],
        );
        assert!(matches!(receiver.validate(&shared), Err(Error::MalformedBatch(_))));

        // Candidates of one conflicted identity travel under one sequence
        let candidates = ReplicationBatch::new(
            peer,
            vec![
                doc_item(4, "users/1", peer, history(&[(peer, 4)]), "a"),
                doc_item(4, "users/1", other, history(&[(other, 2)]), "b"),
                doc_item(6, "users/2", peer, history(&[(peer, 6)]), "c"),
            ],
        );
        assert!(receiver.validate(&candidates).is_ok());
    }

    #[test]
    fn test_local_writes_and_replicated_items_interleave_safely() {
        use crate::storage::kv::Column;
        use std::thread;

        const ROUNDS: u64 = 50;
        let receiver = receiver();
        let storage = Arc::clone(&receiver.storage);
        let local = storage.node_id();
        let peer = NodeId([1; 16]);
        let id = DocumentId::from("orders/shared");

        let writer = {
            let storage = Arc::clone(&storage);
            let id = id.clone();
            thread::spawn(move || {
                (0..ROUNDS)
                    .map(|i| storage.put(&id, Content::new(format!("local-{}", i))).unwrap())
                    .collect::<Vec<_>>()
            })
        };
        let replicator = {
            let receiver = Arc::clone(&receiver);
            thread::spawn(move || {
                (1..=ROUNDS)
                    .map(|etag| {
                        let incoming = history(&[(peer, etag)]);
                        let item = doc_item(etag, "orders/shared", peer, incoming.clone(), "remote");
                        receiver.apply_item(peer, &item).unwrap();
                        incoming
                    })
                    .collect::<Vec<_>>()
            })
        };

        let mut inputs = writer.join().unwrap();
        inputs.extend(replicator.join().unwrap());

        let changes: Vec<_> = storage
            .changes_since(0, 1000)
            .unwrap()
            .into_iter()
            .filter(|c| c.identity == id)
            .collect();
        assert_eq!(changes.len(), 1);

        let key = id.as_bytes();
        let holders = [Column::Documents, Column::Tombstones, Column::Conflicts]
            .into_iter()
            .filter(|column| storage.kv().get(*column, key).unwrap().is_some())
            .count();
        assert_eq!(holders, 1);

        let last = storage.load_state(&id).unwrap().history();
        for input in &inputs {
            assert_ne!(classify(&last, input), Classification::Descendant, "{} lost {}", last, input);
        }
        assert_eq!(last.get(&peer), ROUNDS);
        assert_eq!(
            last.get(&local),
            inputs.iter().map(|h| h.get(&local)).max().unwrap()
        );
    }

    #[tokio::test]
    async fn test_heartbeat_reports_inbound_position() {
        let receiver = receiver();
        let peer = NodeId([1; 16]);
        let batch = ReplicationBatch::new(
            peer,
            vec![
                doc_item(3, "users/1", peer, history(&[(peer, 3)]), "a"),
                doc_item(5, "users/2", peer, history(&[(peer, 5)]), "b"),
            ],
        );

        let reply = receiver.handle(ReplicationMessage::Batch(batch)).await;
        let ReplicationReply::Ack(ack) = reply else {
            panic!("expected ack");
        };
        assert_eq!(ack.statuses, vec![ItemStatus::Applied, ItemStatus::Applied]);
        assert_eq!(ack.last_accepted_seq, 5);

        let reply = receiver
            .handle(ReplicationMessage::Heartbeat(Heartbeat::new(peer)))
            .await;
        let ReplicationReply::Ack(ack) = reply else {
            panic!("expected ack");
        };
        assert!(ack.statuses.is_empty());
        assert_eq!(ack.last_accepted_seq, 5);
        assert_eq!(ack.responder, receiver.node_id());
    }
}
