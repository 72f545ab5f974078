//! Replication wire messages
//!
//! A sender pushes `Batch` messages (or a `Heartbeat` when idle) to a peer's
//! receiver and gets back an `Ack`, or a `Reject` when the batch was not admitted.

use crate::history::History;
use crate::storage::ChangeEntry;
use crate::types::{Body, DocumentId, NodeId, Version};
use crate::version::PROTOCOL_VERSION;
use minicbor::{Decode, Encode};

/// Request sent from a replication source to a destination
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum ReplicationMessage {
    #[n(0)]
    Batch(#[n(0)] ReplicationBatch),

    #[n(1)]
    Heartbeat(#[n(0)] Heartbeat),
}

impl ReplicationMessage {
    pub fn source(&self) -> NodeId {
        match self {
            ReplicationMessage::Batch(batch) => batch.source,
            ReplicationMessage::Heartbeat(heartbeat) => heartbeat.source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ReplicationBatch {
    #[n(0)]
    pub protocol: u32,

    #[n(1)]
    pub source: NodeId,

    /// Ordered by sequence; a conflicted identity ships one item per candidate
    #[n(2)]
    pub items: Vec<ReplicationItem>,
}

impl ReplicationBatch {
    pub fn new(source: NodeId, items: Vec<ReplicationItem>) -> Self {
        Self {
            protocol: PROTOCOL_VERSION,
            source,
            items,
        }
    }

    /// Flatten change-log entries into wire items
    pub fn from_changes(source: NodeId, changes: Vec<ChangeEntry>) -> Self {
        let items = changes
            .into_iter()
            .flat_map(|change| {
                let ChangeEntry {
                    seq,
                    identity,
                    versions,
                } = change;
                versions.into_iter().map(move |version| ReplicationItem {
                    seq,
                    identity: identity.clone(),
                    version,
                })
            })
            .collect();
        Self::new(source, items)
    }

    /// Highest sequence in the batch
    pub fn last_seq(&self) -> Option<u64> {
        self.items.last().map(|item| item.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ReplicationItem {
    /// Source-local sequence of the change
    #[n(0)]
    pub seq: u64,

    #[n(1)]
    pub identity: DocumentId,

    #[n(2)]
    pub version: Version,
}

impl ReplicationItem {
    pub fn history(&self) -> &History {
        &self.version.history
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.version.body, Body::Tombstone)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Heartbeat {
    #[n(0)]
    pub protocol: u32,

    #[n(1)]
    pub source: NodeId,
}

impl Heartbeat {
    pub fn new(source: NodeId) -> Self {
        Self {
            protocol: PROTOCOL_VERSION,
            source,
        }
    }
}

/// Response from a destination
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum ReplicationReply {
    #[n(0)]
    Ack(#[n(0)] ReplicationAck),

    /// The batch was not admitted; nothing was applied
    #[n(1)]
    Reject(#[n(0)] String),
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ReplicationAck {
    /// Node that processed the message
    #[n(0)]
    pub responder: NodeId,

    /// One status per batch item, in item order; empty for heartbeats
    #[n(1)]
    pub statuses: Vec<ItemStatus>,

    /// Highest source sequence accepted so far from this source
    #[n(2)]
    pub last_accepted_seq: u64,
}

/// Outcome of one replicated item at the receiver
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum ItemStatus {
    /// State changed to (or recreated from) the incoming version
    #[n(0)]
    Applied,

    /// Already known; nothing changed
    #[n(1)]
    Superseded,

    /// Kept as a conflict candidate
    #[n(2)]
    Conflicted,

    /// Could not be processed; the sender retries it
    #[n(3)]
    Rejected(#[n(0)] String),
}

impl ItemStatus {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, ItemStatus::Rejected(_))
    }
}

/// Highest sequence such that every item at or below it was accepted
///
/// Items sharing a sequence (candidates of one conflict) must all be accepted.
pub fn accepted_prefix(items: &[ReplicationItem], statuses: &[ItemStatus]) -> Option<u64> {
    let mut accepted = None;
    let mut idx = 0;
    while idx < items.len() {
        let seq = items[idx].seq;
        let mut end = idx;
        while end < items.len() && items[end].seq == seq {
            end += 1;
        }
        let all_accepted = (idx..end).all(|i| statuses.get(i).map_or(false, ItemStatus::is_accepted));
        if !all_accepted {
            break;
        }
        accepted = Some(seq);
        idx = end;
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryEntry;
    use crate::types::Content;

    fn item(seq: u64, id: &str) -> ReplicationItem {
        let node = NodeId([1; 16]);
        ReplicationItem {
            seq,
            identity: DocumentId::from(id),
            version: Version {
                origin: node,
                history: History::from_entries([HistoryEntry { node, etag: seq }]),
                body: Body::Document(Content::new(id)),
                last_modified: 0,
            },
        }
    }

    #[test]
    fn test_accepted_prefix_stops_at_first_rejection() {
        let items = vec![item(1, "a"), item(2, "b"), item(3, "c")];
        let statuses = vec![
            ItemStatus::Applied,
            ItemStatus::Rejected("disk full".into()),
            ItemStatus::Superseded,
        ];
        assert_eq!(accepted_prefix(&items, &statuses), Some(1));
    }

    #[test]
    fn test_accepted_prefix_groups_candidates() {
        let items = vec![item(4, "a"), item(4, "a"), item(7, "b")];
        let statuses = vec![
            ItemStatus::Conflicted,
            ItemStatus::Rejected("boom".into()),
            ItemStatus::Applied,
        ];
        assert_eq!(accepted_prefix(&items, &statuses), None);

        let statuses = vec![ItemStatus::Conflicted, ItemStatus::Superseded, ItemStatus::Applied];
        assert_eq!(accepted_prefix(&items, &statuses), Some(7));
    }

    #[test]
    fn test_message_cbor_roundtrip() {
        let batch = ReplicationBatch::new(NodeId([3; 16]), vec![item(1, "a")]);
        let message = ReplicationMessage::Batch(batch);

        let bytes = minicbor::to_vec(&message).unwrap();
        let decoded: ReplicationMessage = minicbor::decode(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.source(), NodeId([3; 16]));
    }
}
