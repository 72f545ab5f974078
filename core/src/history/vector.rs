//! Version vectors for document histories
//!
//! A `History` records, for every node that ever wrote a document, the latest
//! local etag that node assigned to it. Comparing two histories entry-wise tells
//! us whether one write causally follows the other or whether they raced.

use crate::types::NodeId;
use minicbor::{Decode, Encode};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// One (node, etag) pair of a history
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Debug)]
pub struct HistoryEntry {
    #[n(0)]
    pub node: NodeId,

    #[n(1)]
    pub etag: u64,
}

/// Causal history of one document identity
///
/// Entries are kept sorted by node id with at most one entry per node, so two
/// equal histories always have the same encoding.
#[derive(Clone, Default, PartialEq, Eq, Hash, Encode, Decode)]
#[cbor(transparent)]
pub struct History(#[n(0)] Vec<HistoryEntry>);

/// How an incoming history relates to the local one
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    /// Incoming carries nothing new (dominated by or equal to local)
    Superseded,
    /// Incoming dominates local and replaces it
    Descendant,
    /// Neither dominates: the writes raced
    Concurrent,
}

impl History {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build from arbitrary entries, collapsing duplicates to the highest etag
    pub fn from_entries(entries: impl IntoIterator<Item = HistoryEntry>) -> Self {
        let mut history = Self::new();
        for entry in entries {
            history.observe(entry.node, entry.etag);
        }
        history
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Etag recorded for a node, zero when absent
    pub fn get(&self, node: &NodeId) -> u64 {
        match self.0.binary_search_by(|e| e.node.cmp(node)) {
            Ok(idx) => self.0[idx].etag,
            Err(_) => 0,
        }
    }

    /// Set a node's entry to `etag` if that is newer than what we have
    pub fn observe(&mut self, node: NodeId, etag: u64) {
        match self.0.binary_search_by(|e| e.node.cmp(&node)) {
            Ok(idx) => {
                let entry = &mut self.0[idx];
                entry.etag = entry.etag.max(etag);
            }
            Err(idx) => self.0.insert(idx, HistoryEntry { node, etag }),
        }
    }

    /// Record a local write by `node`; the etag must be strictly newer
    pub fn record(&mut self, node: NodeId, etag: u64) -> bool {
        if etag <= self.get(&node) {
            return false;
        }
        self.observe(node, etag);
        true
    }

    /// Merge another history into this one (entry-wise maximum)
    pub fn merge(&mut self, other: &History) {
        for entry in &other.0 {
            self.observe(entry.node, entry.etag);
        }
    }

    /// Entry-wise comparison over the union of node ids
    ///
    /// Returns `None` when the histories are concurrent.
    pub fn partial_cmp_causal(&self, other: &History) -> Option<Ordering> {
        let nodes: BTreeSet<NodeId> = self
            .0
            .iter()
            .chain(other.0.iter())
            .map(|e| e.node)
            .collect();

        let mut less = false;
        let mut greater = false;
        for node in &nodes {
            match self.get(node).cmp(&other.get(node)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return None;
            }
        }

        Some(match (less, greater) {
            (false, false) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (true, true) => unreachable!("concurrent histories return early"),
        })
    }

    /// True if `self` is >= `other` everywhere and strictly greater somewhere
    pub fn dominates(&self, other: &History) -> bool {
        self.partial_cmp_causal(other) == Some(Ordering::Greater)
    }

    /// Neither history dominates the other
    pub fn is_concurrent(&self, other: &History) -> bool {
        self.partial_cmp_causal(other).is_none()
    }

    /// Well-formed: sorted, one entry per node, no zero etags
    pub fn is_well_formed(&self) -> bool {
        self.0.iter().all(|e| e.etag > 0) && self.0.windows(2).all(|w| w[0].node < w[1].node)
    }

    /// Stable byte encoding used for candidate identifiers
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.0.len() * 24);
        for entry in &self.0 {
            bytes.extend_from_slice(entry.node.as_bytes());
            bytes.extend_from_slice(&entry.etag.to_be_bytes());
        }
        bytes
    }
}

impl fmt::Debug for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.iter().map(|e| (e.node.short(), e.etag)))
            .finish()
    }
}

impl fmt::Display for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|e| format!("{}:{}", e.node.short(), e.etag))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

/// Classify an incoming history against the local one
pub fn classify(local: &History, incoming: &History) -> Classification {
    match incoming.partial_cmp_causal(local) {
        Some(Ordering::Greater) => Classification::Descendant,
        Some(Ordering::Less) | Some(Ordering::Equal) => Classification::Superseded,
        None => Classification::Concurrent,
    }
}
