//! Core types and identifiers used throughout the system

use minicbor::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::history::History;

/// Node identity (random UUID, persisted in the node's store)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Serialize, Deserialize)]
#[cbor(transparent)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(#[n(0)] pub [u8; 16]);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// First 8 hex chars, for logs and prompts
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?.into_bytes()))
    }
}

impl TryFrom<String> for NodeId {
    type Error = uuid::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}

/// Document identity, unique within a node
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Serialize, Deserialize)]
#[cbor(transparent)]
#[serde(transparent)]
pub struct DocumentId(#[n(0)] pub String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Synthetic key addressing one candidate of an active conflict
///
/// Format: `<identity>/conflicts/<16 hex chars>`. The suffix is derived from the
/// candidate's history only, so every node names the same candidate identically.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(pub String);

impl CandidateId {
    const SEPARATOR: &'static str = "/conflicts/";
    const SUFFIX_LEN: usize = 16;

    pub fn new(identity: &DocumentId, history: &History) -> Self {
        let digest = blake3::hash(&history.canonical_bytes());
        let suffix = hex::encode(&digest.as_bytes()[..8]);
        Self(format!("{}{}{}", identity, Self::SEPARATOR, suffix))
    }

    /// Split into the conflicted identity and the candidate suffix
    pub fn parse(raw: &str) -> Option<(DocumentId, &str)> {
        let (identity, suffix) = raw.rsplit_once(Self::SEPARATOR)?;
        let is_digest = suffix.len() == Self::SUFFIX_LEN
            && suffix.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if identity.is_empty() || !is_digest {
            return None;
        }
        Some((DocumentId::new(identity), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CandidateId({})", self.0)
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque document payload plus metadata
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct Content {
    #[cbor(n(0), with = "minicbor::bytes")]
    pub data: Vec<u8>,

    #[n(1)]
    pub metadata: BTreeMap<String, String>,
}

impl Content {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A live document as seen by local readers
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Document {
    #[n(0)]
    pub identity: DocumentId,

    #[n(1)]
    pub content: Content,

    /// Local sequence at which this state was committed
    #[n(2)]
    pub etag: u64,

    /// Node that authored this write
    #[n(3)]
    pub origin: NodeId,

    #[n(4)]
    pub history: History,

    /// Unix milliseconds at the origin
    #[n(5)]
    pub last_modified: u64,
}

/// What a version carries: either content or a deletion marker
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum Body {
    #[n(0)]
    Document(#[n(0)] Content),

    #[n(1)]
    Tombstone,
}

impl Body {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Body::Tombstone)
    }
}

/// A single version of a document as it travels between nodes
///
/// Replication items and conflict candidates both carry one of these.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Version {
    #[n(0)]
    pub origin: NodeId,

    #[n(1)]
    pub history: History,

    #[n(2)]
    pub body: Body,

    #[n(3)]
    pub last_modified: u64,
}

/// A configured replication target
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub node_id: NodeId,
    pub address: String,
}

impl Destination {
    pub fn new(node_id: NodeId, address: impl Into<String>) -> Self {
        Self {
            node_id,
            address: address.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.address)
    }
}

impl FromStr for Destination {
    type Err = String;

    /// Parse `<node-id>@<address>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (node, address) = s
            .split_once('@')
            .ok_or_else(|| format!("expected <node-id>@<address>, got '{}'", s))?;
        let node_id = node
            .parse()
            .map_err(|e| format!("invalid node id '{}': {}", node, e))?;
        if address.is_empty() {
            return Err("destination address is empty".to_string());
        }
        Ok(Self::new(node_id, address))
    }
}

/// Current wall-clock time in unix milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display_roundtrip() {
        let id = NodeId::new();
        let parsed: NodeId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_candidate_id_parse() {
        let (identity, suffix) = CandidateId::parse("companies/1/conflicts/00ff00ff00ff00ff").unwrap();
        assert_eq!(identity.as_str(), "companies/1");
        assert_eq!(suffix, "00ff00ff00ff00ff");

        assert!(CandidateId::parse("companies/1").is_none());
        assert!(CandidateId::parse("/conflicts/00ff00ff00ff00ff").is_none());
        assert!(CandidateId::parse("reports/conflicts/2024").is_none());
        assert!(CandidateId::parse("reports/conflicts/00FF00FF00FF00FF").is_none());
        assert!(CandidateId::parse("reports/conflicts/00ff00ff00ff00ffaa").is_none());
    }

    #[test]
    fn test_destination_parse() {
        let node = NodeId::new();
        let dest: Destination = format!("{}@127.0.0.1:7400", node).parse().unwrap();
        assert_eq!(dest.node_id, node);
        assert_eq!(dest.address, "127.0.0.1:7400");

        assert!("127.0.0.1:7400".parse::<Destination>().is_err());
        assert!(format!("{}@", node).parse::<Destination>().is_err());
    }

    #[test]
    fn test_destination_serde_uses_string_node_id() {
        let node = NodeId::new();
        let dest = Destination::new(node, "mem://b");
        let json = serde_json::to_string(&dest).unwrap();
        assert!(json.contains(&node.to_string()));
        let back: Destination = serde_json::from_str(&json).unwrap();
        assert_eq!(back, dest);
    }
}
