//! Replidoc Core Library
//!
//! A multi-master document store: every node accepts writes, replicates them
//! asynchronously to its configured destinations, and detects when two nodes
//! have produced divergent histories for the same document. Divergent writes
//! are kept side by side as a conflict until they are explicitly resolved.

pub mod config;
pub mod history;
pub mod network;
pub mod node;
pub mod replication;
pub mod storage;
pub mod testkit;
pub mod types;
pub mod version;

pub use config::{NodeConfig, ReplicationConfig, TombstoneConfig};
pub use history::{classify, Classification, History, HistoryEntry};
pub use node::Node;
pub use storage::{Conflict, ConflictSet, Lookup, Storage, Tombstone};
pub use types::*;

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Conflict detected on {identity}, conflict must be resolved before the document will be accessible")]
    Conflict {
        identity: DocumentId,
        candidates: Vec<CandidateId>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid document identity: {0}")]
    InvalidIdentity(String),

    #[error("Replication unavailable: {0}")]
    ReplicationUnavailable(String),

    #[error("Malformed replication batch: {0}")]
    MalformedBatch(String),

    #[error("Storage operation failed: {0}")]
    Storage(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<minicbor::decode::Error> for Error {
    fn from(e: minicbor::decode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for Error {
    fn from(e: minicbor::encode::Error<E>) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
