//! Testkit - multi-node harness for replication tests
//!
//! Runs several nodes in one process over a `MemoryNetwork`, so replication
//! topologies, partitions and restarts can be scripted deterministically.
//!
//! # Architecture
//!
//! - `TestCluster`: N nodes at `mem://node-<i>` with fast replication timings
//! - `consistency`: helpers that poll until a document state is observed
//!
//! # Example
//!
//! ```no_run
//! use replidoc_core::testkit::*;
//! use replidoc_core::{Content, DocumentId};
//!
//! #[tokio::test]
//! async fn test_two_nodes() {
//!     let cluster = TestCluster::new(2).unwrap();
//!     cluster.replicate(0, 1).await.unwrap();
//!
//!     let id = DocumentId::from("users/1");
//!     cluster[0].put(&id, Content::new("hello")).unwrap();
//!     await_document(5, &cluster[1], &id, b"hello").await.unwrap();
//! }
//! ```

mod cluster;
mod consistency;

pub use cluster::{fast_config, TestCluster};
pub use consistency::{
    await_candidates, await_conflict, await_converged, await_cursor, await_document,
    await_not_found,
};
