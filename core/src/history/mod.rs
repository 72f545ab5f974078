//! Causal history tracking
//!
//! This module implements the per-document version vectors used to decide
//! what an incoming replicated write means locally:
//! - `History`: ordered (node, etag) entries, one per writing node
//! - `classify`: superseded / descendant / concurrent decision
//! - `VersionTracker`: allocates local etags and produces the next history

pub mod tracker;
pub mod vector;

#[cfg(test)]
mod convergence_tests;

pub use tracker::{SeqGuard, SequenceAllocator, VersionTracker};
pub use vector::{classify, Classification, History, HistoryEntry};
