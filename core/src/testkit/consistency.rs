//! Utilities for waiting until replication has delivered a state
//!
//! Each helper polls until the condition holds or the timeout elapses.

use crate::history::History;
use crate::node::Node;
use crate::storage::{Conflict, Lookup};
use crate::types::{CandidateId, Document, DocumentId, NodeId};
use anyhow::{bail, Result};
use std::time::Duration;

const POLL: Duration = Duration::from_millis(20);

/// Wait until `identity` reads as a live document with `expected` content
pub async fn await_document(
    timeout_secs: u64,
    node: &Node,
    identity: &DocumentId,
    expected: &[u8],
) -> Result<Document> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

    loop {
        let last = node.get(identity)?;
        if let Lookup::Found(doc) = &last {
            if doc.content.data == expected {
                return Ok(doc.clone());
            }
        }
        if tokio::time::Instant::now() > deadline {
            bail!("{} did not reach expected content after {}s: {:?}", identity, timeout_secs, last);
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Wait until `identity` is deleted or absent
pub async fn await_not_found(timeout_secs: u64, node: &Node, identity: &DocumentId) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

    loop {
        let last = node.get(identity)?;
        if last == Lookup::NotFound {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            bail!("{} still present after {}s: {:?}", identity, timeout_secs, last);
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Wait until `identity` is in conflict
pub async fn await_conflict(timeout_secs: u64, node: &Node, identity: &DocumentId) -> Result<Conflict> {
    await_candidates(timeout_secs, node, identity, 2).await
}

/// Wait until `identity` is in conflict with at least `count` candidates
pub async fn await_candidates(
    timeout_secs: u64,
    node: &Node,
    identity: &DocumentId,
    count: usize,
) -> Result<Conflict> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

    loop {
        let last = node.get(identity)?;
        if let Lookup::Conflict(conflict) = &last {
            if conflict.candidates.len() >= count {
                return Ok(conflict.clone());
            }
        }
        if tokio::time::Instant::now() > deadline {
            bail!(
                "{} did not reach {} conflict candidates after {}s: {:?}",
                identity,
                count,
                timeout_secs,
                last
            );
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Wait until every node holds the same state for `identity`
///
/// Nodes agree when they hold the same history and, for conflicts, the same
/// candidate set. Content is covered by the history since equal histories name
/// the same write.
pub async fn await_converged(timeout_secs: u64, nodes: &[&Node], identity: &DocumentId) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

    loop {
        let mut states = Vec::with_capacity(nodes.len());
        for node in nodes {
            states.push(fingerprint(node, identity)?);
        }
        if states.windows(2).all(|w| w[0] == w[1]) {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            bail!("{} did not converge after {}s: {:?}", identity, timeout_secs, states);
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Wait until `node`'s cursor for `destination` reaches `seq`
pub async fn await_cursor(timeout_secs: u64, node: &Node, destination: &NodeId, seq: u64) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

    loop {
        let cursor = node.storage().cursor(destination)?;
        if cursor >= seq {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            bail!("cursor for {} stuck at {} (wanted {}) after {}s", destination, cursor, seq, timeout_secs);
        }
        tokio::time::sleep(POLL).await;
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Fingerprint {
    history: Option<History>,
    candidates: Vec<CandidateId>,
}

fn fingerprint(node: &Node, identity: &DocumentId) -> Result<Fingerprint> {
    let mut candidates = match node.get(identity)? {
        Lookup::Conflict(conflict) => conflict.candidates,
        _ => Vec::new(),
    };
    candidates.sort();
    Ok(Fingerprint {
        history: node.history(identity)?,
        candidates,
    })
}
