//! Replication counters
//!
//! Snapshots are cheap clones handed to the CLI and tests.

use crate::types::NodeId;
use serde::Serialize;

/// Outbound counters for one destination
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SenderStats {
    pub batches_sent: u64,
    pub items_sent: u64,
    pub heartbeats_sent: u64,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    /// Unix milliseconds of the last acknowledged exchange
    pub last_success: Option<u64>,
    pub last_error: Option<String>,
    /// Last local sequence the destination acknowledged
    pub cursor: u64,
}

impl SenderStats {
    pub(crate) fn record_success(&mut self, now: u64) {
        self.consecutive_failures = 0;
        self.last_success = Some(now);
        self.last_error = None;
    }

    pub(crate) fn record_failure(&mut self, error: String) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_failures += 1;
        self.last_error = Some(error);
    }
}

/// Inbound counters for one source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReceiverStats {
    pub batches: u64,
    pub heartbeats: u64,
    pub malformed: u64,
    pub applied: u64,
    pub superseded: u64,
    pub conflicted: u64,
    pub rejected: u64,
    pub last_accepted_seq: u64,
    /// Unix milliseconds of the last admitted message
    pub last_seen: Option<u64>,
}

/// Stats of one destination as reported by the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationStats {
    pub node_id: NodeId,
    pub address: String,
    pub stats: SenderStats,
}
