//! Local etag allocation
//!
//! Every committed state change on a node takes the next local sequence number.
//! The same number is used as the node's own history entry for local writes and
//! as the change-log position the replication senders scan.

use super::History;
use crate::types::NodeId;
use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Thread-safe sequence generator with an in-flight watermark
///
/// Writers to different identities commit concurrently, so sequence 7 can land
/// in the store before sequence 6. The watermark is the highest sequence below
/// which nothing is still in flight; senders never read past it.
pub struct SequenceAllocator {
    state: Mutex<SequenceState>,
}

struct SequenceState {
    last: u64,
    in_flight: BTreeSet<u64>,
}

/// An allocated sequence number; released from the in-flight set on drop
pub struct SeqGuard<'a> {
    allocator: &'a SequenceAllocator,
    seq: u64,
}

impl SequenceAllocator {
    /// Resume after `last_committed` (zero for an empty store)
    pub fn new(last_committed: u64) -> Self {
        Self {
            state: Mutex::new(SequenceState {
                last: last_committed,
                in_flight: BTreeSet::new(),
            }),
        }
    }

    pub fn allocate(&self) -> SeqGuard<'_> {
        let mut state = self.state.lock();
        state.last += 1;
        let seq = state.last;
        state.in_flight.insert(seq);
        SeqGuard {
            allocator: self,
            seq,
        }
    }

    /// Last sequence handed out
    pub fn last(&self) -> u64 {
        self.state.lock().last
    }

    /// Highest sequence such that every sequence at or below it is settled
    pub fn watermark(&self) -> u64 {
        let state = self.state.lock();
        match state.in_flight.first() {
            Some(&oldest) => oldest - 1,
            None => state.last,
        }
    }

    fn release(&self, seq: u64) {
        let mut state = self.state.lock();
        state.in_flight.remove(&seq);
    }
}

impl SeqGuard<'_> {
    pub fn value(&self) -> u64 {
        self.seq
    }
}

impl Drop for SeqGuard<'_> {
    fn drop(&mut self) {
        self.allocator.release(self.seq);
    }
}

/// Produces the next history for local writes
pub struct VersionTracker {
    node_id: NodeId,
    sequence: SequenceAllocator,
}

impl VersionTracker {
    pub fn new(node_id: NodeId, last_committed: u64) -> Self {
        Self {
            node_id,
            sequence: SequenceAllocator::new(last_committed),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn sequence(&self) -> &SequenceAllocator {
        &self.sequence
    }

    /// Allocate a sequence for a state change that is not a local write
    pub fn allocate(&self) -> SeqGuard<'_> {
        self.sequence.allocate()
    }

    /// Allocate a fresh etag and stamp it as this node's entry on `current`
    pub fn record_local_write(&self, current: &History) -> (SeqGuard<'_>, History) {
        let guard = self.sequence.allocate();
        let mut history = current.clone();
        // Sequences only grow, but a restored store may hold a history from a
        // previous incarnation with a higher entry.
        if !history.record(self.node_id, guard.value()) {
            history.observe(self.node_id, history.get(&self.node_id) + 1);
        }
        (guard, history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_monotonic() {
        let alloc = SequenceAllocator::new(10);
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert_eq!(a.value(), 11);
        assert_eq!(b.value(), 12);
    }

    #[test]
    fn test_watermark_waits_for_oldest_in_flight() {
        let alloc = SequenceAllocator::new(0);
        let first = alloc.allocate();
        let second = alloc.allocate();
        assert_eq!(alloc.watermark(), 0);

        drop(second);
        assert_eq!(alloc.watermark(), 0);

        drop(first);
        assert_eq!(alloc.watermark(), 2);
        assert_eq!(alloc.last(), 2);
    }

    #[test]
    fn test_record_local_write_bumps_own_entry() {
        let node = NodeId::new();
        let other = NodeId::new();
        let tracker = VersionTracker::new(node, 0);

        let (seq1, h1) = tracker.record_local_write(&History::new());
        assert_eq!(h1.get(&node), seq1.value());
        drop(seq1);

        let mut base = h1.clone();
        base.observe(other, 4);
        let (seq2, h2) = tracker.record_local_write(&base);
        assert!(seq2.value() > h1.get(&node));
        assert_eq!(h2.get(&node), seq2.value());
        assert_eq!(h2.get(&other), 4);
        assert!(h2.dominates(&base));
    }
}
