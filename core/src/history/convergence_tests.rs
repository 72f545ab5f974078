//! Property-based tests for history comparison
//!
//! Tests that the classification used by replication is consistent:
//! - Symmetry: concurrency is symmetric, dominance is antisymmetric
//! - Merge: a merged history plus a fresh local entry dominates every input
//! - Order independence: merging in any order gives the same history

use proptest::prelude::*;
use crate::history::{classify, Classification, History, HistoryEntry};
use crate::types::NodeId;

/// A small fixed pool of nodes so generated histories overlap
fn node_pool() -> Vec<NodeId> {
    (0u8..4).map(|i| NodeId([i + 1; 16])).collect()
}

fn arb_history() -> impl Strategy<Value = History> {
    let pool = node_pool();
    prop::collection::vec((0usize..4, 1u64..6), 0..6).prop_map(move |pairs| {
        History::from_entries(pairs.into_iter().map(|(idx, etag)| HistoryEntry {
            node: pool[idx],
            etag,
        }))
    })
}

proptest! {
    #[test]
    fn prop_concurrency_is_symmetric(a in arb_history(), b in arb_history()) {
        prop_assert_eq!(
            classify(&a, &b) == Classification::Concurrent,
            classify(&b, &a) == Classification::Concurrent
        );
    }

    #[test]
    fn prop_descendant_implies_reverse_superseded(a in arb_history(), b in arb_history()) {
        if classify(&a, &b) == Classification::Descendant {
            prop_assert_eq!(classify(&b, &a), Classification::Superseded);
        }
    }

    #[test]
    fn prop_resolution_dominates_all(candidates in prop::collection::vec(arb_history(), 1..5)) {
        let resolver = NodeId([9; 16]);
        let mut merged = History::new();
        for c in &candidates {
            merged.merge(c);
        }
        let next = merged.get(&resolver) + 1;
        merged.record(resolver, next);

        for c in &candidates {
            prop_assert_eq!(classify(c, &merged), Classification::Descendant);
        }
    }

    #[test]
    fn prop_merge_order_independent(a in arb_history(), b in arb_history(), c in arb_history()) {
        let mut left = a.clone();
        left.merge(&b);
        left.merge(&c);

        let mut right = c.clone();
        right.merge(&a);
        right.merge(&b);

        prop_assert_eq!(left, right);
    }

    #[test]
    fn prop_generated_histories_are_well_formed(h in arb_history()) {
        prop_assert!(h.is_well_formed());
    }
}
