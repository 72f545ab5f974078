//! Conflict detection and resolution across nodes
//!
//! Every scenario writes on nodes that cannot see each other, then opens
//! replication and checks what each side ends up holding.

use anyhow::Result;
use replidoc_core::testkit::*;
use replidoc_core::{Content, DocumentId, Error, Lookup};

/// Two nodes that each wrote `identity` without seeing the other
async fn diverged(identity: &DocumentId) -> Result<TestCluster> {
    let cluster = TestCluster::new(2)?;
    cluster[0].put(identity, Content::new("from-0"))?;
    cluster[1].put(identity, Content::new("from-1"))?;
    cluster.replicate_all().await?;
    Ok(cluster)
}

#[tokio::test]
async fn test_concurrent_writes_conflict_on_both_nodes() -> Result<()> {
    let id = DocumentId::from("users/1");
    let cluster = diverged(&id).await?;

    let mut on_0 = await_conflict(5, &cluster[0], &id).await?.candidates;
    let mut on_1 = await_conflict(5, &cluster[1], &id).await?.candidates;
    on_0.sort();
    on_1.sort();
    assert_eq!(on_0, on_1);
    assert_eq!(on_0.len(), 2);

    // Candidates are addressable and carry the raced contents
    let mut contents = Vec::new();
    for candidate in &on_0 {
        let version = cluster[1]
            .get_candidate(candidate.as_str())?
            .expect("candidate should be fetchable");
        match version.body {
            replidoc_core::Body::Document(content) => contents.push(content.data),
            replidoc_core::Body::Tombstone => panic!("unexpected tombstone candidate"),
        }
    }
    contents.sort();
    assert_eq!(contents, vec![b"from-0".to_vec(), b"from-1".to_vec()]);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_conflict_read_is_repeatable() -> Result<()> {
    let id = DocumentId::from("users/1");
    let cluster = diverged(&id).await?;
    let first = await_conflict(5, &cluster[0], &id).await?;
    await_converged(5, &[&cluster[0], &cluster[1]], &id).await?;

    for _ in 0..3 {
        let again = cluster[0].get(&id)?;
        assert_eq!(again, Lookup::Conflict(first.clone()));
    }

    match cluster[0].get(&id)?.into_result(&id) {
        Err(Error::Conflict { identity, candidates }) => {
            assert_eq!(identity, id);
            assert_eq!(candidates, first.candidates);
        }
        other => panic!("expected conflict error, got {:?}", other),
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_overwrite_resolution_propagates() -> Result<()> {
    let id = DocumentId::from("users/1");
    let cluster = diverged(&id).await?;
    let conflict = await_conflict(5, &cluster[0], &id).await?;
    await_conflict(5, &cluster[1], &id).await?;

    cluster[0].resolve_by_overwrite(&id, Content::new("merged"))?;
    assert_eq!(cluster[0].get(&id)?.document().map(|d| d.content.data.clone()), Some(b"merged".to_vec()));

    await_document(5, &cluster[1], &id, b"merged").await?;
    await_converged(5, &[&cluster[0], &cluster[1]], &id).await?;

    for node in cluster.iter() {
        assert!(node.conflicts()?.is_empty());
        for candidate in &conflict.candidates {
            assert!(node.get_candidate(candidate.as_str())?.is_none());
        }
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_delete_resolution_is_idempotent() -> Result<()> {
    let id = DocumentId::from("users/1");
    let cluster = diverged(&id).await?;
    await_conflict(5, &cluster[0], &id).await?;

    cluster[0].resolve_by_delete(&id)?;
    cluster[0].resolve_by_delete(&id)?;
    assert_eq!(cluster[0].get(&id)?, Lookup::NotFound);
    assert!(cluster[0].conflicts()?.is_empty());

    await_not_found(5, &cluster[1], &id).await?;
    await_converged(5, &[&cluster[0], &cluster[1]], &id).await?;
    assert!(cluster[1].conflicts()?.is_empty());

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_independent_deletes_conflict() -> Result<()> {
    let id = DocumentId::from("users/1");
    let cluster = TestCluster::new(2)?;

    cluster.replicate(0, 1).await?;
    cluster[0].put(&id, Content::new("shared"))?;
    await_document(5, &cluster[1], &id, b"shared").await?;
    cluster.stop_replication(0, 1).await?;

    // Both sides delete without hearing from each other
    cluster[0].delete(&id)?;
    cluster[1].delete(&id)?;
    cluster.replicate_all().await?;

    let conflict = await_conflict(5, &cluster[0], &id).await?;
    await_conflict(5, &cluster[1], &id).await?;
    await_converged(5, &[&cluster[0], &cluster[1]], &id).await?;

    for candidate in &conflict.candidates {
        let version = cluster[0].get_candidate(candidate.as_str())?.expect("candidate");
        assert!(version.body.is_tombstone());
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_write_concurrent_with_delete_conflicts() -> Result<()> {
    let id = DocumentId::from("users/1");
    let cluster = TestCluster::new(2)?;

    cluster.replicate(0, 1).await?;
    cluster[0].put(&id, Content::new("v1"))?;
    await_document(5, &cluster[1], &id, b"v1").await?;
    cluster.stop_replication(0, 1).await?;

    cluster[0].put(&id, Content::new("v2"))?;
    cluster[1].delete(&id)?;
    cluster.replicate_all().await?;

    await_conflict(5, &cluster[0], &id).await?;
    await_conflict(5, &cluster[1], &id).await?;
    await_converged(5, &[&cluster[0], &cluster[1]], &id).await?;

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_stale_write_does_not_resurrect_deleted_document() -> Result<()> {
    let id = DocumentId::from("users/1");
    let cluster = TestCluster::new(2)?;

    cluster.replicate_all().await?;
    cluster[0].put(&id, Content::new("v1"))?;
    await_document(5, &cluster[1], &id, b"v1").await?;

    cluster[1].delete(&id)?;
    await_not_found(5, &cluster[0], &id).await?;
    await_converged(5, &[&cluster[0], &cluster[1]], &id).await?;

    assert_eq!(cluster[0].get(&id)?, Lookup::NotFound);
    assert!(cluster[0].conflicts()?.is_empty());

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_relayed_writes_conflict_at_common_destination() -> Result<()> {
    println!("\n=== 0 -> 2 and 1 -> 2 with independent writes ===\n");
    let id = DocumentId::from("orders/7");
    let cluster = TestCluster::new(3)?;

    cluster.replicate(0, 2).await?;
    cluster[0].put(&id, Content::new("from-0"))?;
    await_document(5, &cluster[2], &id, b"from-0").await?;

    cluster[1].put(&id, Content::new("from-1"))?;
    cluster.replicate(1, 2).await?;

    let conflict = await_conflict(5, &cluster[2], &id).await?;
    assert_eq!(conflict.candidates.len(), 2);

    // Neither source receives anything back
    assert!(cluster[0].get(&id)?.document().is_some());
    assert!(cluster[1].get(&id)?.document().is_some());

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_three_way_conflict_resolves_everywhere() -> Result<()> {
    let id = DocumentId::from("users/9");
    let cluster = TestCluster::new(3)?;
    for (i, node) in cluster.iter().enumerate() {
        node.put(&id, Content::new(format!("from-{}", i)))?;
    }
    cluster.replicate_all().await?;

    for node in cluster.iter() {
        await_candidates(5, node, &id, 3).await?;
    }
    let nodes: Vec<_> = cluster.iter().collect();
    await_converged(5, &nodes, &id).await?;

    cluster[2].resolve_by_overwrite(&id, Content::new("final"))?;
    for node in cluster.iter() {
        await_document(5, node, &id, b"final").await?;
    }
    await_converged(5, &nodes, &id).await?;

    cluster.shutdown().await;
    Ok(())
}
