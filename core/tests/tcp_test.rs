//! Replication over real TCP sockets

use anyhow::Result;
use replidoc_core::network::TcpTransport;
use replidoc_core::testkit::{await_conflict, await_converged, await_document, fast_config};
use replidoc_core::{Content, Destination, DocumentId, Node, Storage};
use std::sync::Arc;

/// Initialize logging for tests (call once per test)
fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

async fn tcp_node(name: &str) -> Result<(Node, Destination)> {
    let node = Node::with_storage(
        fast_config(name),
        Arc::new(Storage::in_memory()?),
        Arc::new(TcpTransport::new()),
    )?;
    let addr = node.serve("127.0.0.1:0").await?;
    let destination = Destination::new(node.node_id(), addr.to_string());
    node.start()?;
    Ok((node, destination))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tcp_replication_end_to_end() -> Result<()> {
    init_test_logging();
    let (alice, alice_at) = tcp_node("alice").await?;
    let (bob, bob_at) = tcp_node("bob").await?;
    alice.add_destination(bob_at).await?;
    bob.add_destination(alice_at).await?;

    let id = DocumentId::from("users/1");
    alice.put(&id, Content::new("hello").with_metadata("type", "greeting"))?;
    let doc = await_document(5, &bob, &id, b"hello").await?;
    assert_eq!(doc.content.metadata.get("type").map(String::as_str), Some("greeting"));
    assert_eq!(doc.origin, alice.node_id());

    // Large documents cross the compression threshold
    let big = DocumentId::from("blobs/1");
    let payload = vec![b'z'; 64 * 1024];
    bob.put(&big, Content::new(payload.clone()))?;
    await_document(5, &alice, &big, &payload).await?;

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tcp_conflict_and_resolution() -> Result<()> {
    let (alice, alice_at) = tcp_node("alice").await?;
    let (bob, bob_at) = tcp_node("bob").await?;

    let id = DocumentId::from("users/1");
    alice.put(&id, Content::new("a"))?;
    bob.put(&id, Content::new("b"))?;
    alice.add_destination(bob_at).await?;
    bob.add_destination(alice_at).await?;

    await_conflict(5, &alice, &id).await?;
    await_conflict(5, &bob, &id).await?;

    bob.resolve_by_overwrite(&id, Content::new("ab"))?;
    await_document(5, &alice, &id, b"ab").await?;
    await_converged(5, &[&alice, &bob], &id).await?;

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_unreachable_destination_does_not_block_writes() -> Result<()> {
    let (alice, _) = tcp_node("alice").await?;
    let ghost = Destination::new(replidoc_core::NodeId::new(), "127.0.0.1:1");
    alice.add_destination(ghost).await?;

    let id = DocumentId::from("users/1");
    alice.put(&id, Content::new("local"))?;
    await_document(1, &alice, &id, b"local").await?;

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let stats = alice.replication_stats();
    assert!(stats[0].stats.total_failures > 0);
    assert!(stats[0].stats.last_error.is_some());

    alice.shutdown().await;
    Ok(())
}
