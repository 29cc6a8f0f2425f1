//! Positions are character indices, so multi-byte content must behave
//! exactly like ASCII.

use std::sync::Arc;

use anyhow::Result;
use common::*;
use cowrite_server::{ServerState, server};
use tokio::time::{self, Duration};

pub mod common;

#[tokio::test]
async fn test_multibyte_insert_and_delete() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut alice = client.connect("unidoc", "alice", "owner").await?;
    assert_eq!(alice.recv().await?["type"], "document_response");

    alice.send(&insert_op("alice", "unidoc", 0, "héllo wörld", 1)).await;
    client.wait_for_text("unidoc", "héllo wörld").await;

    // Delete "éllo" by character positions.
    alice.send(&delete_op("alice", "unidoc", 1, 4, 2)).await;
    client.wait_for_text("unidoc", "h wörld").await;

    alice.send(&insert_op("alice", "unidoc", 7, " 🦀", 3)).await;
    client.wait_for_text("unidoc", "h wörld 🦀").await;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_multibyte_inserts() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut alice = client.connect("unidoc2", "alice", "owner").await?;
    assert_eq!(alice.recv().await?["type"], "document_response");
    let mut bob = client.connect("unidoc2", "bob", "editor").await?;
    assert_eq!(bob.recv().await?["type"], "document_response");
    assert_eq!(alice.recv().await?["type"], "participant_joined");

    alice.send(&insert_op("alice", "unidoc2", 0, "é", 1)).await;
    assert_eq!(bob.recv().await?["type"], "operation");

    time::sleep(Duration::from_millis(20)).await;
    // Concurrent with Alice's insert; shifts by one character, not two
    // bytes.
    bob.send(&insert_op("bob", "unidoc2", 0, "😀", 1)).await;
    let msg = alice.recv().await?;
    assert_eq!(msg["data"]["operation"]["position"], 1);

    client.wait_for_text("unidoc2", "é😀").await;
    Ok(())
}
