//! Persistence: shutdown saves, loading existing documents, and the
//! export-then-teardown cleanup path.

use std::sync::Arc;

use anyhow::Result;
use common::*;
use cowrite_server::lifecycle;
use cowrite_server::ot::document::DocumentState;
use cowrite_server::{Identifier, ServerState, server};

pub mod common;

#[tokio::test]
async fn test_persist_and_reload() -> Result<()> {
    logging();
    let state = Arc::new(ServerState::temporary().await?);
    let client = TestClient::start(server(Arc::clone(&state))).await?;

    let mut alice = client.connect("pdoc", "alice", "owner").await?;
    assert_eq!(alice.recv().await?["type"], "document_response");
    alice.send(&insert_op("alice", "pdoc", 0, "persist me", 1)).await;
    client.wait_for_text("pdoc", "persist me").await;

    state.persist().await;

    let id: Identifier = "pdoc".parse().unwrap();
    let document = state.database.load_document(&id).await?;
    assert_eq!(document.content, "persist me");
    assert_eq!(document.version, 2);
    Ok(())
}

#[tokio::test]
async fn test_existing_document_is_loaded_on_create() -> Result<()> {
    logging();
    let state = Arc::new(ServerState::temporary().await?);
    state
        .database
        .store_document(&DocumentState::with_content("predoc", "alice", "from disk".into()))
        .await?;

    let client = TestClient::start(server(Arc::clone(&state))).await?;
    let mut alice = client.connect("predoc", "alice", "owner").await?;
    let msg = alice.recv().await?;
    assert_eq!(msg["type"], "document_response");
    assert_eq!(msg["data"]["documentState"]["content"], "from disk");

    alice.send(&insert_op("alice", "predoc", 9, " again", 1)).await;
    client.wait_for_text("predoc", "from disk again").await;
    Ok(())
}

#[tokio::test]
async fn test_cleanup_exports_and_persists() -> Result<()> {
    logging();
    let state = Arc::new(ServerState::temporary().await?);
    let client = TestClient::start(server(Arc::clone(&state))).await?;

    let mut alice = client.connect("exdoc", "alice", "owner").await?;
    assert_eq!(alice.recv().await?["type"], "document_response");
    alice.send(&insert_op("alice", "exdoc", 0, "bye", 1)).await;
    client.wait_for_text("exdoc", "bye").await;
    drop(alice);

    // Give the disconnect a moment, then tear the session down.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let id: Identifier = "exdoc".parse().unwrap();
    lifecycle::cleanup_session(&state, &id).await;
    assert_eq!(state.sessions.len(), 0);

    let document = state.database.load_document(&id).await?;
    assert_eq!(document.content, "bye");

    // The text endpoint falls back to the persisted copy, and a new
    // connection resumes from it.
    client.expect_text("exdoc", "bye").await;
    let mut alice = client.connect("exdoc", "alice", "owner").await?;
    let msg = alice.recv().await?;
    assert_eq!(msg["data"]["documentState"]["content"], "bye");
    Ok(())
}

#[tokio::test]
async fn test_export_endpoint_reports_metrics() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut alice = client.connect("metdoc", "alice", "owner").await?;
    assert_eq!(alice.recv().await?["type"], "document_response");
    alice.send(&insert_op("alice", "metdoc", 0, "ping", 1)).await;
    client.wait_for_text("metdoc", "ping").await;

    let export = client.export("metdoc").await;
    assert_eq!(export["sessionId"], "metdoc");
    assert_eq!(export["document"]["content"], "ping");
    assert_eq!(export["metrics"]["operationCount"], 1);
    assert_eq!(export["metrics"]["participantCount"], 1);
    assert_eq!(export["metrics"]["collaborationEfficiency"], 1.0);
    assert_eq!(export["operationHistory"].as_array().unwrap().len(), 1);
    Ok(())
}
