//! Cursor, presence, and participant notification fan-out.

use std::sync::Arc;

use anyhow::Result;
use common::*;
use cowrite_server::{ServerState, server};
use serde_json::json;
use tokio::time::{self, Duration};

pub mod common;

#[tokio::test]
async fn test_cursor_fanout_is_throttled() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut alice = client.connect("curdoc", "alice", "owner").await?;
    assert_eq!(alice.recv().await?["type"], "document_response");
    let mut bob = client.connect("curdoc", "bob", "editor").await?;
    assert_eq!(bob.recv().await?["type"], "document_response");
    assert_eq!(alice.recv().await?["type"], "participant_joined");

    bob.send(&envelope("bob", "cursor", json!({ "cursor": { "position": 4 } }))).await;
    let msg = alice.recv().await?;
    assert_eq!(msg["type"], "cursor");
    assert_eq!(msg["data"]["cursor"]["position"], 4);
    assert_eq!(msg["data"]["cursor"]["userId"], "bob");
    assert!(msg["data"]["cursor"]["color"].as_str().unwrap().starts_with('#'));

    // Inside the 100 ms throttle window: dropped.
    bob.send(&envelope("bob", "cursor", json!({ "cursor": { "position": 5 } }))).await;
    assert_eq!(alice.recv_timeout(150).await, None);

    time::sleep(Duration::from_millis(150)).await;
    bob.send(&envelope("bob", "cursor", json!({ "cursor": { "position": 6 } }))).await;
    let msg = alice.recv().await?;
    assert_eq!(msg["data"]["cursor"]["position"], 6);

    // The origin never receives its own cursor.
    assert_eq!(bob.recv_timeout(150).await, None);
    Ok(())
}

#[tokio::test]
async fn test_selection_is_a_cursor_update() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut alice = client.connect("seldoc", "alice", "owner").await?;
    assert_eq!(alice.recv().await?["type"], "document_response");
    let mut bob = client.connect("seldoc", "bob", "editor").await?;
    assert_eq!(bob.recv().await?["type"], "document_response");
    assert_eq!(alice.recv().await?["type"], "participant_joined");

    bob.send(&envelope(
        "bob",
        "selection",
        json!({ "selection": { "start": 2, "end": 7, "direction": "forward" } }),
    ))
    .await;
    let msg = alice.recv().await?;
    assert_eq!(msg["type"], "cursor");
    assert_eq!(msg["data"]["cursor"]["position"], 7, "anchored at the selection end");
    assert_eq!(msg["data"]["cursor"]["selection"]["start"], 2);
    assert_eq!(msg["data"]["cursor"]["selection"]["end"], 7);
    Ok(())
}

#[tokio::test]
async fn test_typing_and_status_updates() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut alice = client.connect("typedoc", "alice", "owner").await?;
    assert_eq!(alice.recv().await?["type"], "document_response");
    let mut bob = client.connect("typedoc", "bob", "editor").await?;
    assert_eq!(bob.recv().await?["type"], "document_response");
    assert_eq!(alice.recv().await?["type"], "participant_joined");

    bob.send(&envelope("bob", "presence", json!({ "presence": { "isTyping": true } }))).await;
    let msg = alice.recv().await?;
    assert_eq!(msg["type"], "presence");
    assert_eq!(msg["data"]["presence"]["userId"], "bob");
    assert_eq!(msg["data"]["presence"]["status"], "active");
    assert_eq!(msg["data"]["presence"]["typing"]["isTyping"], true);

    bob.send(&envelope("bob", "presence", json!({ "presence": { "status": "idle" } }))).await;
    let msg = alice.recv().await?;
    assert_eq!(msg["data"]["presence"]["status"], "idle");

    // A viewport update fans out as presence too.
    bob.send(&envelope(
        "bob",
        "presence",
        json!({ "presence": { "viewport": { "from": 0, "to": 80 } } }),
    ))
    .await;
    let msg = alice.recv().await?;
    assert_eq!(msg["data"]["presence"]["viewport"]["to"], 80);
    Ok(())
}

#[tokio::test]
async fn test_join_and_leave_notifications() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut alice = client.connect("joindoc", "alice", "owner").await?;
    assert_eq!(alice.recv().await?["type"], "document_response");

    let mut bob = client.connect("joindoc", "bob", "editor").await?;
    assert_eq!(bob.recv().await?["type"], "document_response");

    let msg = alice.recv().await?;
    assert_eq!(msg["type"], "participant_joined");
    assert_eq!(msg["data"]["participant"]["userId"], "bob");
    assert_eq!(msg["data"]["participant"]["role"], "editor");
    assert_eq!(msg["data"]["participant"]["permissions"]["canEdit"], true);

    drop(bob);
    let msg = alice.recv().await?;
    assert_eq!(msg["type"], "participant_left");
    assert_eq!(msg["data"]["userId"], "bob");
    Ok(())
}

#[tokio::test]
async fn test_rejoin_is_idempotent() -> Result<()> {
    logging();
    let client = TestClient::start(server(Arc::new(ServerState::temporary().await?))).await?;

    let mut alice = client.connect("redoc", "alice", "owner").await?;
    assert_eq!(alice.recv().await?["type"], "document_response");
    let mut bob = client.connect("redoc", "bob", "editor").await?;
    assert_eq!(bob.recv().await?["type"], "document_response");
    assert_eq!(alice.recv().await?["type"], "participant_joined");

    drop(bob);
    assert_eq!(alice.recv().await?["type"], "participant_left");

    let mut bob = client.connect("redoc", "bob", "editor").await?;
    let msg = bob.recv().await?;
    assert_eq!(msg["type"], "document_response");
    let participants = msg["data"]["participants"].as_array().unwrap();
    assert_eq!(participants.len(), 2, "no duplicate entry for the rejoining user");
    assert_eq!(alice.recv().await?["type"], "participant_joined");
    Ok(())
}
