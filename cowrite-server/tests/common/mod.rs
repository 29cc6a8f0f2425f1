use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use axum::http::StatusCode;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// A test WebSocket client that sends and receives JSON envelopes.
pub struct JsonSocket(WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>);

impl JsonSocket {
    pub async fn send(&mut self, msg: &Value) {
        self.0.send(msg.to_string().into()).await.unwrap();
    }

    pub async fn recv(&mut self) -> Result<Value> {
        let msg = self
            .0
            .next()
            .await
            .ok_or_else(|| anyhow!("WebSocket closed"))??;
        let msg = msg.to_text().map_err(|_| anyhow!("non-string message"))?;
        Ok(serde_json::from_str(msg)?)
    }

    /// Receives within `ms` milliseconds; `None` when nothing arrives.
    pub async fn recv_timeout(&mut self, ms: u64) -> Option<Value> {
        time::timeout(Duration::from_millis(ms), self.recv())
            .await
            .ok()
            .and_then(|r| r.ok())
    }

    pub async fn recv_closed(&mut self) -> Result<()> {
        match self.0.next().await {
            // A server-side drop may surface as a close frame, a clean
            // end-of-stream, or a protocol error, depending on timing.
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => Ok(()),
            Some(Ok(msg)) => Err(anyhow!("WebSocket should be closed, got {msg:?}")),
        }
    }
}

pub struct TestClient {
    client: reqwest::Client,
    addr: SocketAddr,
}

impl TestClient {
    pub async fn start(router: axum::Router) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, router.layer(TraceLayer::new_for_http())).into_future());
        let client = reqwest::Client::new();
        Ok(Self { client, addr })
    }

    pub async fn get(&self, path: &str) -> Result<String> {
        let url = format!("http://{}/{}", self.addr, path);
        info!("GET {}", url);
        let resp = self.client.get(&url).send().await?;
        assert_eq!(resp.status(), StatusCode::OK);
        Ok(resp.text().await?)
    }

    pub async fn expect_text(&self, id: &str, expected: &str) {
        let actual = self.get(&format!("api/text/{id}")).await.unwrap();
        assert_eq!(actual, expected);
    }

    /// Polls the text endpoint until it matches; the origin of an edit
    /// receives no acknowledgment, so tests synchronize through this.
    pub async fn wait_for_text(&self, id: &str, expected: &str) {
        for _ in 0..250 {
            let actual = self.get(&format!("api/text/{id}")).await.unwrap();
            if actual == expected {
                return;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        let actual = self.get(&format!("api/text/{id}")).await.unwrap();
        assert_eq!(actual, expected, "text did not converge");
    }

    pub async fn export(&self, id: &str) -> Value {
        let raw = self.get(&format!("api/export/{id}")).await.unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    pub async fn connect(&self, session: &str, user: &str, role: &str) -> Result<JsonSocket> {
        let url = format!(
            "ws://{}/api/socket/{session}?documentId={session}&userId={user}&username={user}&role={role}",
            self.addr
        );
        let (socket, _response) = tokio_tungstenite::connect_async(url).await.unwrap();
        Ok(JsonSocket(socket))
    }
}

static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Wraps a payload in the wire envelope.
pub fn envelope(from: &str, kind: &str, data: Value) -> Value {
    let n = MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut env = json!({
        "type": kind,
        "from": from,
        "timestamp": 1_700_000_000_000u64 + n,
        "messageId": format!("msg-test-{n}"),
    });
    if !data.is_null() {
        env["data"] = data;
    }
    env
}

fn op_meta(user: &str, session: &str, version: u64) -> Value {
    let n = MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
    json!({
        "operationId": format!("op-test-{n}"),
        "userId": user,
        "sessionId": session,
        "timestamp": 1_700_000_000_000u64 + n,
        "vectorClock": {},
        "documentVersion": version,
    })
}

pub fn insert_op(user: &str, session: &str, position: u32, content: &str, version: u64) -> Value {
    envelope(
        user,
        "operation",
        json!({
            "operation": {
                "type": "insert",
                "position": position,
                "content": content,
                "metadata": op_meta(user, session, version),
            }
        }),
    )
}

pub fn delete_op(user: &str, session: &str, position: u32, length: u32, version: u64) -> Value {
    envelope(
        user,
        "operation",
        json!({
            "operation": {
                "type": "delete",
                "position": position,
                "length": length,
                "metadata": op_meta(user, session, version),
            }
        }),
    )
}

pub fn format_op(
    user: &str,
    session: &str,
    position: u32,
    length: u32,
    attributes: Value,
    version: u64,
) -> Value {
    envelope(
        user,
        "operation",
        json!({
            "operation": {
                "type": "format",
                "position": position,
                "length": length,
                "attributes": attributes,
                "metadata": op_meta(user, session, version),
            }
        }),
    )
}

pub fn logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=debug,tower_http=debug", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .try_init()
        .ok();
}
