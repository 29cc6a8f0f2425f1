//! Server backend for the Cowrite collaborative document editing engine.
//!
//! The engine core lives in [`ot`] (operations, transforms, conflicts),
//! [`history`], [`presence`], and [`session`]; [`collab`] binds WebSocket
//! connections to sessions and [`lifecycle`] runs the background loops.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use serde::{Deserialize, Serialize};
use tracing::info;

pub mod collab;
pub mod config;
pub mod database;
mod error;
pub mod events;
pub mod history;
pub mod lifecycle;
pub mod ot;
pub mod presence;
pub mod session;
pub mod util;

pub use config::EngineConfig;
pub use error::EngineError;

use crate::collab::JoinRequest;
use crate::database::Database;
use crate::session::{Role, SessionManager};

/// Unique identifier for a document or session.
#[repr(align(64))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier([u8; Self::MAX_LEN]);

impl Identifier {
    /// Maximum length of an identifier, in bytes.
    pub const MAX_LEN: usize = 64;

    fn valid_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ' ')
    }
}

impl FromStr for Identifier {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            anyhow::bail!("identifier is empty");
        }
        if s.len() > Self::MAX_LEN {
            anyhow::bail!("identifier is too long");
        }
        if !s.chars().all(Self::valid_char) {
            anyhow::bail!("identifier contains invalid characters");
        }
        let mut bytes = [0u8; Self::MAX_LEN];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self(bytes))
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(Self::MAX_LEN);
        std::str::from_utf8(&self.0[..len]).expect("identifier contains invalid UTF-8")
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl Serialize for Identifier {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_ref())
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// The shared state of the server, accessible from request handlers and
/// background tasks.
pub struct ServerState {
    /// Registry of live sessions.
    pub sessions: SessionManager,
    /// Persistence backend.
    pub database: Database,
    /// Connection registry and per-session operation queues.
    pub controller: collab::Controller,
    /// Metrics and teardown.
    pub lifecycle: lifecycle::LifecycleManager,
    /// System time when the server started, seconds since Unix epoch.
    start_time: u64,
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("SystemTime returned before UNIX_EPOCH")
        .as_secs()
}

impl ServerState {
    /// Creates server state with storage rooted at `storage`.
    pub async fn new(storage: PathBuf, defaults: EngineConfig) -> Result<Self> {
        Ok(Self {
            sessions: SessionManager::new(defaults),
            database: Database::new(storage).await?,
            controller: collab::Controller::default(),
            lifecycle: lifecycle::LifecycleManager::default(),
            start_time: unix_now_secs(),
        })
    }

    /// Server state with temporary storage and default settings, for tests.
    pub async fn temporary() -> Result<Self> {
        Ok(Self {
            sessions: SessionManager::new(EngineConfig::default()),
            database: Database::temporary().await?,
            controller: collab::Controller::default(),
            lifecycle: lifecycle::LifecycleManager::default(),
            start_time: unix_now_secs(),
        })
    }

    /// Persists every dirty session; called on graceful shutdown.
    pub async fn persist(&self) {
        for session in self.sessions.all() {
            if let Some(document) = session.dirty_document().await {
                info!(session = session.session_id(), "persisting on shutdown");
                if let Err(e) = self.database.store_document(&document).await {
                    tracing::error!(session = session.session_id(), "shutdown persist: {e:#}");
                }
            }
        }
    }
}

/// Statistics about the server, returned from an API endpoint.
#[derive(Serialize)]
struct Stats {
    /// System time when the server started, in seconds since Unix epoch.
    start_time: u64,
    /// Number of live sessions.
    num_sessions: usize,
    /// Number of documents persisted in the database.
    database_size: usize,
}

/// Query parameters supplied by the transport when a connection joins.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinQuery {
    document_id: Identifier,
    user_id: String,
    username: String,
    role: Role,
}

/// Builds the server router and spawns the session reaper.
pub fn server(state: Arc<ServerState>) -> Router {
    lifecycle::spawn_reaper(Arc::clone(&state));

    Router::new()
        .route("/api/socket/{id}", get(socket_handler))
        .route("/api/text/{id}", get(text_handler))
        .route("/api/export/{id}", get(export_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(state)
}

/// Handler for the `/api/socket/{id}` endpoint.
async fn socket_handler(
    Path(id): Path<Identifier>,
    Query(query): Query<JoinQuery>,
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    info!("socket connection for session = {id}");
    let join = JoinRequest {
        session_id: id,
        document_id: query.document_id,
        user_id: query.user_id,
        username: query.username,
        role: query.role,
    };
    ws.on_upgrade(move |socket| collab::handle_socket(state, socket, join))
}

/// Handler for the `/api/text/{id}` endpoint: the session's current text,
/// falling back to the persisted document for inactive sessions.
async fn text_handler(
    Path(id): Path<Identifier>,
    State(state): State<Arc<ServerState>>,
) -> String {
    match state.sessions.get(&id) {
        Some(session) => session.text().await,
        None => state
            .database
            .load_document(&id)
            .await
            .map(|document| document.content)
            .unwrap_or_default(),
    }
}

/// Handler for the `/api/export/{id}` endpoint.
async fn export_handler(
    Path(id): Path<Identifier>,
    State(state): State<Arc<ServerState>>,
) -> Result<axum::Json<lifecycle::SessionExport>, StatusCode> {
    let session = state.sessions.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    let export = lifecycle::export_session(&session, &state.lifecycle).await;
    Ok(axum::Json(export))
}

/// Handler for the `/api/stats` endpoint.
async fn stats_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<axum::Json<Stats>, StatusCode> {
    let database_size = state
        .database
        .document_count()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(axum::Json(Stats {
        start_time: state.start_time,
        num_sessions: state.sessions.len(),
        database_size,
    }))
}
