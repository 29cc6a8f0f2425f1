//! Session lifecycle: metrics, export, and the background loops.
//!
//! A thin veneer over the session manager. Metrics are derived entirely
//! from the session event bus; the per-session loops (presence sweeping,
//! auto-sync persistence, automatic snapshots) and the registry-wide
//! reaper are small long-lived tokio tasks that observe the session's
//! kill flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use rand::random_range;
use serde::Serialize;
use tokio::time::{self, Instant};
use tracing::{error, info};

use crate::ServerState;
use crate::collab::emit_presence_changes;
use crate::collab::protocol::{Envelope, ServerMessage};
use crate::events::EventKind;
use crate::history::HistoryNode;
use crate::ot::resolve::ResolutionStats;
use crate::session::{Cowrite, Participant};
use crate::util;
use crate::{Identifier, events::SessionEvent};

/// Sweep cadence for presence decay and typing expiry.
const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Sweep cadence for the idle-session reaper.
const REAP_INTERVAL: Duration = Duration::from_secs(60);
/// Jitter added to auto-sync sleeps so sessions do not persist in lockstep.
const SYNC_JITTER: Duration = Duration::from_secs(1);

/// Event-derived counters for one session.
#[derive(Debug, Default)]
pub struct SessionCounters {
    operations_applied: AtomicU64,
    operations_rejected: AtomicU64,
    conflicts: AtomicU64,
    resolution_micros: AtomicU64,
    participants_current: AtomicU64,
    participants_peak: AtomicU64,
}

/// A point-in-time metrics report for one session.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    /// Milliseconds since the session was created.
    pub duration_ms: u64,
    /// Operations committed.
    pub operation_count: u64,
    /// Operations refused.
    pub rejected_count: u64,
    /// Participants currently joined.
    pub participant_count: u64,
    /// Most participants ever joined at once.
    pub peak_participants: u64,
    /// Conflicts the resolver recorded.
    pub conflict_count: u64,
    /// Mean resolver latency in milliseconds.
    pub average_resolution_time_ms: f64,
    /// Committed share of all submitted operations.
    pub collaboration_efficiency: f64,
}

/// Tracks metrics for every live session by subscribing to its events.
#[derive(Debug, Default)]
pub struct LifecycleManager {
    counters: DashMap<String, Arc<SessionCounters>>,
}

impl LifecycleManager {
    /// Starts tracking `session`, wiring counters to its event bus.
    pub fn track(&self, session: &Cowrite) {
        let counters = Arc::new(SessionCounters::default());
        self.counters.insert(session.session_id().to_string(), Arc::clone(&counters));

        let c = Arc::clone(&counters);
        session.events.subscribe(EventKind::OperationApplied, move |_| {
            c.operations_applied.fetch_add(1, Ordering::Relaxed);
        });
        let c = Arc::clone(&counters);
        session.events.subscribe(EventKind::OperationRejected, move |_| {
            c.operations_rejected.fetch_add(1, Ordering::Relaxed);
        });
        let c = Arc::clone(&counters);
        session.events.subscribe(EventKind::ConflictDetected, move |event| {
            if let SessionEvent::ConflictDetected { resolution_micros, .. } = event {
                c.conflicts.fetch_add(1, Ordering::Relaxed);
                c.resolution_micros.fetch_add(*resolution_micros, Ordering::Relaxed);
            }
        });
        let c = Arc::clone(&counters);
        session.events.subscribe(EventKind::ParticipantJoined, move |_| {
            let current = c.participants_current.fetch_add(1, Ordering::Relaxed) + 1;
            c.participants_peak.fetch_max(current, Ordering::Relaxed);
        });
        let c = Arc::clone(&counters);
        session.events.subscribe(EventKind::ParticipantLeft, move |_| {
            c.participants_current
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
                .ok();
        });
    }

    /// The current report for a session, if tracked.
    pub fn report(&self, session: &Cowrite) -> Option<MetricsReport> {
        let counters = self.counters.get(session.session_id())?;
        let applied = counters.operations_applied.load(Ordering::Relaxed);
        let rejected = counters.operations_rejected.load(Ordering::Relaxed);
        let conflicts = counters.conflicts.load(Ordering::Relaxed);
        let micros = counters.resolution_micros.load(Ordering::Relaxed);
        let submitted = applied + rejected;
        Some(MetricsReport {
            duration_ms: util::now_millis().saturating_sub(session.created_at()),
            operation_count: applied,
            rejected_count: rejected,
            participant_count: counters.participants_current.load(Ordering::Relaxed),
            peak_participants: counters.participants_peak.load(Ordering::Relaxed),
            conflict_count: conflicts,
            average_resolution_time_ms: if conflicts > 0 {
                micros as f64 / conflicts as f64 / 1_000.0
            } else {
                0.0
            },
            collaboration_efficiency: if submitted > 0 {
                applied as f64 / submitted as f64
            } else {
                1.0
            },
        })
    }

    /// Stops tracking a torn-down session.
    pub fn forget(&self, session_id: &str) {
        self.counters.remove(session_id);
    }
}

/// Final state of a session, produced before teardown and on demand.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExport {
    /// The exported session.
    pub session_id: String,
    /// The bound document.
    pub document_id: String,
    /// Wall-clock ms at export time.
    pub exported_at: u64,
    /// Final document state.
    pub document: crate::ot::document::DocumentState,
    /// Full operation history.
    pub operation_history: Vec<HistoryNode>,
    /// Participants at export time.
    pub participants: Vec<Participant>,
    /// Event-derived metrics, when the session is tracked.
    pub metrics: Option<MetricsReport>,
    /// Conflict-resolution statistics.
    pub resolution_stats: ResolutionStats,
}

/// Collects a session's final content, history, participants, and metrics.
pub async fn export_session(session: &Cowrite, lifecycle: &LifecycleManager) -> SessionExport {
    SessionExport {
        session_id: session.session_id().to_string(),
        document_id: session.document_id().to_string(),
        exported_at: util::now_millis(),
        document: session.document().await,
        operation_history: session.history_nodes().await,
        participants: session.participants().await,
        metrics: lifecycle.report(session),
        resolution_stats: session.resolution_stats().await,
    }
}

/// Registers metrics tracking and spawns the session's background loops.
pub fn spawn_session_tasks(state: &Arc<ServerState>, session: &Arc<Cowrite>) {
    state.lifecycle.track(session);
    tokio::spawn(ticker(Arc::clone(state), Arc::clone(session)));
    tokio::spawn(autosync(Arc::clone(state), Arc::clone(session)));
    tokio::spawn(snapshotter(Arc::clone(session)));
}

/// Sweeps presence decay and typing expiry, fanning transitions out to
/// the session's connections.
async fn ticker(state: Arc<ServerState>, session: Arc<Cowrite>) {
    while !session.killed() {
        time::sleep(TICK_INTERVAL).await;
        let now = Instant::now();
        let (changes, records) = session
            .with_presence(|presence| {
                let changes = presence.sweep(now);
                let records: Vec<_> = changes
                    .iter()
                    .filter_map(|change| {
                        let user_id = match change {
                            crate::presence::PresenceChange::Status { user_id, .. }
                            | crate::presence::PresenceChange::Typing { user_id, .. } => user_id,
                        };
                        presence.presence(user_id).cloned()
                    })
                    .collect();
                (changes, records)
            })
            .await;
        if changes.is_empty() {
            continue;
        }
        emit_presence_changes(&session, &changes);
        if let Some(channels) = state
            .controller
            .existing_channels(&session.session_id().parse().expect("session ids are valid"))
        {
            for presence in records {
                channels
                    .connections
                    .broadcast_except(u64::MAX, &Envelope::server(ServerMessage::Presence { presence }));
            }
        }
    }
}

/// Persists the document whenever it is dirty and the session has been
/// quiet for the auto-save interval; runs a final pass on kill.
async fn autosync(state: Arc<ServerState>, session: Arc<Cowrite>) {
    let mut persisted_version: u64 = 0;
    loop {
        let interval = Duration::from_millis(session.config().sync_interval_ms)
            + random_range(Duration::ZERO..=SYNC_JITTER);
        time::sleep(interval).await;
        let killed = session.killed();

        let quiet_ms = util::now_millis().saturating_sub(session.last_activity_ms().await);
        if killed || quiet_ms >= session.config().auto_save_interval_ms {
            if let Some(document) = session.dirty_document().await {
                let version = document.version;
                info!(session = session.session_id(), version, "auto-sync persisting document");
                let ops: Vec<_> = session
                    .history_nodes()
                    .await
                    .into_iter()
                    .filter(|node| node.version_before >= persisted_version)
                    .map(|node| node.operation)
                    .collect();
                if let Err(e) = state.database.store_document(&document).await {
                    error!(session = session.session_id(), "persisting document: {e:#}");
                } else {
                    if let Err(e) = state.database.append_operations(&document.id, &ops).await {
                        error!(session = session.session_id(), "persisting operations: {e:#}");
                    }
                    persisted_version = version;
                    session.events.emit(&SessionEvent::DocumentSaved {
                        session_id: session.session_id().to_string(),
                        version,
                    });
                }
            }
        }
        if killed {
            break;
        }
    }
}

/// Takes an automatic snapshot on the configured interval.
async fn snapshotter(session: Arc<Cowrite>) {
    loop {
        time::sleep(Duration::from_millis(session.config().snapshot_interval_ms)).await;
        if session.killed() {
            break;
        }
        session.create_snapshot(None, true).await;
    }
}

/// Spawns the registry-wide reaper: empty clean sessions are torn down,
/// and sessions idle past `maxSessionDuration` are exported first.
pub fn spawn_reaper(state: Arc<ServerState>) {
    tokio::spawn(async move {
        loop {
            time::sleep(REAP_INTERVAL).await;
            reap_once(&state).await;
        }
    });
}

/// One reaper pass. Exposed so embedders and tests can trigger cleanup
/// without waiting for the background cadence.
pub async fn reap_once(state: &Arc<ServerState>) {
    // Empty sessions with nothing left to save can simply go.
    for session in state.sessions.all() {
        if session.kill_if_idle().await
            && let Ok(id) = session.session_id().parse::<Identifier>()
        {
            info!(session = session.session_id(), "removing empty session");
            state.sessions.remove(&id);
            state.controller.drop_channels(&id);
            state.lifecycle.forget(session.session_id());
        }
    }

    let max_idle = state.sessions.defaults().max_session_duration();
    for session_id in state.sessions.idle_sessions(max_idle).await {
        cleanup_session(state, &session_id).await;
    }
}

/// Exports a session, persists the export and final document, and tears
/// the session down by removing every remaining participant.
pub async fn cleanup_session(state: &Arc<ServerState>, session_id: &Identifier) {
    let Some(session) = state.sessions.get(session_id) else {
        return;
    };
    info!(session = %session_id, "cleaning up session");

    let export = export_session(&session, &state.lifecycle).await;
    if let Err(e) = state.database.store_export(session_id, &export).await {
        error!(session = %session_id, "storing export: {e:#}");
    }
    if let Some(document) = session.dirty_document().await
        && let Err(e) = state.database.store_document(&document).await
    {
        error!(session = %session_id, "persisting final document: {e:#}");
    }

    for participant in session.participants().await {
        session.leave(&participant.user_id).await;
    }
    session.kill();
    state.sessions.remove(session_id);
    state.controller.drop_channels(session_id);
    state.lifecycle.forget(session.session_id());
}
