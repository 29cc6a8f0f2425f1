//! Cursor, selection, typing, and status tracking for one session.
//!
//! The tracker is plain state swept by the session's ticker task; methods
//! take the current instant so the sweeps are driven by tokio's (pausable)
//! clock and the unit tests stay deterministic.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::ot::operation::OperationKind;
use crate::ot::transform::transform_index;
use crate::util;

/// A participant's liveness, decayed by inactivity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    /// Recently active.
    Active,
    /// Self-reported as idle.
    Idle,
    /// No activity for one presence timeout.
    Away,
    /// No activity for two presence timeouts; cursor and typing dropped.
    Offline,
}

/// Direction of a selection relative to its anchor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionDirection {
    /// Anchor before focus.
    Forward,
    /// Focus before anchor.
    Backward,
}

/// A selected character range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    /// Start of the range.
    pub start: u32,
    /// One past the end of the range.
    pub end: u32,
    /// Optional direction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<SelectionDirection>,
}

/// A participant's cursor, as broadcast to other participants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    /// Owner of the cursor.
    pub user_id: String,
    /// Character position.
    pub position: u32,
    /// Optional selection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
    /// Wall-clock ms of the last update.
    pub timestamp: u64,
    /// The owner's deterministic display color.
    pub color: String,
}

/// A visible scroll region, for viewport following.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    /// First visible character.
    pub from: u32,
    /// Last visible character.
    pub to: u32,
}

/// Typing indicator state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingState {
    /// Whether the user is typing.
    pub is_typing: bool,
    /// Wall-clock ms when typing started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
}

/// Everything tracked about one participant's presence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    /// The participant.
    pub user_id: String,
    /// Current liveness.
    pub status: PresenceStatus,
    /// Wall-clock ms of the last observed activity.
    pub last_seen: u64,
    /// Typing indicator.
    pub typing: TypingState,
    /// Visible region, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
    /// User this participant is following, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub following: Option<String>,
    /// Deterministic display color.
    pub color: String,
}

/// A state change produced by an update or a sweep, for the caller to
/// fan out as events.
#[derive(Clone, Debug, PartialEq)]
pub enum PresenceChange {
    /// A status transition (decay or explicit).
    Status {
        /// Affected user.
        user_id: String,
        /// New status.
        status: PresenceStatus,
    },
    /// A typing indicator flipped.
    Typing {
        /// Affected user.
        user_id: String,
        /// New indicator value.
        is_typing: bool,
    },
}

/// Result of a throttled cursor update.
#[derive(Clone, Debug, PartialEq)]
pub enum CursorUpdate {
    /// Stored and worth broadcasting; carries any status revival.
    Accepted(Vec<PresenceChange>),
    /// Dropped: it arrived inside the throttle window.
    Throttled,
}

/// Per-session presence state.
#[derive(Debug)]
pub struct PresenceTracker {
    throttle: Duration,
    typing_timeout: Duration,
    presence_timeout: Duration,
    max_cursors: usize,
    presences: HashMap<String, Presence>,
    cursors: HashMap<String, CursorPosition>,
    last_cursor_at: HashMap<String, Instant>,
    typing_deadline: HashMap<String, Instant>,
    presence_deadline: HashMap<String, Instant>,
}

impl PresenceTracker {
    /// A tracker with the given timing knobs.
    pub fn new(
        throttle: Duration,
        typing_timeout: Duration,
        presence_timeout: Duration,
        max_cursors: usize,
    ) -> Self {
        Self {
            throttle,
            typing_timeout,
            presence_timeout,
            max_cursors,
            presences: HashMap::new(),
            cursors: HashMap::new(),
            last_cursor_at: HashMap::new(),
            typing_deadline: HashMap::new(),
            presence_deadline: HashMap::new(),
        }
    }

    /// Registers (or revives) a participant as active.
    pub fn join(&mut self, user_id: &str, now: Instant) {
        let color = util::generate_user_color(user_id);
        self.presences.insert(
            user_id.to_string(),
            Presence {
                user_id: user_id.to_string(),
                status: PresenceStatus::Active,
                last_seen: util::now_millis(),
                typing: TypingState::default(),
                viewport: None,
                following: None,
                color,
            },
        );
        self.presence_deadline.insert(user_id.to_string(), now + self.presence_timeout);
    }

    /// Drops every trace of a participant.
    pub fn leave(&mut self, user_id: &str) {
        self.presences.remove(user_id);
        self.cursors.remove(user_id);
        self.last_cursor_at.remove(user_id);
        self.typing_deadline.remove(user_id);
        self.presence_deadline.remove(user_id);
    }

    /// Presence record for `user_id`, if tracked.
    pub fn presence(&self, user_id: &str) -> Option<&Presence> {
        self.presences.get(user_id)
    }

    /// Stored cursor for `user_id`, if any.
    pub fn cursor(&self, user_id: &str) -> Option<&CursorPosition> {
        self.cursors.get(user_id)
    }

    /// Applies a cursor update, dropping it inside the throttle window.
    /// Accepting an update counts as activity and can revive an away user.
    pub fn update_cursor(
        &mut self,
        user_id: &str,
        position: u32,
        selection: Option<Selection>,
        now: Instant,
    ) -> CursorUpdate {
        if let Some(&last) = self.last_cursor_at.get(user_id)
            && now.duration_since(last) < self.throttle
        {
            return CursorUpdate::Throttled;
        }
        self.last_cursor_at.insert(user_id.to_string(), now);

        let color = self
            .presences
            .get(user_id)
            .map(|p| p.color.clone())
            .unwrap_or_else(|| util::generate_user_color(user_id));
        self.cursors.insert(
            user_id.to_string(),
            CursorPosition {
                user_id: user_id.to_string(),
                position,
                selection,
                timestamp: util::now_millis(),
                color,
            },
        );
        CursorUpdate::Accepted(self.touch(user_id, now))
    }

    /// Records activity: refreshes `last_seen`, resets the decay timer,
    /// and revives away/offline users to active.
    pub fn touch(&mut self, user_id: &str, now: Instant) -> Vec<PresenceChange> {
        self.presence_deadline.insert(user_id.to_string(), now + self.presence_timeout);
        let mut changes = Vec::new();
        if let Some(presence) = self.presences.get_mut(user_id) {
            presence.last_seen = util::now_millis();
            if presence.status != PresenceStatus::Active {
                presence.status = PresenceStatus::Active;
                changes.push(PresenceChange::Status {
                    user_id: user_id.to_string(),
                    status: PresenceStatus::Active,
                });
            }
        }
        changes
    }

    /// Applies a self-reported status (`active`, `idle`, or `away`).
    pub fn set_status(
        &mut self,
        user_id: &str,
        status: PresenceStatus,
        now: Instant,
    ) -> Vec<PresenceChange> {
        self.presence_deadline.insert(user_id.to_string(), now + self.presence_timeout);
        let Some(presence) = self.presences.get_mut(user_id) else {
            return Vec::new();
        };
        presence.last_seen = util::now_millis();
        if presence.status == status {
            return Vec::new();
        }
        presence.status = status;
        vec![PresenceChange::Status {
            user_id: user_id.to_string(),
            status,
        }]
    }

    /// Starts or refreshes (or explicitly stops) a typing indicator.
    pub fn set_typing(&mut self, user_id: &str, is_typing: bool, now: Instant) -> Vec<PresenceChange> {
        let mut changes = self.touch(user_id, now);
        let Some(presence) = self.presences.get_mut(user_id) else {
            return changes;
        };
        if is_typing {
            self.typing_deadline.insert(user_id.to_string(), now + self.typing_timeout);
            if !presence.typing.is_typing {
                presence.typing = TypingState {
                    is_typing: true,
                    started_at: Some(util::now_millis()),
                };
                changes.push(PresenceChange::Typing {
                    user_id: user_id.to_string(),
                    is_typing: true,
                });
            }
        } else {
            self.typing_deadline.remove(user_id);
            if presence.typing.is_typing {
                presence.typing = TypingState::default();
                changes.push(PresenceChange::Typing {
                    user_id: user_id.to_string(),
                    is_typing: false,
                });
            }
        }
        changes
    }

    /// Stores a reported viewport.
    pub fn set_viewport(&mut self, user_id: &str, viewport: Viewport, now: Instant) -> Vec<PresenceChange> {
        let changes = self.touch(user_id, now);
        if let Some(presence) = self.presences.get_mut(user_id) {
            presence.viewport = Some(viewport);
        }
        changes
    }

    /// Stores (or clears) a follow target.
    pub fn set_following(&mut self, user_id: &str, target: Option<String>) {
        if let Some(presence) = self.presences.get_mut(user_id) {
            presence.following = target;
        }
    }

    /// Expires typing indicators and decays statuses. Called from the
    /// session ticker; the returned changes are fanned out as events.
    pub fn sweep(&mut self, now: Instant) -> Vec<PresenceChange> {
        let mut changes = Vec::new();

        let expired_typing: Vec<String> = self
            .typing_deadline
            .iter()
            .filter(|&(_, &deadline)| now >= deadline)
            .map(|(user, _)| user.clone())
            .collect();
        for user_id in expired_typing {
            self.typing_deadline.remove(&user_id);
            if let Some(presence) = self.presences.get_mut(&user_id)
                && presence.typing.is_typing
            {
                presence.typing = TypingState::default();
                changes.push(PresenceChange::Typing {
                    user_id,
                    is_typing: false,
                });
            }
        }

        let expired_presence: Vec<String> = self
            .presence_deadline
            .iter()
            .filter(|&(_, &deadline)| now >= deadline)
            .map(|(user, _)| user.clone())
            .collect();
        for user_id in expired_presence {
            let Some(presence) = self.presences.get_mut(&user_id) else {
                self.presence_deadline.remove(&user_id);
                continue;
            };
            let next = match presence.status {
                PresenceStatus::Active | PresenceStatus::Idle => Some(PresenceStatus::Away),
                PresenceStatus::Away => Some(PresenceStatus::Offline),
                PresenceStatus::Offline => None,
            };
            if let Some(status) = next {
                presence.status = status;
                if status == PresenceStatus::Offline {
                    presence.typing = TypingState::default();
                    presence.viewport = None;
                    self.cursors.remove(&user_id);
                    self.last_cursor_at.remove(&user_id);
                    self.typing_deadline.remove(&user_id);
                    self.presence_deadline.remove(&user_id);
                } else {
                    self.presence_deadline.insert(user_id.clone(), now + self.presence_timeout);
                }
                changes.push(PresenceChange::Status { user_id, status });
            } else {
                self.presence_deadline.remove(&user_id);
            }
        }

        changes
    }

    /// Cursors fresh enough to display, capped, most recent first.
    pub fn session_cursors(&self, now: Instant) -> Vec<CursorPosition> {
        let mut fresh: Vec<&CursorPosition> = self
            .cursors
            .values()
            .filter(|cursor| {
                self.last_cursor_at
                    .get(&cursor.user_id)
                    .is_some_and(|&at| now.duration_since(at) < self.presence_timeout)
            })
            .collect();
        fresh.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        fresh.into_iter().take(self.max_cursors).cloned().collect()
    }

    /// Rebases every stored cursor and selection across an applied
    /// operation so displayed cursors stay consistent with the document.
    pub fn rebase_cursors(&mut self, op: &OperationKind) {
        for cursor in self.cursors.values_mut() {
            cursor.position = transform_index(op, cursor.position);
            if let Some(selection) = &mut cursor.selection {
                selection.start = transform_index(op, selection.start);
                selection.end = transform_index(op, selection.end);
            }
        }
    }

    /// All presence records.
    pub fn presences(&self) -> impl Iterator<Item = &Presence> {
        self.presences.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(
            Duration::from_millis(100),
            Duration::from_secs(3),
            Duration::from_secs(300),
            10,
        )
    }

    /// P6: a second cursor update inside the throttle window is dropped.
    #[tokio::test(start_paused = true)]
    async fn cursor_updates_are_throttled() {
        let mut t = tracker();
        t.join("alice", Instant::now());

        let first = t.update_cursor("alice", 4, None, Instant::now());
        assert!(matches!(first, CursorUpdate::Accepted(_)));

        tokio::time::advance(Duration::from_millis(50)).await;
        let second = t.update_cursor("alice", 5, None, Instant::now());
        assert_eq!(second, CursorUpdate::Throttled);
        assert_eq!(t.cursor("alice").unwrap().position, 4);

        tokio::time::advance(Duration::from_millis(60)).await;
        let third = t.update_cursor("alice", 6, None, Instant::now());
        assert!(matches!(third, CursorUpdate::Accepted(_)));
        assert_eq!(t.cursor("alice").unwrap().position, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_expires_after_timeout() {
        let mut t = tracker();
        t.join("alice", Instant::now());

        let changes = t.set_typing("alice", true, Instant::now());
        assert!(changes.contains(&PresenceChange::Typing {
            user_id: "alice".into(),
            is_typing: true
        }));

        // Refreshing keeps it alive past the original deadline.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(t.set_typing("alice", true, Instant::now()).is_empty());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(t.sweep(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        let changes = t.sweep(Instant::now());
        assert_eq!(
            changes,
            vec![PresenceChange::Typing {
                user_id: "alice".into(),
                is_typing: false
            }]
        );
        assert!(!t.presence("alice").unwrap().typing.is_typing);
    }

    #[tokio::test(start_paused = true)]
    async fn status_decays_active_away_offline() {
        let mut t = tracker();
        t.join("alice", Instant::now());
        assert_eq!(t.presence("alice").unwrap().status, PresenceStatus::Active);
        t.update_cursor("alice", 1, None, Instant::now());

        tokio::time::advance(Duration::from_secs(301)).await;
        let changes = t.sweep(Instant::now());
        assert_eq!(
            changes,
            vec![PresenceChange::Status {
                user_id: "alice".into(),
                status: PresenceStatus::Away
            }]
        );

        tokio::time::advance(Duration::from_secs(301)).await;
        let changes = t.sweep(Instant::now());
        assert_eq!(
            changes,
            vec![PresenceChange::Status {
                user_id: "alice".into(),
                status: PresenceStatus::Offline
            }]
        );
        assert!(t.cursor("alice").is_none(), "offline drops the cursor");

        // Fresh activity revives the participant.
        let revived = t.touch("alice", Instant::now());
        assert_eq!(
            revived,
            vec![PresenceChange::Status {
                user_id: "alice".into(),
                status: PresenceStatus::Active
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn activity_resets_the_decay_timer() {
        let mut t = tracker();
        t.join("alice", Instant::now());

        tokio::time::advance(Duration::from_secs(200)).await;
        t.touch("alice", Instant::now());
        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(t.sweep(Instant::now()).is_empty(), "timer was reset at 200s");

        tokio::time::advance(Duration::from_secs(101)).await;
        assert_eq!(t.sweep(Instant::now()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn session_cursors_filters_and_caps() {
        let mut t = PresenceTracker::new(
            Duration::from_millis(0),
            Duration::from_secs(3),
            Duration::from_secs(300),
            3,
        );
        for (i, user) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            t.join(user, Instant::now());
            t.update_cursor(user, i as u32, None, Instant::now());
        }
        assert_eq!(t.session_cursors(Instant::now()).len(), 3);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(t.session_cursors(Instant::now()).is_empty(), "stale cursors filtered");
    }

    #[tokio::test(start_paused = true)]
    async fn cursors_rebase_across_operations() {
        let mut t = tracker();
        t.join("alice", Instant::now());
        t.update_cursor(
            "alice",
            5,
            Some(Selection { start: 2, end: 5, direction: None }),
            Instant::now(),
        );

        t.rebase_cursors(&OperationKind::Insert {
            position: 0,
            content: "ab".into(),
            attributes: None,
        });
        let cursor = t.cursor("alice").unwrap();
        assert_eq!(cursor.position, 7);
        assert_eq!(cursor.selection.unwrap().start, 4);

        t.rebase_cursors(&OperationKind::Delete {
            position: 0,
            length: 10,
            deleted_content: None,
        });
        assert_eq!(t.cursor("alice").unwrap().position, 0);
    }
}
