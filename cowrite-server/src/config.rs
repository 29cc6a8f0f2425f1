//! Per-session engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ot::resolve::ResolutionStrategy;

/// Tunable settings applied to each collaborative session.
///
/// New sessions copy the server-wide defaults; exports carry the settings
/// the session actually ran with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Operations drained from the queue per processor batch.
    pub max_concurrent_operations: usize,
    /// Milliseconds a queued operation may wait before it is rejected.
    pub operation_timeout_ms: u64,
    /// Milliseconds between auto-sync passes.
    pub sync_interval_ms: u64,
    /// Milliseconds of inactivity before an auto-sync pass persists.
    pub auto_save_interval_ms: u64,
    /// History entries retained before compression or truncation.
    pub max_history_size: usize,
    /// Strategy used when a transform leaves a semantic conflict.
    pub conflict_resolution_strategy: ResolutionStrategy,
    /// Participant limit per session.
    pub max_participants: usize,
    /// Whether history compression may run.
    pub compression_enabled: bool,
    /// Whether cursor updates are tracked and fanned out.
    pub enable_real_time_cursors: bool,
    /// Whether operation history is recorded.
    pub enable_operation_history: bool,
    /// Minimum milliseconds between cursor updates per user.
    pub cursor_throttle_ms: u64,
    /// Milliseconds before a typing indicator expires.
    pub typing_timeout_ms: u64,
    /// Milliseconds of inactivity before a presence status decays.
    pub presence_timeout_ms: u64,
    /// Cap on cursors returned to a client.
    pub max_cursors_displayed: usize,
    /// Undo/redo stack depth per user.
    pub max_undo_stack_size: usize,
    /// Milliseconds between automatic snapshots.
    pub snapshot_interval_ms: u64,
    /// Milliseconds of inactivity before the session is exported and
    /// torn down.
    pub max_session_duration_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: 100,
            operation_timeout_ms: 30_000,
            sync_interval_ms: 5_000,
            auto_save_interval_ms: 10_000,
            max_history_size: 1_000,
            conflict_resolution_strategy: ResolutionStrategy::Merge,
            max_participants: 100,
            compression_enabled: true,
            enable_real_time_cursors: true,
            enable_operation_history: true,
            cursor_throttle_ms: 100,
            typing_timeout_ms: 3_000,
            presence_timeout_ms: 5 * 60 * 1_000,
            max_cursors_displayed: 10,
            max_undo_stack_size: 50,
            snapshot_interval_ms: 5 * 60 * 1_000,
            max_session_duration_ms: 24 * 60 * 60 * 1_000,
        }
    }
}

impl EngineConfig {
    /// Queue length beyond which new operations are refused.
    pub fn backpressure_limit(&self) -> usize {
        self.max_concurrent_operations * 10
    }

    /// Queued-operation deadline as a [`Duration`].
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Cursor throttle window as a [`Duration`].
    pub fn cursor_throttle(&self) -> Duration {
        Duration::from_millis(self.cursor_throttle_ms)
    }

    /// Typing indicator lifetime as a [`Duration`].
    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    /// Presence decay interval as a [`Duration`].
    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }

    /// Idle span after which a session is reaped, as a [`Duration`].
    pub fn max_session_duration(&self) -> Duration {
        Duration::from_millis(self.max_session_duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_operations, 100);
        assert_eq!(config.operation_timeout_ms, 30_000);
        assert_eq!(config.sync_interval_ms, 5_000);
        assert_eq!(config.auto_save_interval_ms, 10_000);
        assert_eq!(config.max_history_size, 1_000);
        assert_eq!(config.conflict_resolution_strategy, ResolutionStrategy::Merge);
        assert_eq!(config.max_participants, 100);
        assert!(config.compression_enabled);
        assert!(config.enable_real_time_cursors);
        assert!(config.enable_operation_history);
        assert_eq!(config.backpressure_limit(), 1_000);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "maxParticipants": 2 }"#).unwrap();
        assert_eq!(config.max_participants, 2);
        assert_eq!(config.max_history_size, 1_000);
    }
}
