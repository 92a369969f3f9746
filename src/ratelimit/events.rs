//! Structured limiter events and the sinks that receive them.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace};

/// What happened to a client's bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterAction {
    /// `add` granted a token
    Granted,
    /// `add` was refused (full bucket or invalid key)
    Rejected,
    /// `use_token` spent a token
    TokenUsed,
    /// `use_token` found no token left
    Exhausted,
    /// The refill task granted a token
    Refilled,
    /// The cleanup task dropped an idle client
    Evicted,
    /// The idle check found no clients at all
    IdleDetected,
}

/// A single observable state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterEvent {
    /// The client involved, absent for limiter-wide events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// What happened
    pub action: LimiterAction,
    /// Token count after the action, when one applies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
}

impl LimiterEvent {
    pub(crate) fn for_key(key: &str, action: LimiterAction, tokens: Option<u32>) -> Self {
        Self {
            key: Some(key.to_string()),
            action,
            tokens,
        }
    }

    pub(crate) fn idle() -> Self {
        Self {
            key: None,
            action: LimiterAction::IdleDetected,
            tokens: None,
        }
    }
}

/// Receives limiter events.
///
/// Called from request paths and background tasks alike, never while a map
/// shard is locked. Implementations should return quickly.
pub trait LimiterObserver: Send + Sync {
    fn on_event(&self, event: &LimiterEvent);
}

/// Routes events into `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl LimiterObserver for TracingObserver {
    fn on_event(&self, event: &LimiterEvent) {
        let key = event.key.as_deref().unwrap_or_default();
        match event.action {
            LimiterAction::Granted | LimiterAction::TokenUsed => {
                trace!(key = %key, action = ?event.action, tokens = ?event.tokens, "Bucket updated");
            }
            LimiterAction::Rejected | LimiterAction::Exhausted => {
                debug!(key = %key, action = ?event.action, tokens = ?event.tokens, "Client over limit");
            }
            LimiterAction::Refilled => {
                trace!(key = %key, tokens = ?event.tokens, "Refilled token");
            }
            LimiterAction::Evicted => {
                debug!(key = %key, "Evicted idle client");
            }
            LimiterAction::IdleDetected => {
                info!("Rate limiter is idle, no clients tracked");
            }
        }
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl LimiterObserver for NoopObserver {
    fn on_event(&self, _event: &LimiterEvent) {}
}

/// Keeps every event in memory.
///
/// Mostly useful in tests.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<LimiterEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events seen so far.
    pub fn events(&self) -> Vec<LimiterEvent> {
        self.events.lock().clone()
    }

    /// Number of events with the given action.
    pub fn count(&self, action: LimiterAction) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.action == action)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl LimiterObserver for RecordingObserver {
    fn on_event(&self, event: &LimiterEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_observer_counts_actions() {
        let observer = RecordingObserver::new();
        observer.on_event(&LimiterEvent::for_key("a", LimiterAction::Granted, Some(1)));
        observer.on_event(&LimiterEvent::for_key("a", LimiterAction::Granted, Some(2)));
        observer.on_event(&LimiterEvent::idle());

        assert_eq!(observer.count(LimiterAction::Granted), 2);
        assert_eq!(observer.count(LimiterAction::IdleDetected), 1);
        assert_eq!(observer.events().len(), 3);

        observer.clear();
        assert!(observer.events().is_empty());
    }

    #[test]
    fn test_event_serialization_skips_missing_fields() {
        let json = serde_json::to_string(&LimiterEvent::idle()).unwrap();
        assert_eq!(json, r#"{"action":"idle_detected"}"#);

        let json =
            serde_json::to_string(&LimiterEvent::for_key("10.0.0.1", LimiterAction::Refilled, Some(3)))
                .unwrap();
        assert_eq!(json, r#"{"key":"10.0.0.1","action":"refilled","tokens":3}"#);
    }
}
