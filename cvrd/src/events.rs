//! Event broadcast for downstream notifiers (Slack bridge, dashboard).
//!
//! The pipeline only ever supplies structured payloads; formatting the
//! outbound message is the subscriber's job. Events are JSON lines on a
//! broadcast channel, so a slow or absent subscriber never blocks a run.

use chrono::Utc;
use cvr_common::{DiffResult, ProfileResult, ProfileStatus, Trigger};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_BUFFER: usize = 256;

/// Broadcast channel for daemon events (JSON lines).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl EventBus {
    /// Create a new event bus with the provided buffer size.
    ///
    /// Note: the effective buffer is clamped to at least `DEFAULT_BUFFER` to
    /// avoid frequent lag/drop behavior for bursty event streams.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(1).max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Emit a structured event with payload.
    pub fn emit<T: Serialize>(&self, event: &str, data: &T) {
        let payload = json!({
            "event": event,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        match serde_json::to_string(&payload) {
            Ok(serialized) => {
                let _ = self.sender.send(serialized);
            }
            Err(err) => warn!("Failed to serialize event {}: {}", event, err),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

/// A job entered (or was coalesced into) the queue.
#[derive(Debug, Clone, Serialize)]
pub struct RunQueuedEvent {
    pub repo_full_name: String,
    pub branch: String,
    pub trigger: Trigger,
}

/// A run began executing.
#[derive(Debug, Clone, Serialize)]
pub struct RunStartedEvent {
    pub repo_full_name: String,
    pub branch: String,
    pub run_id: String,
}

/// A run finished; the full structured result for notifiers.
#[derive(Debug, Clone, Serialize)]
pub struct RunCompletedEvent {
    pub repo_full_name: String,
    pub branch: String,
    pub run_id: String,
    pub status: ProfileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<DiffResult>,
    pub duration_ms: u64,
}

impl RunCompletedEvent {
    pub fn from_result(
        repo_full_name: &str,
        branch: &str,
        run_id: &str,
        result: &ProfileResult,
        duration_ms: u64,
    ) -> Self {
        Self {
            repo_full_name: repo_full_name.to_string(),
            branch: branch.to_string(),
            run_id: run_id.to_string(),
            status: result.status,
            error_message: result.error_message.clone(),
            screenshot_path: result
                .screenshot_path
                .as_ref()
                .map(|p| p.display().to_string()),
            diff: result.diff_result.clone(),
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn emit_sends_json_with_event_data_and_timestamp() {
        let bus = EventBus::new(1);
        let mut rx = bus.subscribe();

        let data = RunStartedEvent {
            repo_full_name: "acme/app".to_string(),
            branch: "main".to_string(),
            run_id: "r-1".to_string(),
        };
        bus.emit("run_started", &data);

        let msg = tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("broadcast recv failed");

        let parsed: serde_json::Value = serde_json::from_str(&msg).expect("invalid json");
        assert_eq!(parsed["event"], "run_started");
        assert_eq!(parsed["data"]["repo_full_name"], "acme/app");
        let ts = parsed["timestamp"].as_str().expect("timestamp should be string");
        chrono::DateTime::parse_from_rfc3339(ts).expect("timestamp should be RFC3339");
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_error() {
        let bus = EventBus::default();
        bus.emit("run_queued", &json!({"noop": true}));
    }

    #[test]
    fn completed_event_carries_structured_result() {
        let result = ProfileResult::failure("/logs/b.log", "Tests failed (exit code 1)");
        let event = RunCompletedEvent::from_result("acme/app", "feature-x", "r-9", &result, 1234);
        assert_eq!(event.status, ProfileStatus::Failure);
        assert!(event.error_message.as_deref().unwrap().contains("Tests failed"));
        assert_eq!(event.duration_ms, 1234);
    }
}
