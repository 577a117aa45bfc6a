//! Engine event notifications
//!
//! The engine reports outcomes ("upload succeeded", "upload failed",
//! "schedule completed", "no channel available") as [`EngineEvent`] values
//! routed through every registered [`NotificationChannel`]. Delivery is
//! fire-and-forget with a bounded retry; a failing channel never blocks the
//! drivers or other channels.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::utils::retry::{with_retry, RetryConfig};

// ============================================================================
// Severity
// ============================================================================

/// Severity attached to an outgoing event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Engine Events
// ============================================================================

/// Events the engine emits at its notification boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum EngineEvent {
    /// A queue entry reached `published`
    UploadSucceeded {
        entry_id: Uuid,
        schedule_id: Uuid,
        channel_id: Uuid,
        destination_url: String,
        at: DateTime<Utc>,
    },

    /// A queue entry exhausted its retries or hit an authorization failure
    UploadFailed {
        entry_id: Uuid,
        schedule_id: Uuid,
        channel_id: Uuid,
        error: String,
        at: DateTime<Utc>,
    },

    /// A due slot found no eligible destination; retried next slot
    NoChannelAvailable {
        schedule_id: Uuid,
        slot: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// A schedule has no importable items left to enqueue
    ScheduleCompleted {
        schedule_id: Uuid,
        at: DateTime<Utc>,
    },

    /// A schedule was paused by the engine (subscription expiry)
    SchedulePaused {
        schedule_id: Uuid,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UploadSucceeded { .. } => "upload_succeeded",
            Self::UploadFailed { .. } => "upload_failed",
            Self::NoChannelAvailable { .. } => "no_channel_available",
            Self::ScheduleCompleted { .. } => "schedule_completed",
            Self::SchedulePaused { .. } => "schedule_paused",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::UploadSucceeded { .. } | Self::ScheduleCompleted { .. } => Severity::Info,
            Self::NoChannelAvailable { .. } | Self::SchedulePaused { .. } => Severity::Warning,
            Self::UploadFailed { .. } => Severity::Critical,
        }
    }

    /// One-line human summary for logs and webhook payloads
    pub fn summary(&self) -> String {
        match self {
            Self::UploadSucceeded {
                channel_id,
                destination_url,
                ..
            } => format!("upload to channel {channel_id} published at {destination_url}"),
            Self::UploadFailed {
                channel_id, error, ..
            } => format!("upload to channel {channel_id} failed: {error}"),
            Self::NoChannelAvailable { schedule_id, .. } => {
                format!("no eligible channel for schedule {schedule_id}")
            }
            Self::ScheduleCompleted { schedule_id, .. } => {
                format!("schedule {schedule_id} has no items left to publish")
            }
            Self::SchedulePaused {
                schedule_id,
                reason,
                ..
            } => format!("schedule {schedule_id} paused: {reason}"),
        }
    }
}

// ============================================================================
// Channels
// ============================================================================

/// Delivery target for engine events
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, event: &EngineEvent) -> anyhow::Result<()>;
}

/// POSTs events as JSON to a configured endpoint
pub struct WebhookChannel {
    endpoint: url::Url,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(endpoint: url::Url, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { endpoint, client })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, event: &EngineEvent) -> anyhow::Result<()> {
        let payload = serde_json::json!({
            "kind": event.kind(),
            "severity": event.severity().as_str(),
            "summary": event.summary(),
            "event": event,
        });
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&payload)
            .send()
            .await?;
        response.error_for_status()?;
        Ok(())
    }
}

/// Collects events in memory; used by tests
#[derive(Default)]
pub struct BufferChannel {
    events: Mutex<Vec<EngineEvent>>,
}

impl BufferChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.kind()).collect()
    }
}

#[async_trait]
impl NotificationChannel for BufferChannel {
    fn name(&self) -> &str {
        "buffer"
    }

    async fn deliver(&self, event: &EngineEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ============================================================================
// Notification Manager
// ============================================================================

/// Routes events to every registered channel
pub struct NotificationManager {
    channels: Vec<Arc<dyn NotificationChannel>>,
    retry: RetryConfig,
}

impl NotificationManager {
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            retry: RetryConfig::with_delays(2, 500, 5_000),
        }
    }

    pub fn add_channel(&mut self, channel: Arc<dyn NotificationChannel>) {
        self.channels.push(channel);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Deliver an event to every channel; failures are logged, not raised
    pub async fn notify(&self, event: EngineEvent) {
        tracing::info!(
            kind = event.kind(),
            severity = %event.severity(),
            "{}",
            event.summary()
        );
        for channel in &self.channels {
            let result = with_retry(&self.retry, || channel.deliver(&event)).await;
            if let Err(e) = result {
                tracing::warn!(
                    channel = channel.name(),
                    kind = event.kind(),
                    error = %e,
                    "notification delivery failed"
                );
            }
        }
    }
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> EngineEvent {
        EngineEvent::UploadFailed {
            entry_id: Uuid::new_v4(),
            schedule_id: Uuid::new_v4(),
            channel_id: Uuid::new_v4(),
            error: "rate limited".into(),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_event_severity_mapping() {
        assert_eq!(sample_event().severity(), Severity::Critical);
        let ok = EngineEvent::UploadSucceeded {
            entry_id: Uuid::new_v4(),
            schedule_id: Uuid::new_v4(),
            channel_id: Uuid::new_v4(),
            destination_url: "https://x".into(),
            at: Utc::now(),
        };
        assert_eq!(ok.severity(), Severity::Info);
    }

    #[tokio::test]
    async fn test_manager_delivers_to_all_channels() {
        let first = Arc::new(BufferChannel::new());
        let second = Arc::new(BufferChannel::new());
        let mut manager = NotificationManager::new();
        manager.add_channel(first.clone());
        manager.add_channel(second.clone());

        manager.notify(sample_event()).await;
        assert_eq!(first.events().len(), 1);
        assert_eq!(second.events().len(), 1);
        assert_eq!(first.kinds(), vec!["upload_failed"]);
    }

    #[tokio::test]
    async fn test_failing_channel_does_not_block_others() {
        struct FailingChannel;

        #[async_trait]
        impl NotificationChannel for FailingChannel {
            fn name(&self) -> &str {
                "failing"
            }
            async fn deliver(&self, _event: &EngineEvent) -> anyhow::Result<()> {
                anyhow::bail!("endpoint down")
            }
        }

        let buffer = Arc::new(BufferChannel::new());
        let mut manager = NotificationManager::new();
        manager.retry = RetryConfig::with_delays(0, 1, 1);
        manager.add_channel(Arc::new(FailingChannel));
        manager.add_channel(buffer.clone());

        manager.notify(sample_event()).await;
        assert_eq!(buffer.events().len(), 1);
    }

    #[test]
    fn test_event_json_shape() {
        let event = sample_event();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "upload_failed");
        assert!(json["error"].is_string());
    }
}
