//! Boundary traits for the subsystems the engine collaborates with
//!
//! The engine never talks to the destination platform, the scraper, or the
//! billing system directly. It sees them through the traits defined here:
//!
//! - [`Publisher`] - executes one phased upload against the destination
//! - [`SourceFeed`] - read-only list of importable items per source account
//! - [`SubscriptionLookup`] - daily ceiling and active/expired state
//!
//! Static in-memory implementations used by tests and the CLI dry-run mode
//! live at the bottom of this module.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::{Channel, ProgressPhase, SourceItem};

// ============================================================================
// Typed Publish Failure
// ============================================================================

/// Failure reported by the publish operation
///
/// The classification drives retry behavior: transient failures are retried
/// with backoff, authorization failures open the circuit immediately and are
/// never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum PublishFailure {
    /// The operation exceeded its deadline
    #[error("publish operation timed out")]
    Timeout,

    /// The destination platform applied rate limiting
    #[error("destination rate limit hit")]
    RateLimit,

    /// Network-level failure reaching the destination
    #[error("network error: {0}")]
    Network(String),

    /// The channel's access token was revoked
    #[error("access token revoked")]
    TokenRevoked,

    /// The destination API is not enabled for this account
    #[error("destination API not enabled")]
    ApiNotEnabled,

    /// The destination rejected the upload for exceeding its own quota
    #[error("destination upload quota exceeded")]
    QuotaExceeded,

    /// The destination rejected the content itself
    #[error("upload rejected: {0}")]
    Rejected(String),
}

impl PublishFailure {
    /// Transient failures are retried with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimit | Self::Network(_) | Self::QuotaExceeded
        )
    }

    /// Authorization failures require operator re-authorization
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::TokenRevoked | Self::ApiNotEnabled)
    }
}

// ============================================================================
// Progress & Success
// ============================================================================

/// Progress event emitted while a publish operation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishProgress {
    pub phase: ProgressPhase,

    /// Completion of the current phase, 0-100
    pub percent: u8,
}

/// Successful publish result
#[derive(Debug, Clone)]
pub struct PublishSuccess {
    /// Where the published video lives on the destination platform
    pub destination_url: url::Url,
}

/// Sender half for phased progress reporting
pub type ProgressSink = mpsc::Sender<PublishProgress>;

// ============================================================================
// Boundary Traits
// ============================================================================

/// Executes one upload against the destination platform
///
/// Implementations report phased progress through the sink (downloading →
/// uploading → finalizing, each 0-100) and finish with a destination URL or a
/// typed failure.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        item: &SourceItem,
        channel: &Channel,
        progress: ProgressSink,
    ) -> Result<PublishSuccess, PublishFailure>;
}

/// Read-only feed of importable items from the scraping subsystem
#[async_trait]
pub trait SourceFeed: Send + Sync {
    /// Items discovered for a source account, oldest first
    async fn importable_items(&self, source_account_id: Uuid) -> anyhow::Result<Vec<SourceItem>>;
}

/// Plan details from the billing subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanInfo {
    /// Daily upload ceiling; `None` means unlimited
    pub daily_upload_ceiling: Option<u32>,

    /// Whether the subscription is currently active
    pub active: bool,
}

impl PlanInfo {
    pub fn unlimited() -> Self {
        Self {
            daily_upload_ceiling: None,
            active: true,
        }
    }

    pub fn limited(ceiling: u32) -> Self {
        Self {
            daily_upload_ceiling: Some(ceiling),
            active: true,
        }
    }

    pub fn expired() -> Self {
        Self {
            daily_upload_ceiling: Some(0),
            active: false,
        }
    }
}

/// Subscription/plan lookup for a channel owner
#[async_trait]
pub trait SubscriptionLookup: Send + Sync {
    /// `None` when the account has no subscription at all
    async fn plan_for(&self, account_id: Uuid) -> anyhow::Result<Option<PlanInfo>>;
}

// ============================================================================
// Static Implementations (tests, dry runs)
// ============================================================================

/// In-memory source feed with a fixed item list
#[derive(Debug, Default)]
pub struct StaticSourceFeed {
    items: Mutex<Vec<SourceItem>>,
}

impl StaticSourceFeed {
    pub fn new(items: Vec<SourceItem>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }

    pub fn push(&self, item: SourceItem) {
        self.items.lock().unwrap().push(item);
    }

    /// Convenience constructor for a fresh unpublished item
    pub fn item(source_account_id: Uuid, id: &str) -> SourceItem {
        SourceItem {
            id: id.to_string(),
            source_account_id,
            download_ref: format!("ref://{id}"),
            title: format!("clip {id}"),
            already_published: false,
            discovered_at: Utc::now(),
        }
    }
}

#[async_trait]
impl SourceFeed for StaticSourceFeed {
    async fn importable_items(&self, source_account_id: Uuid) -> anyhow::Result<Vec<SourceItem>> {
        let mut items: Vec<SourceItem> = self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.source_account_id == source_account_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.discovered_at);
        Ok(items)
    }
}

/// In-memory subscription table
#[derive(Debug, Default)]
pub struct StaticSubscriptions {
    plans: Mutex<HashMap<Uuid, PlanInfo>>,
}

impl StaticSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, account_id: Uuid, plan: PlanInfo) {
        self.plans.lock().unwrap().insert(account_id, plan);
    }
}

#[async_trait]
impl SubscriptionLookup for StaticSubscriptions {
    async fn plan_for(&self, account_id: Uuid) -> anyhow::Result<Option<PlanInfo>> {
        Ok(self.plans.lock().unwrap().get(&account_id).cloned())
    }
}

/// Publisher that replays a scripted sequence of outcomes
///
/// Each call pops the next outcome; when the script is exhausted every call
/// succeeds. Used by the scenario tests to simulate failing channels.
pub struct ScriptedPublisher {
    script: Mutex<Vec<Result<PublishSuccess, PublishFailure>>>,
    repeat_last: bool,
    calls: std::sync::atomic::AtomicU64,
}

impl ScriptedPublisher {
    pub fn new(script: Vec<Result<PublishSuccess, PublishFailure>>) -> Self {
        // Stored reversed so pop() yields the scripted order
        let mut script = script;
        script.reverse();
        Self {
            script: Mutex::new(script),
            repeat_last: false,
            calls: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Publisher that always succeeds
    pub fn always_ok() -> Self {
        Self::new(Vec::new())
    }

    /// Publisher that always returns the given failure
    pub fn always_failing(failure: PublishFailure) -> Self {
        let mut publisher = Self::new(vec![Err(failure)]);
        publisher.repeat_last = true;
        publisher
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn success_for(item: &SourceItem) -> PublishSuccess {
        PublishSuccess {
            destination_url: url::Url::parse(&format!("https://videos.example/watch/{}", item.id))
                .expect("static url"),
        }
    }
}

#[async_trait]
impl Publisher for ScriptedPublisher {
    async fn publish(
        &self,
        item: &SourceItem,
        _channel: &Channel,
        progress: ProgressSink,
    ) -> Result<PublishSuccess, PublishFailure> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        for phase in [
            ProgressPhase::Downloading,
            ProgressPhase::Uploading,
            ProgressPhase::Finalizing,
        ] {
            let _ = progress.send(PublishProgress { phase, percent: 100 }).await;
        }

        let mut script = self.script.lock().unwrap();
        match script.pop() {
            Some(outcome) => {
                if self.repeat_last && script.is_empty() {
                    script.push(outcome.clone());
                }
                outcome.map(|_| Self::success_for(item))
            }
            // Script exhausted: every further call succeeds
            None => Ok(Self::success_for(item)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_classification() {
        assert!(PublishFailure::Timeout.is_transient());
        assert!(PublishFailure::RateLimit.is_transient());
        assert!(PublishFailure::Network("reset".into()).is_transient());
        assert!(!PublishFailure::TokenRevoked.is_transient());

        assert!(PublishFailure::TokenRevoked.is_authorization());
        assert!(PublishFailure::ApiNotEnabled.is_authorization());
        assert!(!PublishFailure::Timeout.is_authorization());
        assert!(!PublishFailure::Rejected("bad".into()).is_authorization());
    }

    #[tokio::test]
    async fn test_static_feed_filters_by_account() {
        let account = Uuid::new_v4();
        let other = Uuid::new_v4();
        let feed = StaticSourceFeed::new(vec![
            StaticSourceFeed::item(account, "a"),
            StaticSourceFeed::item(other, "b"),
        ]);

        let items = feed.importable_items(account).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "a");
    }

    #[tokio::test]
    async fn test_scripted_publisher_replays_then_succeeds() {
        let publisher = ScriptedPublisher::new(vec![
            Err(PublishFailure::Timeout),
            Err(PublishFailure::RateLimit),
        ]);
        let account = Uuid::new_v4();
        let channel = Channel::new(account, "test");
        let item = StaticSourceFeed::item(account, "clip");
        let (tx, mut rx) = mpsc::channel(16);

        let first = publisher.publish(&item, &channel, tx.clone()).await;
        assert_eq!(first.unwrap_err(), PublishFailure::Timeout);

        let second = publisher.publish(&item, &channel, tx.clone()).await;
        assert_eq!(second.unwrap_err(), PublishFailure::RateLimit);

        let third = publisher.publish(&item, &channel, tx).await;
        assert!(third.is_ok());
        assert_eq!(publisher.calls(), 3);

        // Phases reported in order
        let mut phases = Vec::new();
        while let Ok(p) = rx.try_recv() {
            phases.push(p.phase);
        }
        assert!(phases.contains(&ProgressPhase::Finalizing));
    }

    #[tokio::test]
    async fn test_always_failing_repeats() {
        let publisher = ScriptedPublisher::always_failing(PublishFailure::TokenRevoked);
        let account = Uuid::new_v4();
        let channel = Channel::new(account, "test");
        let item = StaticSourceFeed::item(account, "clip");

        for _ in 0..3 {
            let (tx, _rx) = mpsc::channel(16);
            let result = publisher.publish(&item, &channel, tx).await;
            assert_eq!(result.unwrap_err(), PublishFailure::TokenRevoked);
        }
    }
}
