//! Queue processing: publish execution, retry, and outcome feedback
//!
//! The processor pulls a bounded batch of due entries in scheduled-time
//! order and runs them against the external publish operation with bounded
//! parallelism, a stagger between item starts, and a rate limiter, so the
//! destination platform never sees a thundering herd. Every status
//! transition is a guarded claim: losing a race means another run already
//! handled the entry, and the item is silently skipped.
//!
//! Failures are classified per the error taxonomy: transient failures are
//! rescheduled with exponential backoff (2^attempts minutes) until the
//! attempt limit; authorization failures trip the channel's circuit and are
//! terminal immediately; everything terminal feeds the health monitor, the
//! A/B tracker, and the notification hook.

use chrono::{DateTime, Duration, Utc};
use governor::{DefaultDirectRateLimiter, Quota as RateQuota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use super::error::EngineError;
use crate::health::HealthMonitor;
use crate::models::{AuthStatus, Channel, ProgressPhase, QueueEntry, SourceItem};
use crate::notifications::{EngineEvent, NotificationManager};
use crate::publish::{PublishFailure, PublishSuccess, Publisher, SourceFeed};
use crate::quota::QuotaTracker;
use crate::storage::Store;

// ============================================================================
// Configuration
// ============================================================================

/// Processor tuning knobs
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Entries pulled per tick
    pub batch_size: usize,

    /// Concurrent publish attempts
    pub max_concurrent: usize,

    /// Delay between starting consecutive items in a batch
    pub stagger_secs: u64,

    /// Deadline for one publish operation (download + upload + finalize)
    pub publish_timeout_secs: u64,

    /// Deadline for metadata lookups (feed, schedule resolution)
    pub metadata_timeout_secs: u64,

    /// Attempts before an entry fails terminally
    pub max_attempts: u32,

    /// Minutes after which a silent `processing` entry is force-cleared
    pub stale_after_minutes: i64,

    /// Publish starts allowed per minute across the whole processor
    pub rate_limit_per_minute: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent: 3,
            stagger_secs: 12,
            publish_timeout_secs: 600,
            metadata_timeout_secs: 10,
            max_attempts: 3,
            stale_after_minutes: 30,
            rate_limit_per_minute: 30,
        }
    }
}

/// Backoff before attempt `attempts + 1`
fn retry_delay(attempts: u32) -> Duration {
    Duration::minutes(2_i64.pow(attempts.min(10)))
}

// ============================================================================
// Tick Report
// ============================================================================

/// What one processor tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorReport {
    pub published: usize,
    pub retried: usize,
    pub failed: usize,
    /// Entries another run claimed first, or already-terminal no-ops
    pub skipped: usize,
    pub stale_cleared: usize,
    /// Entries that hit an internal error and were left for the next tick
    pub errors: usize,
}

enum EntryOutcome {
    Published,
    Retried,
    Failed,
    Skipped,
}

// ============================================================================
// Queue Processor
// ============================================================================

/// Executes due queue entries against the external publish operation
pub struct QueueProcessor {
    store: Store,
    publisher: Arc<dyn Publisher>,
    feed: Arc<dyn SourceFeed>,
    quota: Arc<QuotaTracker>,
    health: Arc<HealthMonitor>,
    notifier: Arc<NotificationManager>,
    limiter: DefaultDirectRateLimiter,
    config: ProcessorConfig,
}

impl QueueProcessor {
    pub fn new(
        store: Store,
        publisher: Arc<dyn Publisher>,
        feed: Arc<dyn SourceFeed>,
        quota: Arc<QuotaTracker>,
        health: Arc<HealthMonitor>,
        notifier: Arc<NotificationManager>,
        config: ProcessorConfig,
    ) -> Self {
        let per_minute = NonZeroU32::new(config.rate_limit_per_minute.max(1)).expect("nonzero");
        Self {
            store,
            publisher,
            feed,
            quota,
            health,
            notifier,
            limiter: RateLimiter::direct(RateQuota::per_minute(per_minute)),
            config,
        }
    }

    /// Run one batch pass
    pub async fn tick(&self, now: DateTime<Utc>) -> anyhow::Result<ProcessorReport> {
        let mut report = ProcessorReport::default();
        report.stale_cleared = self.force_clear_stale(now).await?;

        let batch = self.store.queue.due_batch(now, self.config.batch_size)?;
        if batch.is_empty() {
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let stagger = std::time::Duration::from_secs(self.config.stagger_secs);

        let runs = batch.into_iter().enumerate().map(|(index, entry)| {
            let semaphore = semaphore.clone();
            async move {
                // Stagger item starts so consecutive uploads never hit the
                // destination back to back.
                tokio::time::sleep(stagger * index as u32).await;
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                self.limiter.until_ready().await;
                let entry_id = entry.id;
                self.process_entry(entry, now)
                    .await
                    .map_err(|e| (entry_id, e))
            }
        });

        for result in futures::future::join_all(runs).await {
            match result {
                Ok(EntryOutcome::Published) => report.published += 1,
                Ok(EntryOutcome::Retried) => report.retried += 1,
                Ok(EntryOutcome::Failed) => report.failed += 1,
                Ok(EntryOutcome::Skipped) => report.skipped += 1,
                Err((entry_id, e)) => {
                    // Isolated: one entry's breakage never aborts the batch
                    tracing::error!(entry_id = %entry_id, error = %e, "entry processing failed");
                    report.errors += 1;
                }
            }
        }

        crate::metrics::set_queue_depth(self.store.queue.stats()?.pending() as i64);
        Ok(report)
    }

    /// Fail `processing` entries that went silent past the staleness window
    pub async fn force_clear_stale(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let cutoff = now - Duration::minutes(self.config.stale_after_minutes);
        let mut cleared = 0;
        for entry in self.store.queue.stale_processing(cutoff)? {
            let moved = self.store.queue.complete_failure(
                entry.id,
                entry.attempts + 1,
                "stale processing entry force-cleared",
                entry.phase,
                now,
            )?;
            if moved {
                self.health.record_failure(
                    entry.channel_id,
                    "stale processing entry",
                    entry.phase,
                    now,
                )?;
                self.record_ab_outcome(&entry, false)?;
                self.notifier
                    .notify(EngineEvent::UploadFailed {
                        entry_id: entry.id,
                        schedule_id: entry.schedule_id,
                        channel_id: entry.channel_id,
                        error: "stale processing entry force-cleared".into(),
                        at: now,
                    })
                    .await;
                tracing::warn!(entry_id = %entry.id, "stale entry force-cleared");
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn process_entry(
        &self,
        entry: QueueEntry,
        now: DateTime<Utc>,
    ) -> anyhow::Result<EntryOutcome> {
        if !self.store.queue.claim(entry.id, now)? {
            return Ok(EntryOutcome::Skipped);
        }

        let Some(channel) = self.store.channels.get(entry.channel_id)? else {
            self.store.queue.complete_failure(
                entry.id,
                entry.attempts + 1,
                "destination channel no longer exists",
                None,
                now,
            )?;
            return Ok(EntryOutcome::Failed);
        };

        let item = match self.resolve_item(&entry).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                self.store.queue.complete_failure(
                    entry.id,
                    entry.attempts + 1,
                    "source item no longer importable",
                    None,
                    now,
                )?;
                self.record_ab_outcome(&entry, false)?;
                return Ok(EntryOutcome::Failed);
            }
            Err(e) => {
                // Feed unreachable: treated like any transient failure
                return self
                    .handle_failure(&entry, &channel, PublishFailure::Network(e.to_string()), None, now)
                    .await;
            }
        };

        // Progress events land on the entry row as they arrive; the last
        // phase seen is what failure records blame.
        let (tx, mut rx) = mpsc::channel::<crate::publish::PublishProgress>(32);
        let queue = self.store.queue.clone();
        let entry_id = entry.id;
        let last_phase: Arc<Mutex<Option<ProgressPhase>>> =
            Arc::new(Mutex::new(Some(ProgressPhase::Downloading)));
        let phase_sink = last_phase.clone();
        let progress_task = tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                *phase_sink.lock().unwrap() = Some(progress.phase);
                if let Err(e) = queue.set_progress(entry_id, progress.phase, progress.percent) {
                    tracing::debug!(entry_id = %entry_id, error = %e, "progress update dropped");
                }
            }
        });

        let deadline = std::time::Duration::from_secs(self.config.publish_timeout_secs);
        let result = match tokio::time::timeout(
            deadline,
            self.publisher.publish(&item, &channel, tx),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PublishFailure::Timeout),
        };
        let _ = progress_task.await;
        let phase = *last_phase.lock().unwrap();

        match result {
            Ok(success) => self.handle_success(&entry, &channel, success, now).await,
            Err(failure) => self.handle_failure(&entry, &channel, failure, phase, now).await,
        }
    }

    /// Look the entry's source item up through the feed, with a deadline
    async fn resolve_item(&self, entry: &QueueEntry) -> anyhow::Result<Option<SourceItem>> {
        let Some(schedule) = self.store.schedules.get(entry.schedule_id)? else {
            return Ok(None);
        };
        let deadline = std::time::Duration::from_secs(self.config.metadata_timeout_secs);
        let items = tokio::time::timeout(
            deadline,
            self.feed.importable_items(schedule.source_account_id),
        )
        .await
        .map_err(|_| anyhow::anyhow!("source feed timed out"))??;
        Ok(items.into_iter().find(|i| i.id == entry.source_item_id))
    }

    async fn handle_success(
        &self,
        entry: &QueueEntry,
        channel: &Channel,
        success: PublishSuccess,
        now: DateTime<Utc>,
    ) -> anyhow::Result<EntryOutcome> {
        let applied = self
            .apply_success(entry.id, success.destination_url.as_str(), now)
            .await?;
        if applied {
            tracing::info!(
                entry_id = %entry.id,
                channel = %channel.display_name,
                url = %success.destination_url,
                "publish succeeded"
            );
            Ok(EntryOutcome::Published)
        } else {
            Ok(EntryOutcome::Skipped)
        }
    }

    /// Completion handler for a successful publish
    ///
    /// Idempotent: the guarded `processing` → `published` transition decides
    /// whether counters move. A second invocation with the same terminal
    /// result changes nothing and returns `false`.
    pub async fn apply_success(
        &self,
        entry_id: Uuid,
        destination_url: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let entry = self
            .store
            .queue
            .get(entry_id)?
            .ok_or_else(|| EngineError::entry_not_found(entry_id))?;
        if !self.store.queue.complete_success(entry_id, destination_url, now)? {
            return Ok(false);
        }
        if let Some(channel) = self.store.channels.get(entry.channel_id)? {
            self.quota.record_upload(&channel, now)?;
        }
        self.health.record_success(entry.channel_id, now)?;
        self.record_ab_outcome(&entry, true)?;
        crate::metrics::record_outcome("published");
        self.notifier
            .notify(EngineEvent::UploadSucceeded {
                entry_id,
                schedule_id: entry.schedule_id,
                channel_id: entry.channel_id,
                destination_url: destination_url.to_string(),
                at: now,
            })
            .await;
        Ok(true)
    }

    async fn handle_failure(
        &self,
        entry: &QueueEntry,
        channel: &Channel,
        failure: PublishFailure,
        phase: Option<ProgressPhase>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<EntryOutcome> {
        let attempts = entry.attempts + 1;
        let message = failure.to_string();

        if failure.is_authorization() {
            // Not retried automatically; the operator must re-authorize.
            let status = match failure {
                PublishFailure::TokenRevoked => AuthStatus::TokenRevoked,
                PublishFailure::ApiNotEnabled => AuthStatus::ApiNotEnabled,
                _ => AuthStatus::Failed,
            };
            self.store.channels.set_auth_status(channel.id, status)?;
            self.health.trip(channel.id, message.as_str(), now)?;
            let moved = self
                .store
                .queue
                .complete_failure(entry.id, attempts, &message, phase, now)?;
            if moved {
                self.record_ab_outcome(entry, false)?;
                crate::metrics::record_outcome("failed");
                self.notifier
                    .notify(EngineEvent::UploadFailed {
                        entry_id: entry.id,
                        schedule_id: entry.schedule_id,
                        channel_id: entry.channel_id,
                        error: message.clone(),
                        at: now,
                    })
                    .await;
            }
            tracing::warn!(
                entry_id = %entry.id,
                channel = %channel.display_name,
                error = %message,
                "authorization failure, circuit tripped"
            );
            return Ok(EntryOutcome::Failed);
        }

        self.health
            .record_failure(channel.id, message.as_str(), phase, now)?;

        if failure.is_transient() && attempts < self.config.max_attempts {
            let next_attempt_at = now + retry_delay(attempts);
            self.store.queue.reschedule_retry(
                entry.id,
                attempts,
                next_attempt_at,
                &message,
                phase,
                now,
            )?;
            crate::metrics::record_outcome("retried");
            tracing::info!(
                entry_id = %entry.id,
                attempts = attempts,
                next_attempt_at = %next_attempt_at,
                "publish failed, rescheduled with backoff"
            );
            return Ok(EntryOutcome::Retried);
        }

        let moved = self
            .store
            .queue
            .complete_failure(entry.id, attempts, &message, phase, now)?;
        if moved {
            self.record_ab_outcome(entry, false)?;
            crate::metrics::record_outcome("failed");
            self.notifier
                .notify(EngineEvent::UploadFailed {
                    entry_id: entry.id,
                    schedule_id: entry.schedule_id,
                    channel_id: entry.channel_id,
                    error: message.clone(),
                    at: now,
                })
                .await;
        }
        tracing::warn!(
            entry_id = %entry.id,
            attempts = attempts,
            error = %message,
            "publish failed terminally"
        );
        Ok(EntryOutcome::Failed)
    }

    /// Credit a terminal outcome to the entry's experiment arm, if any
    fn record_ab_outcome(&self, entry: &QueueEntry, success: bool) -> anyhow::Result<()> {
        let Some(arm) = entry.experiment_arm else {
            return Ok(());
        };
        let Some(mut test) = self.store.ab_tests.for_schedule(entry.schedule_id)? else {
            return Ok(());
        };
        if test.status.is_terminal() {
            return Ok(());
        }
        test.record_outcome(arm, success)?;
        self.store.ab_tests.update(&test)?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{CircuitState, HealthConfig};
    use crate::models::{Destination, Schedule};
    use crate::notifications::BufferChannel;
    use crate::publish::{PlanInfo, ScriptedPublisher, StaticSourceFeed, StaticSubscriptions};

    struct Fixture {
        store: Store,
        feed: Arc<StaticSourceFeed>,
        subs: Arc<StaticSubscriptions>,
        events: Arc<BufferChannel>,
        health: Arc<HealthMonitor>,
        quota: Arc<QuotaTracker>,
    }

    fn fixture() -> Fixture {
        let store = Store::memory();
        let feed = Arc::new(StaticSourceFeed::default());
        let subs = Arc::new(StaticSubscriptions::new());
        let events = Arc::new(BufferChannel::new());
        let quota = Arc::new(QuotaTracker::new(store.quota.clone(), subs.clone()));
        let health = Arc::new(HealthMonitor::new(
            store.health.clone(),
            HealthConfig::default(),
        ));
        Fixture {
            store,
            feed,
            subs,
            events,
            health,
            quota,
        }
    }

    impl Fixture {
        fn processor(&self, publisher: Arc<dyn Publisher>) -> QueueProcessor {
            let mut notifier = NotificationManager::new();
            notifier.add_channel(self.events.clone());
            QueueProcessor::new(
                self.store.clone(),
                publisher,
                self.feed.clone(),
                self.quota.clone(),
                self.health.clone(),
                Arc::new(notifier),
                ProcessorConfig {
                    stagger_secs: 0,
                    publish_timeout_secs: 5,
                    metadata_timeout_secs: 2,
                    rate_limit_per_minute: 10_000,
                    ..ProcessorConfig::default()
                },
            )
        }

        /// Channel + schedule + one due queue entry for a fresh item
        fn due_entry(&self, now: DateTime<Utc>) -> (Channel, QueueEntry) {
            let account = Uuid::new_v4();
            self.subs.set(account, PlanInfo::limited(100));

            let mut channel = Channel::new(account, "dest");
            channel.auth_status = AuthStatus::Connected;
            self.store.channels.insert(&channel).unwrap();

            let schedule = Schedule::new(account, Destination::Channel(channel.id), chrono_tz::UTC);
            self.store.schedules.insert(&schedule).unwrap();

            let item = StaticSourceFeed::item(account, &Uuid::new_v4().to_string());
            let entry = QueueEntry::new(
                &item.id,
                schedule.id,
                channel.id,
                now - Duration::minutes(1),
            );
            self.feed.push(item);
            self.store.queue.enqueue(&entry).unwrap();
            (channel, entry)
        }
    }

    #[tokio::test]
    async fn test_success_path_updates_everything() {
        let f = fixture();
        let now = Utc::now();
        let (channel, entry) = f.due_entry(now);
        let processor = f.processor(Arc::new(ScriptedPublisher::always_ok()));

        let report = processor.tick(now).await.unwrap();
        assert_eq!(report.published, 1);

        let loaded = f.store.queue.get(entry.id).unwrap().unwrap();
        assert_eq!(loaded.status, crate::models::QueueStatus::Published);
        assert!(loaded.destination_url.is_some());
        assert_eq!(loaded.progress_percent, 100);

        // Quota consumed, health credited, event emitted
        let date = channel.local_date(now);
        assert_eq!(f.store.quota.usage(channel.id, date).unwrap(), 1);
        let record = f.health.record(channel.id).unwrap();
        assert_eq!(record.successes, 1);
        assert_eq!(record.consecutive_failures, 0);
        assert!(f.events.kinds().contains(&"upload_succeeded"));
    }

    #[tokio::test]
    async fn test_transient_failure_backs_off_then_fails_terminally() {
        let f = fixture();
        let now = Utc::now();
        let (channel, entry) = f.due_entry(now);
        let processor = f.processor(Arc::new(ScriptedPublisher::always_failing(
            PublishFailure::RateLimit,
        )));

        // Attempt 1: rescheduled 2 minutes out
        let report = processor.tick(now).await.unwrap();
        assert_eq!(report.retried, 1);
        let loaded = f.store.queue.get(entry.id).unwrap().unwrap();
        assert_eq!(loaded.status, crate::models::QueueStatus::Queued);
        assert_eq!(loaded.attempts, 1);
        let next = loaded.next_attempt_at.unwrap();
        assert_eq!(next, now + Duration::minutes(2));

        // Not due before the backoff elapses
        let report = processor.tick(now + Duration::minutes(1)).await.unwrap();
        assert_eq!(report.retried + report.failed + report.published, 0);

        // Attempt 2: backoff doubles
        let t2 = now + Duration::minutes(3);
        let report = processor.tick(t2).await.unwrap();
        assert_eq!(report.retried, 1);
        let loaded = f.store.queue.get(entry.id).unwrap().unwrap();
        assert_eq!(loaded.attempts, 2);
        assert_eq!(loaded.next_attempt_at.unwrap(), t2 + Duration::minutes(4));

        // Attempt 3 exhausts the limit
        let t3 = t2 + Duration::minutes(5);
        let report = processor.tick(t3).await.unwrap();
        assert_eq!(report.failed, 1);
        let loaded = f.store.queue.get(entry.id).unwrap().unwrap();
        assert_eq!(loaded.status, crate::models::QueueStatus::Failed);
        assert_eq!(loaded.attempts, 3);

        // Health saw every failure; the terminal one raised the event
        let record = f.health.record(channel.id).unwrap();
        assert_eq!(record.failures, 3);
        assert_eq!(record.consecutive_failures, 3);
        assert_eq!(
            f.events
                .kinds()
                .iter()
                .filter(|k| **k == "upload_failed")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_authorization_failure_trips_circuit_no_retry() {
        let f = fixture();
        let now = Utc::now();
        let (channel, entry) = f.due_entry(now);
        let processor = f.processor(Arc::new(ScriptedPublisher::always_failing(
            PublishFailure::TokenRevoked,
        )));

        let report = processor.tick(now).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 0);

        let loaded = f.store.queue.get(entry.id).unwrap().unwrap();
        assert_eq!(loaded.status, crate::models::QueueStatus::Failed);
        assert_eq!(loaded.attempts, 1);

        let channel = f.store.channels.get(channel.id).unwrap().unwrap();
        assert_eq!(channel.auth_status, AuthStatus::TokenRevoked);
        let record = f.health.record(channel.id).unwrap();
        assert_eq!(record.circuit_state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_rejected_content_is_terminal_without_retry() {
        let f = fixture();
        let now = Utc::now();
        let (_, entry) = f.due_entry(now);
        let processor = f.processor(Arc::new(ScriptedPublisher::always_failing(
            PublishFailure::Rejected("unsupported format".into()),
        )));

        let report = processor.tick(now).await.unwrap();
        assert_eq!(report.failed, 1);
        let loaded = f.store.queue.get(entry.id).unwrap().unwrap();
        assert_eq!(loaded.status, crate::models::QueueStatus::Failed);
    }

    #[tokio::test]
    async fn test_completion_handler_is_idempotent() {
        let f = fixture();
        let now = Utc::now();
        let (channel, entry) = f.due_entry(now);
        let processor = f.processor(Arc::new(ScriptedPublisher::always_ok()));

        f.store.queue.claim(entry.id, now).unwrap();
        let first = processor
            .apply_success(entry.id, "https://videos.example/1", now)
            .await
            .unwrap();
        assert!(first);

        let date = channel.local_date(now);
        let usage_after_first = f.store.quota.usage(channel.id, date).unwrap();
        let successes_after_first = f.health.record(channel.id).unwrap().successes;

        // Second invocation with the same terminal result is a no-op
        let second = processor
            .apply_success(entry.id, "https://videos.example/1", now)
            .await
            .unwrap();
        assert!(!second);
        assert_eq!(f.store.quota.usage(channel.id, date).unwrap(), usage_after_first);
        assert_eq!(
            f.health.record(channel.id).unwrap().successes,
            successes_after_first
        );
        assert_eq!(
            f.events
                .kinds()
                .iter()
                .filter(|k| **k == "upload_succeeded")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_stale_processing_force_cleared() {
        let f = fixture();
        let t0 = Utc::now() - Duration::minutes(45);
        let (channel, entry) = f.due_entry(t0);
        let processor = f.processor(Arc::new(ScriptedPublisher::always_ok()));

        // Claimed 45 minutes ago, never resolved
        f.store.queue.claim(entry.id, t0).unwrap();

        let now = Utc::now();
        let report = processor.tick(now).await.unwrap();
        assert_eq!(report.stale_cleared, 1);

        let loaded = f.store.queue.get(entry.id).unwrap().unwrap();
        assert_eq!(loaded.status, crate::models::QueueStatus::Failed);
        assert!(loaded.last_error.unwrap().contains("stale"));
        assert_eq!(f.health.record(channel.id).unwrap().failures, 1);
    }

    #[tokio::test]
    async fn test_missing_source_item_fails_terminally() {
        let f = fixture();
        let now = Utc::now();
        let account = Uuid::new_v4();
        f.subs.set(account, PlanInfo::limited(100));

        let mut channel = Channel::new(account, "dest");
        channel.auth_status = AuthStatus::Connected;
        f.store.channels.insert(&channel).unwrap();
        let schedule = Schedule::new(account, Destination::Channel(channel.id), chrono_tz::UTC);
        f.store.schedules.insert(&schedule).unwrap();

        // Entry references an item the feed no longer returns
        let entry = QueueEntry::new("vanished", schedule.id, channel.id, now - Duration::minutes(1));
        f.store.queue.enqueue(&entry).unwrap();

        let processor = f.processor(Arc::new(ScriptedPublisher::always_ok()));
        let report = processor.tick(now).await.unwrap();
        assert_eq!(report.failed, 1);
        let loaded = f.store.queue.get(entry.id).unwrap().unwrap();
        assert!(loaded.last_error.unwrap().contains("no longer importable"));
    }

    #[test]
    fn test_retry_delay_doubles() {
        assert_eq!(retry_delay(1), Duration::minutes(2));
        assert_eq!(retry_delay(2), Duration::minutes(4));
        assert_eq!(retry_delay(3), Duration::minutes(8));
        // Capped exponent keeps the delay finite
        assert_eq!(retry_delay(40), Duration::minutes(1024));
    }
}
