//! Due-slot resolution and queue entry creation
//!
//! On each tick the orchestrator walks every active schedule, finds publish
//! times that have come due inside the lookback window, and turns each due
//! slot into one queue entry: destination resolved through the rotation
//! selector, source item taken from the feed, A/B arm assigned when the
//! schedule runs an experiment. Configuration problems (expired subscription,
//! no eligible channel, nothing left to post) are events, not errors; the
//! slot is skipped and the next natural slot tries again.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::error::{EngineError, EngineResult};
use crate::abtest::TestStatus;
use crate::models::{QueueEntry, QueueStatus, Schedule, ScheduleStatus, SourceItem};
use crate::notifications::{EngineEvent, NotificationManager};
use crate::publish::{SourceFeed, SubscriptionLookup};
use crate::rotation::{RotationSelector, Selection};
use crate::storage::Store;

// ============================================================================
// Configuration
// ============================================================================

/// Orchestrator tuning knobs
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long after its nominal time a slot may still fire
    pub slot_lookback_minutes: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            slot_lookback_minutes: 60,
        }
    }
}

// ============================================================================
// Tick Report
// ============================================================================

/// What one orchestrator tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorReport {
    /// Queue entries created
    pub enqueued: usize,

    /// Due slots skipped because no channel was eligible
    pub no_channel: usize,

    /// Schedules auto-paused on subscription expiry
    pub paused: usize,

    /// Schedules with nothing left to post
    pub drained: usize,
}

// ============================================================================
// Schedule Orchestrator
// ============================================================================

/// Turns due schedule slots into queue entries
pub struct ScheduleOrchestrator {
    store: Store,
    selector: Arc<RotationSelector>,
    feed: Arc<dyn SourceFeed>,
    subscriptions: Arc<dyn SubscriptionLookup>,
    notifier: Arc<NotificationManager>,
    config: OrchestratorConfig,
}

impl ScheduleOrchestrator {
    pub fn new(
        store: Store,
        selector: Arc<RotationSelector>,
        feed: Arc<dyn SourceFeed>,
        subscriptions: Arc<dyn SubscriptionLookup>,
        notifier: Arc<NotificationManager>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            selector,
            feed,
            subscriptions,
            notifier,
            config,
        }
    }

    /// Run one pass over every active schedule
    ///
    /// Each schedule is isolated: a failure in one is logged and the pass
    /// continues with the rest.
    pub async fn tick(&self, now: DateTime<Utc>) -> anyhow::Result<OrchestratorReport> {
        let mut report = OrchestratorReport::default();
        for schedule in self.store.schedules.list_active()? {
            if let Err(e) = self.run_schedule(&schedule, now, &mut report).await {
                tracing::warn!(
                    schedule_id = %schedule.id,
                    error = %e,
                    "schedule pass failed, continuing with next"
                );
            }
        }
        Ok(report)
    }

    async fn run_schedule(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
        report: &mut OrchestratorReport,
    ) -> anyhow::Result<()> {
        // Expired subscriptions pause the schedule rather than erroring
        let plan = self
            .subscriptions
            .plan_for(schedule.source_account_id)
            .await?;
        if !plan.map(|p| p.active).unwrap_or(false) {
            self.store
                .schedules
                .set_status(schedule.id, ScheduleStatus::Paused)?;
            self.notifier
                .notify(EngineEvent::SchedulePaused {
                    schedule_id: schedule.id,
                    reason: "subscription expired".into(),
                    at: now,
                })
                .await;
            report.paused += 1;
            return Ok(());
        }

        for slot in self.due_slots(schedule, now) {
            // A slot fires once: an existing entry means an earlier tick
            // already handled it.
            if self.store.queue.entry_for_slot(schedule.id, slot)?.is_some() {
                continue;
            }

            let channel = match self.selector.select(schedule.destination, now).await? {
                Selection::Selected(channel) => channel,
                Selection::NoEligibleChannel => {
                    self.notifier
                        .notify(EngineEvent::NoChannelAvailable {
                            schedule_id: schedule.id,
                            slot,
                            at: now,
                        })
                        .await;
                    report.no_channel += 1;
                    continue;
                }
            };

            let Some(item) = self.next_item(schedule).await? else {
                self.notifier
                    .notify(EngineEvent::ScheduleCompleted {
                        schedule_id: schedule.id,
                        at: now,
                    })
                    .await;
                report.drained += 1;
                continue;
            };

            let mut entry = QueueEntry::new(&item.id, schedule.id, channel.id, slot);
            if let Some(mut test) = self.store.ab_tests.for_schedule(schedule.id)? {
                if test.status == TestStatus::Running {
                    let arm = test.assign_upload()?;
                    entry.experiment_arm = Some(arm);
                    self.store.ab_tests.update(&test)?;
                }
            }

            self.store.queue.enqueue(&entry)?;
            tracing::info!(
                schedule_id = %schedule.id,
                channel = %channel.display_name,
                item = %item.id,
                slot = %slot,
                "queue entry created"
            );
            crate::metrics::record_enqueued();
            report.enqueued += 1;
        }
        Ok(())
    }

    /// Publish times that fall inside (now - lookback, now]
    ///
    /// Yesterday's local date is checked too so slots near midnight are not
    /// lost when the window spans the day boundary.
    fn due_slots(&self, schedule: &Schedule, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let lookback = Duration::minutes(self.config.slot_lookback_minutes);
        let today = now.with_timezone(&schedule.timezone).date_naive();

        let mut slots = Vec::new();
        for date in [today.pred_opt(), Some(today)].into_iter().flatten() {
            for &time in &schedule.publish_times {
                // Ambiguous local times (DST transitions) resolve to the
                // earlier instant; nonexistent ones are skipped.
                let Some(local) = schedule
                    .timezone
                    .from_local_datetime(&date.and_time(time))
                    .earliest()
                else {
                    continue;
                };
                let slot = local.with_timezone(&Utc);
                if slot <= now && now - slot <= lookback {
                    slots.push(slot);
                }
            }
        }
        slots.sort();
        slots
    }

    /// Oldest importable item with no queue entry yet
    async fn next_item(&self, schedule: &Schedule) -> anyhow::Result<Option<SourceItem>> {
        let items = self
            .feed
            .importable_items(schedule.source_account_id)
            .await?;
        for item in items {
            if item.already_published {
                continue;
            }
            if self.store.queue.has_any_for_item(&item.id)? {
                continue;
            }
            return Ok(Some(item));
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Operator actions
    // ------------------------------------------------------------------

    pub fn pause_schedule(&self, id: Uuid) -> EngineResult<()> {
        self.set_schedule_status(id, ScheduleStatus::Paused)
    }

    pub fn resume_schedule(&self, id: Uuid) -> EngineResult<()> {
        self.set_schedule_status(id, ScheduleStatus::Active)
    }

    /// Delete a schedule and drop its not-yet-started work
    pub fn delete_schedule(&self, id: Uuid) -> EngineResult<usize> {
        self.set_schedule_status(id, ScheduleStatus::Deleted)?;
        let cancelled = self
            .store
            .queue
            .cancel_queued(&[id])
            .map_err(|_| EngineError::schedule_not_found(id))?;
        Ok(cancelled)
    }

    fn set_schedule_status(&self, id: Uuid, status: ScheduleStatus) -> EngineResult<()> {
        let current = self
            .store
            .schedules
            .get(id)
            .ok()
            .flatten()
            .ok_or_else(|| EngineError::schedule_not_found(id))?;
        if current.status.is_terminal() && status != ScheduleStatus::Deleted {
            return Err(EngineError::ScheduleDeleted { id: id.to_string() });
        }
        self.store
            .schedules
            .set_status(id, status)
            .map_err(|_| EngineError::schedule_not_found(id))
    }

    /// Cancel every queued (not yet processing) entry for an account
    pub fn cancel_for_source_account(&self, source_account_id: Uuid) -> anyhow::Result<usize> {
        let schedule_ids: Vec<Uuid> = self
            .store
            .schedules
            .list_for_source_account(source_account_id)?
            .into_iter()
            .map(|s| s.id)
            .collect();
        Ok(self.store.queue.cancel_queued(&schedule_ids)?)
    }

    /// Manually requeue a terminally failed entry
    pub fn retry_entry(&self, entry_id: Uuid, now: DateTime<Utc>) -> EngineResult<()> {
        let entry = self
            .store
            .queue
            .get(entry_id)
            .ok()
            .flatten()
            .ok_or_else(|| EngineError::entry_not_found(entry_id))?;
        if entry.status != QueueStatus::Failed {
            return Err(EngineError::NotRetryable {
                id: entry_id.to_string(),
                status: entry.status.to_string(),
            });
        }
        self.store
            .queue
            .requeue_failed(entry_id, now)
            .map_err(|_| EngineError::entry_not_found(entry_id))?;
        Ok(())
    }

    /// Complete a schedule's A/B test, declaring the winner
    pub fn complete_ab_test(
        &self,
        schedule_id: Uuid,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<crate::models::ExperimentArm>> {
        let mut test = self
            .store
            .ab_tests
            .for_schedule(schedule_id)?
            .ok_or_else(|| EngineError::test_not_found(schedule_id))?;
        let winner = test.complete(now)?;
        self.store.ab_tests.update(&test)?;
        Ok(winner)
    }
}

// ============================================================================
// Tests
// ============================================================================
