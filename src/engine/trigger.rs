//! Periodic driver loops for the engine
//!
//! Two independent tokio interval loops drive the engine: one for the
//! schedule orchestrator, one for the queue processor. They may overlap
//! freely; the store's guarded transitions make that safe. Each tick is
//! broadcast as a [`DriverEvent`] for observers (the CLI, tests).

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use super::orchestrator::{OrchestratorReport, ScheduleOrchestrator};
use super::processor::{ProcessorReport, QueueProcessor};

// ============================================================================
// Configuration
// ============================================================================

/// Driver loop intervals
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Seconds between orchestrator passes
    pub orchestrator_interval_secs: u64,

    /// Seconds between processor passes
    pub processor_interval_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            orchestrator_interval_secs: 60,
            processor_interval_secs: 30,
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Broadcast after each driver pass
#[derive(Debug, Clone)]
pub enum DriverEvent {
    OrchestratorTicked {
        report: OrchestratorReport,
        at: DateTime<Utc>,
    },
    ProcessorTicked {
        report: ProcessorReport,
        at: DateTime<Utc>,
    },
}

// ============================================================================
// Engine Driver
// ============================================================================

/// Owns and runs both periodic loops
pub struct EngineDriver {
    orchestrator: Arc<ScheduleOrchestrator>,
    processor: Arc<QueueProcessor>,
    config: DriverConfig,
    event_tx: broadcast::Sender<DriverEvent>,
    is_running: Arc<RwLock<bool>>,
}

impl EngineDriver {
    pub fn new(
        orchestrator: Arc<ScheduleOrchestrator>,
        processor: Arc<QueueProcessor>,
        config: DriverConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            orchestrator,
            processor,
            config,
            event_tx,
            is_running: Arc::new(RwLock::new(false)),
        }
    }

    /// Subscribe to tick events
    pub fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.event_tx.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// Start both loops; returns their join handles
    ///
    /// Tick errors are logged and the loop continues; nothing short of
    /// [`EngineDriver::stop`] ends a loop.
    pub async fn start(&self) -> (JoinHandle<()>, JoinHandle<()>) {
        *self.is_running.write().await = true;

        let orchestrator_handle = {
            let orchestrator = self.orchestrator.clone();
            let running = self.is_running.clone();
            let events = self.event_tx.clone();
            let interval_secs = self.config.orchestrator_interval_secs;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    if !*running.read().await {
                        break;
                    }
                    let now = Utc::now();
                    match orchestrator.tick(now).await {
                        Ok(report) => {
                            let _ = events.send(DriverEvent::OrchestratorTicked { report, at: now });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "orchestrator tick failed");
                        }
                    }
                }
                tracing::info!("orchestrator loop stopped");
            })
        };

        let processor_handle = {
            let processor = self.processor.clone();
            let running = self.is_running.clone();
            let events = self.event_tx.clone();
            let interval_secs = self.config.processor_interval_secs;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    if !*running.read().await {
                        break;
                    }
                    let now = Utc::now();
                    match processor.tick(now).await {
                        Ok(report) => {
                            let _ = events.send(DriverEvent::ProcessorTicked { report, at: now });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "processor tick failed");
                        }
                    }
                }
                tracing::info!("processor loop stopped");
            })
        };

        tracing::info!(
            orchestrator_interval = self.config.orchestrator_interval_secs,
            processor_interval = self.config.processor_interval_secs,
            "engine drivers started"
        );
        (orchestrator_handle, processor_handle)
    }

    /// Signal both loops to exit after their current pass
    pub async fn stop(&self) {
        *self.is_running.write().await = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::orchestrator::OrchestratorConfig;
    use crate::engine::processor::ProcessorConfig;
    use crate::health::{HealthConfig, HealthMonitor};
    use crate::notifications::NotificationManager;
    use crate::publish::{ScriptedPublisher, StaticSourceFeed, StaticSubscriptions};
    use crate::quota::QuotaTracker;
    use crate::rotation::RotationSelector;
    use crate::storage::Store;

    fn driver() -> EngineDriver {
        let store = Store::memory();
        let feed = Arc::new(StaticSourceFeed::default());
        let subs = Arc::new(StaticSubscriptions::new());
        let notifier = Arc::new(NotificationManager::new());
        let quota = Arc::new(QuotaTracker::new(store.quota.clone(), subs.clone()));
        let health = Arc::new(HealthMonitor::new(
            store.health.clone(),
            HealthConfig::default(),
        ));
        let selector = Arc::new(RotationSelector::new(
            store.channels.clone(),
            store.pools.clone(),
            quota.clone(),
            health.clone(),
        ));
        let orchestrator = Arc::new(ScheduleOrchestrator::new(
            store.clone(),
            selector,
            feed.clone(),
            subs,
            notifier.clone(),
            OrchestratorConfig::default(),
        ));
        let processor = Arc::new(QueueProcessor::new(
            store,
            Arc::new(ScriptedPublisher::always_ok()),
            feed,
            quota,
            health,
            notifier,
            ProcessorConfig {
                stagger_secs: 0,
                ..ProcessorConfig::default()
            },
        ));
        EngineDriver::new(
            orchestrator,
            processor,
            DriverConfig {
                orchestrator_interval_secs: 1,
                processor_interval_secs: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_driver_ticks_and_stops() {
        let driver = driver();
        let mut events = driver.subscribe();

        let (h1, h2) = driver.start().await;
        assert!(driver.is_running().await);

        // Both loops announce at least one pass
        let mut saw_orchestrator = false;
        let mut saw_processor = false;
        for _ in 0..4 {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Ok(DriverEvent::OrchestratorTicked { .. })) => saw_orchestrator = true,
                Ok(Ok(DriverEvent::ProcessorTicked { .. })) => saw_processor = true,
                _ => break,
            }
            if saw_orchestrator && saw_processor {
                break;
            }
        }
        assert!(saw_orchestrator);
        assert!(saw_processor);

        driver.stop().await;
        let _ = tokio::time::timeout(Duration::from_secs(5), h1).await;
        let _ = tokio::time::timeout(Duration::from_secs(5), h2).await;
        assert!(!driver.is_running().await);
    }
}
