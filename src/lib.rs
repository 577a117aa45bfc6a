//! clipcast - multi-channel publish scheduling and rotation engine
//!
//! Decides, for a pool of destination channels with finite daily upload
//! quotas and possibly degraded health, which channel receives the next video
//! at which time; recovers from failures; and measures which posting strategy
//! performs best.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Core data structures and types
//! - [`quota`] - Daily upload counters and remaining capacity
//! - [`health`] - Success/failure tracking and the circuit breaker
//! - [`rotation`] - Destination channel selection by strategy
//! - [`timing`] - Posting-time scoring and ranked suggestions
//! - [`abtest`] - A/B testing of publish-time variants
//! - [`engine`] - The schedule orchestrator and queue processor drivers
//! - [`storage`] - Repository-based persistence (SQLite, in-memory)
//! - [`publish`] - Boundary traits for external collaborators
//! - [`notifications`] - Event emission to webhook channels
//! - [`metrics`] - Prometheus metrics
//! - [`utils`] - Common utilities and helpers
//!
//! # Example
//!
//! ```no_run
//! use clipcast::config::Config;
//! use clipcast::storage::Store;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = Store::sqlite(&config.database.sqlite_path)?;
//!     let stats = store.queue.stats()?;
//!     println!("{} entries pending", stats.pending());
//!     Ok(())
//! }
//! ```

pub mod abtest;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod metrics;
pub mod models;
pub mod notifications;
pub mod publish;
pub mod quota;
pub mod rotation;
pub mod storage;
pub mod timing;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::abtest::{AbTest, TestStatus, Variant};
    pub use crate::config::Config;
    pub use crate::engine::{
        DriverConfig, EngineDriver, OrchestratorConfig, ProcessorConfig, QueueProcessor,
        ScheduleOrchestrator,
    };
    pub use crate::error::{ClipcastErrorTrait, Error, ErrorCategory, Result};
    pub use crate::health::{CircuitState, HealthMonitor, HealthRecord};
    pub use crate::models::{
        Channel, Destination, Pool, PoolMember, QueueEntry, QueueStatus, RotationStrategy,
        Schedule, SourceItem,
    };
    pub use crate::publish::{Publisher, SourceFeed, SubscriptionLookup};
    pub use crate::quota::QuotaTracker;
    pub use crate::rotation::{RotationSelector, Selection};
    pub use crate::storage::Store;
    pub use crate::timing::{suggest_times, OutcomeHistory, TimeSuggestion};
}

// Direct re-exports for convenience
pub use models::{Channel, Pool, QueueEntry, QueueStatus, RotationStrategy, Schedule};
