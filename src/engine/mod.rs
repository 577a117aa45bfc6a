//! Scheduling and queue-processing drivers
//!
//! The engine runs as two cooperating periodic drivers over the shared store:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       EngineDriver                           │
//! │   ┌──────────────────┐            ┌──────────────────┐       │
//! │   │    Schedule      │            │      Queue       │       │
//! │   │  Orchestrator    │            │    Processor     │       │
//! │   └────────┬─────────┘            └────────┬─────────┘       │
//! │            │  enqueue                      │  claim/resolve  │
//! │            ▼                               ▼                 │
//! │   ┌──────────────────────────────────────────────────┐       │
//! │   │               queue_entries (durable)            │       │
//! │   └──────────────────────────────────────────────────┘       │
//! └──────────────────────────────────────────────────────────────┘
//!           │ selection                        │ outcome
//!           ▼                                  ▼
//!   Rotation Selector               Health Monitor, A/B Tracker,
//!   (quota + health gated)          Quota Tracker, Notifications
//! ```
//!
//! The orchestrator resolves due publish slots into queue entries; the
//! processor executes due entries against the external publish operation and
//! feeds outcomes back into health, quota, and experiment state. Both drivers
//! tolerate overlap: every shared counter is updated with guarded single-row
//! writes, and every status transition is claimed exactly once.
//!
//! # Modules
//!
//! - [`orchestrator`] - due-slot resolution and enqueueing
//! - [`processor`] - batch publishing with retry/backoff
//! - [`trigger`] - the periodic driver loops
//! - [`error`] - engine-scoped error types

pub mod error;
pub mod orchestrator;
pub mod processor;
pub mod trigger;

pub use error::{EngineError, EngineResult};
pub use orchestrator::{OrchestratorConfig, OrchestratorReport, ScheduleOrchestrator};
pub use processor::{ProcessorConfig, ProcessorReport, QueueProcessor};
pub use trigger::{DriverConfig, DriverEvent, EngineDriver};
