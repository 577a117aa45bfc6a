//! Channel health tracking and circuit breaking
//!
//! Every queue-entry resolution feeds back into a per-channel
//! [`HealthRecord`]. A three-state circuit gates whether a channel may
//! receive new work:
//!
//! ```text
//!            5 consecutive failures
//!   closed ──────────────────────────▶ open
//!     ▲                                 │
//!     │ probe succeeds                  │ cool-down elapses
//!     │                                 ▼
//!     └──────────────────────────── half_open
//!                probe fails ──▶ open (cool-down restarts)
//! ```
//!
//! `open` never transitions directly to `closed`; recovery always passes
//! through a single half-open probe attempt.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::ProgressPhase;
use crate::storage::repository::HealthRepository;

// ============================================================================
// Circuit State
// ============================================================================

/// Circuit-breaker state for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, channel eligible for work
    Closed,
    /// Too many consecutive failures, channel ineligible
    Open,
    /// Eligible for exactly one probe attempt
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Whether the rotation selector may hand work to a channel in this state
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Closed | Self::HalfOpen)
    }
}

impl FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half_open" => Ok(Self::HalfOpen),
            other => Err(format!("unknown circuit state: {other}")),
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Health Configuration
// ============================================================================

/// Thresholds for the circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,

    /// Seconds the circuit stays open before allowing a probe
    pub cooldown_secs: i64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30 * 60,
        }
    }
}

// ============================================================================
// Health Record
// ============================================================================

/// Rolling health state for one channel
///
/// Mutated after every queue-entry resolution and persisted through the
/// health repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub channel_id: Uuid,

    /// Total successful publishes
    pub successes: u64,

    /// Total failed publishes
    pub failures: u64,

    /// Failures since the last success
    pub consecutive_failures: u32,

    pub circuit_state: CircuitState,

    /// A half-open probe has been handed out and not yet resolved
    pub probe_in_flight: bool,

    pub last_failure_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    /// Phase the last error occurred in
    pub last_error_phase: Option<ProgressPhase>,

    pub last_checked_at: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,
}

impl HealthRecord {
    pub fn new(channel_id: Uuid) -> Self {
        Self {
            channel_id,
            successes: 0,
            failures: 0,
            consecutive_failures: 0,
            circuit_state: CircuitState::Closed,
            probe_in_flight: false,
            last_failure_at: None,
            last_error: None,
            last_error_phase: None,
            last_checked_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Success rate over all attempts; `None` when no attempts exist
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.successes + self.failures;
        if total == 0 {
            None
        } else {
            Some(self.successes as f64 / total as f64)
        }
    }

    /// Record a successful publish
    ///
    /// Resets the consecutive-failure streak; a successful half-open probe
    /// closes the circuit.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.successes += 1;
        self.consecutive_failures = 0;
        self.probe_in_flight = false;
        self.circuit_state = CircuitState::Closed;
        self.last_checked_at = Some(now);
        self.updated_at = now;
    }

    /// Record a failed publish
    ///
    /// Opens the circuit at the configured threshold; a failed half-open
    /// probe reopens it and restarts the cool-down.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        phase: Option<ProgressPhase>,
        config: &HealthConfig,
        now: DateTime<Utc>,
    ) {
        self.failures += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.into());
        self.last_error_phase = phase;
        self.last_failure_at = Some(now);
        self.last_checked_at = Some(now);
        self.probe_in_flight = false;
        self.updated_at = now;

        match self.circuit_state {
            CircuitState::HalfOpen => {
                self.circuit_state = CircuitState::Open;
            }
            CircuitState::Closed if self.consecutive_failures >= config.failure_threshold => {
                self.circuit_state = CircuitState::Open;
            }
            _ => {}
        }
    }

    /// Open the circuit immediately, bypassing the failure threshold
    ///
    /// Used for authorization failures, which are pointless to retry.
    pub fn trip(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.failures += 1;
        self.consecutive_failures += 1;
        self.last_error = Some(error.into());
        self.last_failure_at = Some(now);
        self.probe_in_flight = false;
        self.circuit_state = CircuitState::Open;
        self.updated_at = now;
    }

    /// Circuit state as observed at `now`, accounting for cool-down expiry
    ///
    /// An `open` circuit whose cool-down has elapsed reads as `half_open`;
    /// the transition is persisted when a probe is actually acquired.
    pub fn effective_state(&self, config: &HealthConfig, now: DateTime<Utc>) -> CircuitState {
        match self.circuit_state {
            CircuitState::Open => match self.last_failure_at {
                Some(failed_at)
                    if now - failed_at >= Duration::seconds(config.cooldown_secs) =>
                {
                    CircuitState::HalfOpen
                }
                _ => CircuitState::Open,
            },
            other => other,
        }
    }

    /// Whether the selector may consider this channel at `now`
    pub fn is_eligible(&self, config: &HealthConfig, now: DateTime<Utc>) -> bool {
        match self.effective_state(config, now) {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !self.probe_in_flight,
            CircuitState::Open => false,
        }
    }
}

// ============================================================================
// Health Monitor
// ============================================================================

/// Applies circuit transitions and persists them through the repository
pub struct HealthMonitor {
    repo: Arc<dyn HealthRepository>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(repo: Arc<dyn HealthRepository>, config: HealthConfig) -> Self {
        Self { repo, config }
    }

    pub fn with_defaults(repo: Arc<dyn HealthRepository>) -> Self {
        Self::new(repo, HealthConfig::default())
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Current record for a channel, created on first access
    pub fn record(&self, channel_id: Uuid) -> anyhow::Result<HealthRecord> {
        self.repo.get_or_create(channel_id)
    }

    /// Whether a channel may be selected for work at `now`
    pub fn is_eligible(&self, channel_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<bool> {
        Ok(self.record(channel_id)?.is_eligible(&self.config, now))
    }

    /// Claim the right to attempt a publish on this channel
    ///
    /// Returns `false` when the circuit is open or a half-open probe is
    /// already in flight. A half-open claim marks the probe so the channel is
    /// dispensed exactly once per cool-down window.
    pub fn begin_attempt(&self, channel_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let mut record = self.record(channel_id)?;
        match record.effective_state(&self.config, now) {
            CircuitState::Closed => Ok(true),
            CircuitState::Open => Ok(false),
            CircuitState::HalfOpen => {
                if record.probe_in_flight {
                    return Ok(false);
                }
                record.circuit_state = CircuitState::HalfOpen;
                record.probe_in_flight = true;
                record.updated_at = now;
                self.repo.update(&record)?;
                tracing::debug!(channel_id = %channel_id, "half-open probe dispensed");
                Ok(true)
            }
        }
    }

    /// Record a successful publish outcome
    pub fn record_success(&self, channel_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<()> {
        let mut record = self.record(channel_id)?;
        let was_open = record.circuit_state != CircuitState::Closed;
        record.record_success(now);
        self.repo.update(&record)?;
        if was_open {
            tracing::info!(channel_id = %channel_id, "circuit closed after successful probe");
        }
        Ok(())
    }

    /// Record a failed publish outcome
    pub fn record_failure(
        &self,
        channel_id: Uuid,
        error: impl Into<String>,
        phase: Option<ProgressPhase>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut record = self.record(channel_id)?;
        let before = record.circuit_state;
        record.record_failure(error, phase, &self.config, now);
        self.repo.update(&record)?;
        if before != CircuitState::Open && record.circuit_state == CircuitState::Open {
            tracing::warn!(
                channel_id = %channel_id,
                consecutive = record.consecutive_failures,
                "circuit opened"
            );
        }
        Ok(())
    }

    /// Open the circuit immediately (authorization failures)
    pub fn trip(
        &self,
        channel_id: Uuid,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut record = self.record(channel_id)?;
        record.trip(error, now);
        self.repo.update(&record)?;
        tracing::warn!(channel_id = %channel_id, "circuit tripped open");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
