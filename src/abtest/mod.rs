//! A/B testing of publish-time variants
//!
//! Each schedule may run one experiment comparing two sets of publish times.
//! Uploads alternate strictly between the variants by combined upload parity,
//! so after N uploads the variant counts differ by at most one. Outcomes
//! accumulate per variant; once the combined sample reaches the minimum size
//! a confidence score is derived from a two-proportion pooled z statistic.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::ExperimentArm;

/// Combined uploads required before a confidence value is reported
pub const MIN_SAMPLE_SIZE: u64 = 20;

// ============================================================================
// Test Status
// ============================================================================

/// Lifecycle status of an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Running,
    Paused,
    /// Terminal
    Completed,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl FromStr for TestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown test status: {other}")),
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Variant
// ============================================================================

/// One time variant under test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    /// Operator-facing label, e.g. "evening"
    pub name: String,

    /// Publish times this variant posts at
    pub slots: Vec<NaiveTime>,

    /// Uploads assigned to this variant
    pub uploads: u64,

    /// Uploads that reached `published`
    pub successes: u64,
}

impl Variant {
    pub fn new(name: impl Into<String>, slots: Vec<NaiveTime>) -> Self {
        Self {
            name: name.into(),
            slots,
            uploads: 0,
            successes: 0,
        }
    }

    /// Running success percentage; `None` before any upload resolves
    pub fn success_rate(&self) -> Option<f64> {
        if self.uploads == 0 {
            None
        } else {
            Some(self.successes as f64 / self.uploads as f64)
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Experiment state errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbTestError {
    /// Upload assigned while the test is not running
    #[error("test {0} is not running")]
    NotRunning(Uuid),

    /// State change attempted on a completed test
    #[error("test {0} is completed and immutable")]
    Completed(Uuid),
}

// ============================================================================
// A/B Test
// ============================================================================

/// An experiment comparing two publish-time variants on one schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTest {
    pub id: Uuid,

    pub schedule_id: Uuid,

    pub status: TestStatus,

    pub variant_a: Variant,

    pub variant_b: Variant,

    /// Declared winner, set on completion when rates differ
    pub winner: Option<ExperimentArm>,

    pub created_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl AbTest {
    pub fn new(schedule_id: Uuid, variant_a: Variant, variant_b: Variant) -> Self {
        Self {
            id: Uuid::new_v4(),
            schedule_id,
            status: TestStatus::Running,
            variant_a,
            variant_b,
            winner: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn variant(&self, arm: ExperimentArm) -> &Variant {
        match arm {
            ExperimentArm::A => &self.variant_a,
            ExperimentArm::B => &self.variant_b,
        }
    }

    fn variant_mut(&mut self, arm: ExperimentArm) -> &mut Variant {
        match arm {
            ExperimentArm::A => &mut self.variant_a,
            ExperimentArm::B => &mut self.variant_b,
        }
    }

    pub fn total_uploads(&self) -> u64 {
        self.variant_a.uploads + self.variant_b.uploads
    }

    /// Arm the next upload will be assigned to
    ///
    /// Strict alternation by combined upload parity keeps the variant counts
    /// within one of each other for any upload sequence.
    pub fn next_arm(&self) -> ExperimentArm {
        if self.total_uploads() % 2 == 0 {
            ExperimentArm::A
        } else {
            ExperimentArm::B
        }
    }

    /// Assign the next upload and return its arm
    pub fn assign_upload(&mut self) -> Result<ExperimentArm, AbTestError> {
        if self.status != TestStatus::Running {
            return Err(AbTestError::NotRunning(self.id));
        }
        let arm = self.next_arm();
        self.variant_mut(arm).uploads += 1;
        Ok(arm)
    }

    /// Record the terminal outcome of an upload previously assigned to `arm`
    ///
    /// A paused test still accepts outcomes for uploads assigned while it was
    /// running; only new assignments are refused.
    pub fn record_outcome(&mut self, arm: ExperimentArm, success: bool) -> Result<(), AbTestError> {
        if self.status == TestStatus::Completed {
            return Err(AbTestError::Completed(self.id));
        }
        if success {
            self.variant_mut(arm).successes += 1;
        }
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), AbTestError> {
        if self.status == TestStatus::Completed {
            return Err(AbTestError::Completed(self.id));
        }
        self.status = TestStatus::Paused;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), AbTestError> {
        if self.status == TestStatus::Completed {
            return Err(AbTestError::Completed(self.id));
        }
        self.status = TestStatus::Running;
        Ok(())
    }

    /// Confidence that the observed rate difference is real, in [0, 100]
    ///
    /// Two-proportion pooled z statistic mapped through the standard Normal
    /// CDF: `(2·Φ(|z|) − 1) × 100`. Monotonic in the rate difference and in
    /// the combined sample size. `None` until the combined sample reaches
    /// [`MIN_SAMPLE_SIZE`].
    pub fn confidence(&self) -> Option<f64> {
        if self.total_uploads() < MIN_SAMPLE_SIZE {
            return None;
        }
        let (n_a, n_b) = (self.variant_a.uploads as f64, self.variant_b.uploads as f64);
        if n_a == 0.0 || n_b == 0.0 {
            return None;
        }
        let p_a = self.variant_a.successes as f64 / n_a;
        let p_b = self.variant_b.successes as f64 / n_b;
        let pooled = (self.variant_a.successes + self.variant_b.successes) as f64 / (n_a + n_b);
        let se = (pooled * (1.0 - pooled) * (1.0 / n_a + 1.0 / n_b)).sqrt();
        if se == 0.0 {
            // Pooled rate of 0 or 1 implies identical variant rates
            return Some(0.0);
        }
        let z = ((p_a - p_b) / se).abs();
        let normal = Normal::new(0.0, 1.0).expect("unit normal");
        Some(((2.0 * normal.cdf(z) - 1.0) * 100.0).clamp(0.0, 100.0))
    }

    /// Complete the test and declare a winner
    ///
    /// The winner is the variant with the strictly higher success rate; equal
    /// rates yield no winner. Completion is terminal.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<Option<ExperimentArm>, AbTestError> {
        if self.status == TestStatus::Completed {
            return Err(AbTestError::Completed(self.id));
        }
        let rate_a = self.variant_a.success_rate().unwrap_or(0.0);
        let rate_b = self.variant_b.success_rate().unwrap_or(0.0);
        self.winner = if rate_a > rate_b {
            Some(ExperimentArm::A)
        } else if rate_b > rate_a {
            Some(ExperimentArm::B)
        } else {
            None
        };
        self.status = TestStatus::Completed;
        self.completed_at = Some(now);
        Ok(self.winner)
    }
}

// ============================================================================
// Tests
// ============================================================================
