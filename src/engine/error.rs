//! Error types for the engine drivers

use std::fmt;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine-specific errors
#[derive(Debug)]
pub enum EngineError {
    /// Schedule does not exist
    ScheduleNotFound {
        id: String,
    },

    /// Queue entry does not exist
    EntryNotFound {
        id: String,
    },

    /// Operation requires a running A/B test
    TestNotFound {
        schedule_id: String,
    },

    /// Operation attempted on a terminal schedule
    ScheduleDeleted {
        id: String,
    },

    /// Retry requested for an entry that is not in a failed state
    NotRetryable {
        id: String,
        status: String,
    },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScheduleNotFound { id } => {
                write!(f, "Schedule not found: {id}")
            }
            Self::EntryNotFound { id } => {
                write!(f, "Queue entry not found: {id}")
            }
            Self::TestNotFound { schedule_id } => {
                write!(f, "No A/B test exists for schedule {schedule_id}")
            }
            Self::ScheduleDeleted { id } => {
                write!(f, "Schedule {id} is deleted")
            }
            Self::NotRetryable { id, status } => {
                write!(f, "Queue entry {id} is '{status}', only failed entries can be retried")
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Create a schedule-not-found error
    pub fn schedule_not_found(id: impl ToString) -> Self {
        Self::ScheduleNotFound { id: id.to_string() }
    }

    /// Create an entry-not-found error
    pub fn entry_not_found(id: impl ToString) -> Self {
        Self::EntryNotFound { id: id.to_string() }
    }

    /// Create a test-not-found error
    pub fn test_not_found(schedule_id: impl ToString) -> Self {
        Self::TestNotFound {
            schedule_id: schedule_id.to_string(),
        }
    }

    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        false
    }
}
