//! Unified error handling for the clipcast crate
//!
//! A single [`Error`] enum wraps the domain-specific error types, and
//! [`ErrorCategory`] classifies every error into the handling strategy the
//! drivers apply: configuration problems skip the slot, transient problems
//! retry with backoff, authorization problems open the circuit, invariant
//! violations are rejected outright.

use std::io;
use thiserror::Error;

pub use crate::abtest::AbTestError;
pub use crate::engine::error::EngineError;
pub use crate::publish::PublishFailure;
pub use crate::storage::StorageError;

/// Common trait for clipcast error types
pub trait ClipcastErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Operator-fixable setup problems (no channel, no subscription, empty pool)
    Configuration,
    /// Short-lived external failures (timeout, rate limit, network)
    Transient,
    /// Revoked or missing authorization; requires operator action
    Authorization,
    /// Data-model invariant violations, rejected at write time
    Invariant,
    /// Storage and I/O errors
    Storage,
    /// Other/unknown errors
    Other,
}

/// Unified error type for the clipcast crate
#[derive(Error, Debug)]
pub enum Error {
    /// Engine driver errors
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Storage-layer errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Typed publish failures from the destination platform
    #[error("Publish failure: {0}")]
    Publish(#[from] PublishFailure),

    /// Experiment state errors
    #[error("A/B test error: {0}")]
    AbTest(#[from] AbTestError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors (webhook delivery)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ClipcastErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Engine(e) => e.is_recoverable(),
            Self::Storage(e) => !matches!(e, StorageError::InvariantViolation(_)),
            Self::Publish(e) => e.is_transient(),
            Self::AbTest(_) => false,
            Self::Io(_) => true,
            Self::Json(_) => false,
            Self::Http(_) => true,
            Self::Config(_) => false,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Engine(_) => ErrorCategory::Configuration,
            Self::Storage(StorageError::InvariantViolation(_)) => ErrorCategory::Invariant,
            Self::Storage(_) => ErrorCategory::Storage,
            Self::Publish(e) if e.is_authorization() => ErrorCategory::Authorization,
            Self::Publish(e) if e.is_transient() => ErrorCategory::Transient,
            Self::Publish(_) => ErrorCategory::Other,
            Self::AbTest(_) => ErrorCategory::Invariant,
            Self::Io(_) => ErrorCategory::Storage,
            Self::Json(_) => ErrorCategory::Storage,
            Self::Http(_) => ErrorCategory::Transient,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }
}

// Conversion from anyhow::Error
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_failure_categories() {
        let timeout = Error::Publish(PublishFailure::Timeout);
        assert_eq!(timeout.category(), ErrorCategory::Transient);
        assert!(timeout.is_recoverable());

        let revoked = Error::Publish(PublishFailure::TokenRevoked);
        assert_eq!(revoked.category(), ErrorCategory::Authorization);
        assert!(!revoked.is_recoverable());

        let rejected = Error::Publish(PublishFailure::Rejected("bad".into()));
        assert_eq!(rejected.category(), ErrorCategory::Other);
    }

    #[test]
    fn test_invariant_violation_category() {
        let err = Error::Storage(StorageError::invariant("duplicate priority"));
        assert_eq!(err.category(), ErrorCategory::Invariant);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_engine_error_category() {
        let err = Error::Engine(EngineError::schedule_not_found("x"));
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("bad batch size");
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(!err.is_recoverable());
    }
}
