//! Error types for Procflow.
//!
//! All errors are represented by the `ProcflowError` enum. The variants follow the
//! failure taxonomy of the execution core: lock, transaction, persistence, scheduler
//! and flow-node execution failures, plus the ambient configuration and conversion kinds.

use std::{io::ErrorKind, string::FromUtf8Error};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::TenantId;

/// Unified error type for all Procflow operations.
#[derive(Deserialize, Serialize, Error, Debug, Clone, PartialEq)]
pub enum ProcflowError {
    /// Engine-level errors (startup, shutdown, paused tenant).
    #[error("{0}")]
    Engine(String),

    /// Configuration parsing or validation errors.
    #[error("{0}")]
    Config(String),

    /// Data conversion errors (JSON, TOML).
    #[error("{0}")]
    Convert(String),

    /// Lock misuse, such as releasing a lock held by another thread.
    #[error("lock failure: {0}")]
    Lock(String),

    /// Bounded wait for a lock expired.
    #[error("timed out after {timeout_ms}ms waiting for lock {object_type}:{object_id} of tenant {tenant_id}")]
    LockTimeout {
        tenant_id: TenantId,
        object_id: u64,
        object_type: String,
        timeout_ms: u64,
    },

    /// Illegal transaction usage (nested begin, no active transaction).
    #[error("{0}")]
    Transaction(String),

    /// Failure while committing: some effects may already be visible.
    #[error("commit failed: {0}")]
    Commit(String),

    /// Read or write failure reported by the persistence layer.
    #[error("{message}")]
    Persistence {
        message: String,
        retryable: bool,
    },

    /// Entity lookup failed.
    #[error("{0}")]
    NotFound(String),

    /// Job store or trigger failure.
    #[error("{0}")]
    Scheduler(String),

    /// Business-logic failure during a flow-node transition.
    #[error("{0}")]
    Execution(String),

    /// Expression evaluation failure.
    #[error("{0}")]
    Expression(String),

    /// Contract input rejected.
    #[error("{0}")]
    Contract(String),

    /// Process definition errors.
    #[error("{0}")]
    Definition(String),

    /// An event handler refused an event.
    #[error("{0}")]
    Handler(String),

    /// I/O operation errors.
    #[error("{0}")]
    IoError(String),

    /// Message queue errors.
    #[error("{0}")]
    Queue(String),
}

/// What a caller may assume about the effects of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The transaction rolled back: nothing changed, the operation is safe to retry.
    NothingHappened,
    /// The commit failed part-way: effects may be partially visible and need reconciliation.
    Unknown,
}

impl ProcflowError {
    pub fn persistence(message: impl Into<String>) -> Self {
        ProcflowError::Persistence {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable_persistence(message: impl Into<String>) -> Self {
        ProcflowError::Persistence {
            message: message.into(),
            retryable: true,
        }
    }

    /// Lock acquisition timeouts and persistence failures flagged retryable may be retried
    /// at the transition-invocation boundary. Misuse of a lock never is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProcflowError::LockTimeout { .. }
                | ProcflowError::Persistence {
                    retryable: true,
                    ..
                }
        )
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ProcflowError::Commit(_) => FailureKind::Unknown,
            _ => FailureKind::NothingHappened,
        }
    }
}

impl From<ProcflowError> for String {
    fn from(val: ProcflowError) -> Self {
        val.to_string()
    }
}

impl From<std::io::Error> for ProcflowError {
    fn from(error: std::io::Error) -> Self {
        ProcflowError::IoError(error.to_string())
    }
}

impl From<ProcflowError> for std::io::Error {
    fn from(val: ProcflowError) -> Self {
        std::io::Error::new(ErrorKind::Other, val.to_string())
    }
}

impl From<FromUtf8Error> for ProcflowError {
    fn from(_: FromUtf8Error) -> Self {
        ProcflowError::Convert("Error with utf-8 string convert".to_string())
    }
}

impl From<serde_json::Error> for ProcflowError {
    fn from(error: serde_json::Error) -> Self {
        ProcflowError::Convert(error.to_string())
    }
}

impl From<toml::de::Error> for ProcflowError {
    fn from(error: toml::de::Error) -> Self {
        ProcflowError::Config(error.to_string())
    }
}

impl From<cron::error::Error> for ProcflowError {
    fn from(error: cron::error::Error) -> Self {
        ProcflowError::Scheduler(format!("invalid cron expression: {}", error))
    }
}

impl From<jsonschema::ValidationError<'_>> for ProcflowError {
    fn from(error: jsonschema::ValidationError<'_>) -> Self {
        ProcflowError::Contract(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!ProcflowError::Lock("lock 1:flow_node:2 is held by another thread".into()).is_retryable());
        assert!(
            ProcflowError::LockTimeout {
                tenant_id: 1,
                object_id: 2,
                object_type: "x".into(),
                timeout_ms: 10,
            }
            .is_retryable()
        );
        assert!(ProcflowError::retryable_persistence("conflict").is_retryable());
        assert!(!ProcflowError::persistence("disk full").is_retryable());
        assert!(!ProcflowError::Execution("bad".into()).is_retryable());
    }

    #[test]
    fn test_failure_kind() {
        assert_eq!(ProcflowError::Commit("half".into()).failure_kind(), FailureKind::Unknown);
        assert_eq!(ProcflowError::Handler("no".into()).failure_kind(), FailureKind::NothingHappened);
    }
}
