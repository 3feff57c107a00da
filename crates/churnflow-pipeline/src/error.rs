//! Pipeline error taxonomy
//!
//! Each stage raises its own error type; [`PipelineError`] wraps them for the
//! orchestrator, which uses [`PipelineError::is_transient`] to decide whether
//! a stage is retried and [`PipelineError::kind`] to record the failure.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::extract::ExtractError;
use crate::load::LoadError;
use crate::orchestrator::job::JobStatus;
use crate::store::StoreError;
use crate::sync::SyncError;
use crate::transform::TransformError;
use crate::validate::ValidationError;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Failure classification persisted on the job run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "ExtractError")]
    Extract,
    #[serde(rename = "TransformError")]
    Transform,
    #[serde(rename = "LoadError")]
    Load,
    #[serde(rename = "ValidationError")]
    Validation,
    #[serde(rename = "SyncError")]
    Sync,
    #[serde(rename = "ConnectionError")]
    Connection,
    #[serde(rename = "StageTimeout")]
    Timeout,
    #[serde(rename = "RunLockHeld")]
    RunLockHeld,
    #[serde(rename = "JobRecordError")]
    JobRecord,
    #[serde(rename = "InternalError")]
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Extract => "ExtractError",
            ErrorKind::Transform => "TransformError",
            ErrorKind::Load => "LoadError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Sync => "SyncError",
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Timeout => "StageTimeout",
            ErrorKind::RunLockHeld => "RunLockHeld",
            ErrorKind::JobRecord => "JobRecordError",
            ErrorKind::Internal => "InternalError",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            ErrorKind::Extract,
            ErrorKind::Transform,
            ErrorKind::Load,
            ErrorKind::Validation,
            ErrorKind::Sync,
            ErrorKind::Connection,
            ErrorKind::Timeout,
            ErrorKind::RunLockHeld,
            ErrorKind::JobRecord,
            ErrorKind::Internal,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error surfaced by a pipeline stage to the orchestrator
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Stage {stage} exceeded its {}s timeout", timeout.as_secs())]
    StageTimeout { stage: JobStatus, timeout: Duration },

    /// Another run holds the lock for the same primary store
    #[error("Another pipeline run is active against {target}")]
    RunLockHeld { target: String },

    /// Reading or writing bookkeeping state (run lock, job record, schema)
    #[error("Failed to maintain run bookkeeping: {0}")]
    Bookkeeping(#[from] StoreError),

    #[error("Stage {stage} task failed: {message}")]
    TaskFailed { stage: JobStatus, message: String },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Extract(_) => ErrorKind::Extract,
            PipelineError::Transform(_) => ErrorKind::Transform,
            PipelineError::Load(e) if e.is_transient() => ErrorKind::Connection,
            PipelineError::Load(_) => ErrorKind::Load,
            PipelineError::Validation(e) if e.is_transient() => ErrorKind::Connection,
            PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::Sync(e) if e.is_transient() => ErrorKind::Connection,
            PipelineError::Sync(_) => ErrorKind::Sync,
            PipelineError::StageTimeout { .. } => ErrorKind::Timeout,
            PipelineError::RunLockHeld { .. } => ErrorKind::RunLockHeld,
            PipelineError::Bookkeeping(e) if e.is_transient() => ErrorKind::Connection,
            PipelineError::Bookkeeping(_) => ErrorKind::JobRecord,
            PipelineError::TaskFailed { .. } => ErrorKind::Internal,
        }
    }

    /// Whether the failed stage may be retried
    ///
    /// Connection failures are transient wherever they occur. Timeouts are
    /// transient only for the stages that talk to a database; extract and
    /// transform are local and a timeout there is terminal.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Extract(_) | PipelineError::Transform(_) => false,
            PipelineError::Load(e) => e.is_transient(),
            PipelineError::Validation(e) => e.is_transient(),
            PipelineError::Sync(e) => e.is_transient(),
            PipelineError::StageTimeout { stage, .. } => stage.is_network_bound(),
            PipelineError::RunLockHeld { .. } => false,
            PipelineError::Bookkeeping(e) => e.is_transient(),
            PipelineError::TaskFailed { .. } => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::Table;

    #[test]
    fn test_timeout_transient_only_for_network_stages() {
        let load = PipelineError::StageTimeout {
            stage: JobStatus::Loading,
            timeout: Duration::from_secs(5),
        };
        let extract = PipelineError::StageTimeout {
            stage: JobStatus::Extracting,
            timeout: Duration::from_secs(5),
        };

        assert!(load.is_transient());
        assert!(!extract.is_transient());
        assert_eq!(load.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_constraint_violation_is_terminal() {
        let err = PipelineError::from(LoadError::Constraint {
            table: Table::Billing,
            batch: 0,
            message: "violates check constraint".to_string(),
        });
        assert!(!err.is_transient());
        assert_eq!(err.kind(), ErrorKind::Load);
    }

    #[test]
    fn test_connection_failure_is_transient() {
        let err = PipelineError::from(LoadError::Connection {
            table: Table::Demographics,
            message: "connection reset".to_string(),
        });
        assert!(err.is_transient());
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn test_run_lock_held_is_terminal() {
        let err = PipelineError::RunLockHeld {
            target: "primary".to_string(),
        };
        assert!(!err.is_transient());
        assert_eq!(err.kind().as_str(), "RunLockHeld");
    }

    #[test]
    fn test_error_kind_names_round_trip() {
        for name in ["ExtractError", "LoadError", "StageTimeout", "ConnectionError"] {
            assert_eq!(ErrorKind::from_name(name).unwrap().as_str(), name);
        }
        assert!(ErrorKind::from_name("Oops").is_none());
    }
}
