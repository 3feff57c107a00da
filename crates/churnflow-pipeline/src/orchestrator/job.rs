//! Job-run record and its status state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, PipelineError};

/// Pipeline run status
///
/// `PENDING → EXTRACTING → TRANSFORMING → LOADING → VALIDATING → SYNCING →
/// SUCCEEDED`, with `FAILED` reachable from any non-terminal status. A dry run
/// goes from `TRANSFORMING` straight to `VALIDATING` and ends there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Extracting,
    Transforming,
    Loading,
    Validating,
    Syncing,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Extracting => "EXTRACTING",
            JobStatus::Transforming => "TRANSFORMING",
            JobStatus::Loading => "LOADING",
            JobStatus::Validating => "VALIDATING",
            JobStatus::Syncing => "SYNCING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Stages whose work happens in a database
    pub fn is_network_bound(&self) -> bool {
        matches!(
            self,
            JobStatus::Loading | JobStatus::Validating | JobStatus::Syncing
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Pending, Extracting)
            | (Extracting, Transforming)
            | (Transforming, Loading)
            | (Transforming, Validating)
            | (Loading, Validating)
            | (Validating, Syncing)
            | (Validating, Succeeded)
            | (Syncing, Succeeded) => true,
            _ => false,
        }
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "PENDING" => JobStatus::Pending,
            "EXTRACTING" => JobStatus::Extracting,
            "TRANSFORMING" => JobStatus::Transforming,
            "LOADING" => JobStatus::Loading,
            "VALIDATING" => JobStatus::Validating,
            "SYNCING" => JobStatus::Syncing,
            "SUCCEEDED" => JobStatus::Succeeded,
            "FAILED" => JobStatus::Failed,
            _ => JobStatus::Pending,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a run's status history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTransition {
    pub status: JobStatus,
    pub at: DateTime<Utc>,
    pub records_processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The job-run record (maps to `etl_job_runs`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub job_id: Uuid,
    pub job_name: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub records_processed: u64,
    /// Status the run was in when it failed
    pub failed_stage: Option<JobStatus>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    /// Redacted run configuration
    pub job_config: serde_json::Value,
    pub transitions: Vec<StageTransition>,
}

impl JobRun {
    pub fn new(job_name: impl Into<String>, job_config: serde_json::Value) -> Self {
        let started_at = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            job_name: job_name.into(),
            status: JobStatus::Pending,
            started_at,
            ended_at: None,
            records_processed: 0,
            failed_stage: None,
            error_kind: None,
            error_message: None,
            job_config,
            transitions: vec![StageTransition {
                status: JobStatus::Pending,
                at: started_at,
                records_processed: 0,
                error_kind: None,
                message: None,
            }],
        }
    }

    fn push(&mut self, status: JobStatus, error_kind: Option<ErrorKind>, message: Option<String>) {
        if !self.status.can_transition_to(status) {
            warn!(
                job_id = %self.job_id,
                from = %self.status,
                to = %status,
                "Unexpected status transition"
            );
        }
        self.status = status;
        self.transitions.push(StageTransition {
            status,
            at: Utc::now(),
            records_processed: self.records_processed,
            error_kind,
            message,
        });
    }

    /// Move to the next stage
    pub fn advance(&mut self, status: JobStatus) {
        self.push(status, None, None);
        info!(
            job_id = %self.job_id,
            status = %status,
            records_processed = self.records_processed,
            "Job status changed"
        );
    }

    pub fn set_records_processed(&mut self, count: u64) {
        self.records_processed = count;
    }

    pub fn succeed(&mut self) {
        self.ended_at = Some(Utc::now());
        self.advance(JobStatus::Succeeded);
    }

    /// Record the failure against the current stage and end the run
    pub fn fail(&mut self, err: &PipelineError) {
        let kind = err.kind();
        let message = err.to_string();
        self.failed_stage = Some(self.status);
        self.error_kind = Some(kind);
        self.error_message = Some(message.clone());
        self.ended_at = Some(Utc::now());
        self.push(JobStatus::Failed, Some(kind), Some(message));
        error!(
            job_id = %self.job_id,
            failed_stage = ?self.failed_stage.map(|s| s.as_str()),
            error_kind = %kind,
            records_processed = self.records_processed,
            error = %err,
            "Job failed"
        );
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }
}
