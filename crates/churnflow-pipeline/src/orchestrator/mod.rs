//! Orchestrator: runs the stages in order and owns the job-run record
//!
//! A run claims the primary store's run lock, then moves through
//! `EXTRACTING → TRANSFORMING → LOADING → VALIDATING → SYNCING`. The job
//! record is saved on every transition. Store-bound stages are wrapped in the
//! retry policy and a per-stage timeout; extract and transform run on the
//! blocking pool under their own timeout and are never retried.

pub mod job;
pub mod retry;

use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::extract::{Extractor, SourceRow};
use crate::load::{LoadReport, Loader};
use crate::schema::Table;
use crate::store::{
    PgPrimaryStore, PgWarehouse, PrimaryStore, RunLock, StoreResult, Warehouse,
};
use crate::sync::{SyncBridge, SyncReport};
use crate::transform::segment::RULESET_VERSION;
use crate::transform::{RejectedRow, TransformOutput, TransformReport, Transformer};
use crate::validate::{ValidationReport, Validator};

pub use job::{JobRun, JobStatus, StageTransition};
pub use retry::RetryPolicy;

/// What to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRequest {
    pub source: PathBuf,
    /// Extract, transform and validate only; nothing is written
    pub dry_run: bool,
}

impl PipelineRequest {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Terminal state of a run plus whatever each finished stage reported
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub job_id: Uuid,
    pub job_name: String,
    pub status: JobStatus,
    pub dry_run: bool,
    pub failed_stage: Option<JobStatus>,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
    pub records_processed: u64,
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform: Option<TransformReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncReport>,
}

impl RunOutcome {
    fn new(job: &JobRun, dry_run: bool) -> Self {
        Self {
            job_id: job.job_id,
            job_name: job.job_name.clone(),
            status: job.status,
            dry_run,
            failed_stage: None,
            error_kind: None,
            message: None,
            records_processed: 0,
            duration_ms: None,
            transform: None,
            rejected: Vec::new(),
            load: None,
            validation: None,
            sync: None,
        }
    }

    fn finish(mut self, job: &JobRun) -> Self {
        self.status = job.status;
        self.failed_stage = job.failed_stage;
        self.error_kind = job.error_kind;
        self.message = job.error_message.clone();
        self.records_processed = job.records_processed;
        self.duration_ms = job.duration().map(|d| d.num_milliseconds());
        self
    }

    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

pub struct Orchestrator {
    config: PipelineConfig,
    primary: Arc<dyn PrimaryStore>,
    warehouse: Arc<dyn Warehouse>,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        primary: Arc<dyn PrimaryStore>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            config,
            primary,
            warehouse,
        }
    }

    /// Build Postgres-backed stores from the configured descriptors
    ///
    /// Pools connect lazily, so an unreachable database surfaces as a
    /// connection failure inside the run rather than here.
    pub fn connect(config: PipelineConfig) -> StoreResult<Self> {
        let primary = PgPrimaryStore::connect_lazy(&config.primary)?;
        let warehouse = PgWarehouse::connect_lazy(&config.warehouse)?;
        Ok(Self::new(config, Arc::new(primary), Arc::new(warehouse)))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run configuration stored on the job record, passwords redacted
    pub fn snapshot(&self, request: &PipelineRequest) -> serde_json::Value {
        let config = self.config.redacted();
        serde_json::json!({
            "source": request.source.display().to_string(),
            "dry_run": request.dry_run,
            "tables": Table::ALL.iter().map(|t| t.name()).collect::<Vec<_>>(),
            "ruleset_version": RULESET_VERSION,
            "destination": {
                "primary": config.primary.url,
                "warehouse": config.warehouse.url,
                "warehouse_schema": config.warehouse.schema,
            },
            "batch_size": config.batch_size,
            "worker_threads": config.worker_threads,
            "retry": config.retry,
            "thresholds": config.thresholds,
        })
    }

    /// Run the pipeline once
    ///
    /// Never returns an error: every failure ends up on the returned outcome
    /// and on the persisted job record.
    #[instrument(skip_all, fields(source = %request.source.display(), dry_run = request.dry_run))]
    pub async fn run(&self, request: &PipelineRequest) -> RunOutcome {
        let mut job = JobRun::new(self.config.job_name.clone(), self.snapshot(request));
        let mut outcome = RunOutcome::new(&job, request.dry_run);
        info!(job_id = %job.job_id, job_name = %job.job_name, "Pipeline run starting");

        let lock = match self.acquire_lock().await {
            Ok(lock) => lock,
            Err(err) => {
                job.fail(&err);
                self.persist(&job).await;
                return outcome.finish(&job);
            },
        };

        match self.execute(&mut job, request, &mut outcome).await {
            Ok(()) => job.succeed(),
            Err(err) => job.fail(&err),
        }
        self.persist(&job).await;

        if let Err(err) = lock.release().await {
            warn!(job_id = %job.job_id, error = %err, "Failed to release run lock");
        }

        info!(
            job_id = %job.job_id,
            status = %job.status,
            records_processed = job.records_processed,
            duration_ms = ?job.duration().map(|d| d.num_milliseconds()),
            "Pipeline run finished"
        );
        outcome.finish(&job)
    }

    async fn execute(
        &self,
        job: &mut JobRun,
        request: &PipelineRequest,
        outcome: &mut RunOutcome,
    ) -> PipelineResult<()> {
        let primary = &self.primary;
        self.config
            .retry
            .run(JobStatus::Pending, move || async move {
                primary.ensure_schema().await.map_err(PipelineError::from)
            })
            .await?;
        self.persist(job).await;

        self.enter(job, JobStatus::Extracting).await;
        let rows = self.extract(&request.source).await?;
        job.set_records_processed(rows.len() as u64);

        self.enter(job, JobStatus::Transforming).await;
        let TransformOutput {
            records,
            rejected,
            report,
        } = self.transform(rows).await?;
        job.set_records_processed(records.len() as u64);
        outcome.transform = Some(report);
        outcome.rejected = rejected;

        let validator = Validator::new(Arc::clone(&self.primary), self.config.thresholds);
        let job_id = job.job_id;

        if request.dry_run {
            self.enter(job, JobStatus::Validating).await;
            let report = validator.validate_records(Some(job_id), &records)?;
            outcome.validation = Some(report);
            return Ok(());
        }

        self.enter(job, JobStatus::Loading).await;
        let loader = Loader::new(
            Arc::clone(&self.primary),
            self.config.batch_size,
            self.config.worker_threads,
        );
        let (loader, batch) = (&loader, records.as_slice());
        let load = self
            .config
            .retry
            .run(JobStatus::Loading, move || {
                self.timed(JobStatus::Loading, loader.load(batch))
            })
            .await?;
        job.set_records_processed(load.customers());
        outcome.load = Some(load.clone());

        self.enter(job, JobStatus::Validating).await;
        let (validator, loaded) = (&validator, &load);
        let validation = self
            .config
            .retry
            .run(JobStatus::Validating, move || {
                self.timed(
                    JobStatus::Validating,
                    validator.validate_store(Some(job_id), Some(loaded)),
                )
            })
            .await?;
        outcome.validation = Some(validation.clone());

        self.enter(job, JobStatus::Syncing).await;
        let bridge = SyncBridge::new(
            Arc::clone(&self.primary),
            Arc::clone(&self.warehouse),
            self.config.worker_threads,
        );
        let (bridge, metrics) = (&bridge, validation.metrics.as_slice());
        let sync = self
            .config
            .retry
            .run(JobStatus::Syncing, move || {
                self.timed(JobStatus::Syncing, bridge.sync(metrics))
            })
            .await?;
        outcome.sync = Some(sync);

        Ok(())
    }

    async fn acquire_lock(&self) -> PipelineResult<RunLock> {
        let primary = &self.primary;
        self.config
            .retry
            .run(JobStatus::Pending, move || async move {
                primary
                    .try_lock()
                    .await?
                    .ok_or_else(|| PipelineError::RunLockHeld {
                        target: primary.target().to_string(),
                    })
            })
            .await
    }

    async fn extract(&self, source: &Path) -> PipelineResult<Vec<SourceRow>> {
        let path = source.to_path_buf();
        let task = tokio::task::spawn_blocking(move || Extractor::open(&path)?.collect_rows());
        self.blocking(JobStatus::Extracting, task).await
    }

    async fn transform(&self, rows: Vec<SourceRow>) -> PipelineResult<TransformOutput> {
        let task = tokio::task::spawn_blocking(move || Transformer::new().transform_all(rows));
        self.blocking(JobStatus::Transforming, task).await
    }

    /// Await a blocking-pool task under the stage timeout
    ///
    /// A timed-out task keeps running to completion on the pool; its result
    /// is dropped.
    async fn blocking<T, E>(
        &self,
        stage: JobStatus,
        task: JoinHandle<Result<T, E>>,
    ) -> PipelineResult<T>
    where
        E: Into<PipelineError>,
    {
        self.timed(stage, async move {
            match task.await {
                Ok(result) => result.map_err(Into::into),
                Err(err) => Err(PipelineError::TaskFailed {
                    stage,
                    message: err.to_string(),
                }),
            }
        })
        .await
    }

    async fn timed<T, E, F>(&self, stage: JobStatus, fut: F) -> PipelineResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<PipelineError>,
    {
        let limit = self.config.timeouts.for_status(stage);
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(PipelineError::StageTimeout {
                stage,
                timeout: limit,
            }),
        }
    }

    async fn enter(&self, job: &mut JobRun, status: JobStatus) {
        job.advance(status);
        self.persist(job).await;
    }

    async fn persist(&self, job: &JobRun) {
        if let Err(err) = self.primary.save_job_run(job).await {
            warn!(job_id = %job.job_id, status = %job.status, error = %err, "Failed to save job run");
        }
    }

    /// Drop and recreate every primary table
    ///
    /// Refuses while a run holds the lock.
    #[instrument(skip_all, fields(target = %self.primary.target()))]
    pub async fn reset(&self) -> PipelineResult<()> {
        let lock = self.acquire_lock().await?;
        let result = self.primary.reset().await.map_err(PipelineError::from);
        if let Err(err) = lock.release().await {
            warn!(error = %err, "Failed to release run lock");
        }
        result?;
        info!("Primary store reset");
        Ok(())
    }

    /// Most recent job runs, newest first
    pub async fn recent_jobs(&self, limit: i64) -> PipelineResult<Vec<JobRun>> {
        let primary = &self.primary;
        self.config
            .retry
            .run(JobStatus::Pending, move || async move {
                primary.recent_job_runs(limit).await.map_err(PipelineError::from)
            })
            .await
    }
}
