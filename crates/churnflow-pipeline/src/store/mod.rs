//! Storage adapters for the primary store and the analytics warehouse
//!
//! Stages talk to storage only through [`PrimaryStore`] and [`Warehouse`], so
//! the pipeline runs unchanged against PostgreSQL ([`postgres`],
//! [`warehouse`]) or the in-process stores in [`memory`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::orchestrator::job::JobRun;
use crate::schema::{Table, TableRow};
use crate::validate::QualityMetric;

pub mod memory;
pub mod postgres;
pub mod warehouse;

pub use memory::{MemoryPrimaryStore, MemoryWarehouse};
pub use postgres::PgPrimaryStore;
pub use warehouse::PgWarehouse;

/// Storage operation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The store could not be reached or dropped the connection
    #[error("Store connection failed: {0}")]
    Connection(String),

    /// A write violated a key, foreign-key, or check constraint
    #[error("Constraint violation on {table}: {message}")]
    Constraint { table: String, message: String },

    #[error("Store query failed: {0}")]
    Query(String),

    /// A row could not be converted to or from its stored form
    #[error("Row codec failed: {0}")]
    Codec(String),
}

impl StoreError {
    pub fn constraint(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Constraint {
            table: table.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection(err.to_string()),
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
                if code.starts_with("23") {
                    StoreError::constraint(db.table().unwrap_or("unknown"), db.message())
                } else if code.starts_with("08") || code == "57P01" || code == "57P03" {
                    // connection exception class, admin shutdown, cannot connect now
                    StoreError::Connection(err.to_string())
                } else {
                    StoreError::Query(err.to_string())
                }
            },
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Codec(err.to_string())
            },
            _ => StoreError::Query(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Row counts from an idempotent upsert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: u64,
    /// Existing rows whose content changed
    pub updated: u64,
    /// Existing rows left untouched, `updated_at` included
    pub unchanged: u64,
}

impl UpsertOutcome {
    pub fn written(&self) -> u64 {
        self.inserted + self.updated + self.unchanged
    }

    pub fn absorb(&mut self, other: UpsertOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
    }
}

/// Row counts from a warehouse merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: u64,
    pub updated: u64,
}

/// Releases a held run lock
#[async_trait]
pub trait LockRelease: Send {
    async fn release(self: Box<Self>) -> StoreResult<()>;
}

/// Exclusive claim on a primary store for the duration of one run
#[must_use = "a run lock must be released when the run ends"]
pub struct RunLock {
    target: String,
    inner: Box<dyn LockRelease>,
}

impl RunLock {
    pub fn new(target: impl Into<String>, inner: Box<dyn LockRelease>) -> Self {
        Self {
            target: target.into(),
            inner,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn release(self) -> StoreResult<()> {
        self.inner.release().await
    }
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock").field("target", &self.target).finish()
    }
}

/// Derive the advisory lock key for a store target
pub fn lock_key(target: &str) -> i64 {
    let digest = Sha256::digest(target.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Normalized primary store holding the six sub-entity tables plus run
/// bookkeeping (quality metrics and job runs)
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Stable identity of the store, used for run locking and logs
    fn target(&self) -> &str;

    /// Create tables, constraints, and views if they do not exist
    async fn ensure_schema(&self) -> StoreResult<()>;

    /// Drop and recreate all tables, discarding every row
    async fn reset(&self) -> StoreResult<()>;

    /// Insert-or-update a batch atomically, keyed by `customer_id`
    ///
    /// `updated_at` moves only for rows whose content changed.
    async fn upsert_batch(&self, table: Table, rows: &[TableRow]) -> StoreResult<UpsertOutcome>;

    /// All rows of a table, ordered by `customer_id`
    async fn fetch_rows(&self, table: Table) -> StoreResult<Vec<TableRow>>;

    /// Rows whose `updated_at` is strictly after `since` (all rows for `None`)
    async fn fetch_changed_since(
        &self,
        table: Table,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<TableRow>>;

    /// Physical column names of a table
    async fn table_columns(&self, table: Table) -> StoreResult<Vec<String>>;

    async fn count_rows(&self, table: Table) -> StoreResult<u64>;

    async fn record_quality(&self, metrics: &[QualityMetric]) -> StoreResult<()>;

    /// Insert or replace the job-run record with the same `job_id`
    async fn save_job_run(&self, run: &JobRun) -> StoreResult<()>;

    /// Most recent job runs, newest first
    async fn recent_job_runs(&self, limit: i64) -> StoreResult<Vec<JobRun>>;

    /// Claim the run lock; `None` when another run holds it
    async fn try_lock(&self) -> StoreResult<Option<RunLock>>;
}

/// Analytics warehouse mirroring the sub-entity tables
#[async_trait]
pub trait Warehouse: Send + Sync {
    fn target(&self) -> &str;

    /// Create the schema, partitioned tables, watermark and quality tables,
    /// and analytical views if they do not exist
    async fn ensure_schema(&self) -> StoreResult<()>;

    /// Physical column names of a mirrored table, partition column excluded
    async fn table_columns(&self, table: Table) -> StoreResult<Vec<String>>;

    /// Insert-or-update rows keyed by `customer_id`, keeping source timestamps
    async fn merge_rows(&self, table: Table, rows: &[TableRow]) -> StoreResult<MergeOutcome>;

    async fn watermark(&self, table: Table) -> StoreResult<Option<DateTime<Utc>>>;

    async fn set_watermark(&self, table: Table, watermark: DateTime<Utc>) -> StoreResult<()>;

    /// Append quality metrics, skipping ids already present; returns rows added
    async fn append_quality(&self, metrics: &[QualityMetric]) -> StoreResult<u64>;

    async fn count_rows(&self, table: Table) -> StoreResult<u64>;
}
