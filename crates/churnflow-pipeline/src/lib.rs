//! Churnflow Pipeline
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Extract-transform-load pipeline for customer churn data: reads a flat CSV
//! extract, normalizes it into six sub-entity tables in a Postgres primary
//! store, scores every customer's value and churn risk, checks data quality,
//! and mirrors the result into a partitioned analytics warehouse.
//!
//! # Stages
//!
//! - [`extract`]: CSV source with required-column checks
//! - [`transform`]: type coercion and customer segmentation
//! - [`load`]: dependency-ordered, idempotent batch upserts
//! - [`validate`]: per-table completeness, uniqueness and validity gate
//! - [`sync`]: watermark-based incremental merge into the warehouse
//! - [`orchestrator`]: stage sequencing, retries, timeouts, job records
//!
//! # Example
//!
//! ```no_run
//! use churnflow_pipeline::{Orchestrator, PipelineConfig, PipelineRequest};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = PipelineConfig::load()?;
//! let orchestrator = Orchestrator::connect(config)?;
//! let outcome = orchestrator
//!     .run(&PipelineRequest::new("data/customers.csv"))
//!     .await;
//! println!("{}", outcome.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod extract;
pub mod load;
pub mod orchestrator;
pub mod schema;
pub mod store;
pub mod sync;
pub mod transform;
pub mod validate;

pub use config::{PipelineConfig, StageTimeouts, StoreDescriptor};
pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use orchestrator::{
    JobRun, JobStatus, Orchestrator, PipelineRequest, RetryPolicy, RunOutcome,
};
pub use schema::{Table, TableRow};
pub use store::{
    MemoryPrimaryStore, MemoryWarehouse, PgPrimaryStore, PgWarehouse, PrimaryStore, StoreError,
    Warehouse,
};
