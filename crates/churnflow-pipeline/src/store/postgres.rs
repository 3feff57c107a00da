//! PostgreSQL primary store
//!
//! Writes go through `jsonb_populate_recordset` so one statement shape serves
//! all six tables; reads come back as `to_jsonb` objects. The run lock is a
//! session-level advisory lock held on a connection detached from the pool,
//! so it is released with the session even if the process dies mid-run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Connection, Executor, Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    lock_key, LockRelease, PrimaryStore, RunLock, StoreError, StoreResult, UpsertOutcome,
};
use crate::config::StoreDescriptor;
use crate::error::ErrorKind;
use crate::orchestrator::job::{JobRun, JobStatus, StageTransition};
use crate::schema::{Table, TableRow};
use crate::validate::QualityMetric;

const PRIMARY_SCHEMA_SQL: &str = include_str!("../../sql/primary_schema.sql");

const DROP_ALL_SQL: &str = r#"
DROP VIEW IF EXISTS churn_by_segment;
DROP VIEW IF EXISTS customer_complete_view;
DROP TABLE IF EXISTS customer_segments CASCADE;
DROP TABLE IF EXISTS customer_churn CASCADE;
DROP TABLE IF EXISTS customer_billing CASCADE;
DROP TABLE IF EXISTS customer_contracts CASCADE;
DROP TABLE IF EXISTS customer_services CASCADE;
DROP TABLE IF EXISTS customer_demographics CASCADE;
DROP TABLE IF EXISTS data_quality_metrics CASCADE;
DROP TABLE IF EXISTS etl_job_runs CASCADE;
"#;

/// Build a connection pool that connects on first use
///
/// Connection failures then surface inside the stage that needs the
/// database, where they are classified and retried.
pub(crate) fn lazy_pool(descriptor: &StoreDescriptor) -> StoreResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(descriptor.max_connections)
        .acquire_timeout(Duration::from_secs(descriptor.connect_timeout_secs))
        .connect_lazy(&descriptor.url)
        .map_err(|e| StoreError::Connection(format!("invalid connection descriptor: {}", e)))
}

fn upsert_sql(table: Table) -> String {
    let name = table.name();
    let columns = table.column_names();
    let column_list = columns.join(", ");
    let assignments = columns
        .iter()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let current = columns
        .iter()
        .map(|c| format!("{name}.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let incoming = columns
        .iter()
        .map(|c| format!("EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"
        INSERT INTO {name} (customer_id, {column_list}, created_at, updated_at)
        SELECT customer_id, {column_list}, NOW(), NOW()
        FROM jsonb_populate_recordset(NULL::{name}, $1::jsonb)
        ON CONFLICT (customer_id) DO UPDATE
        SET {assignments}, updated_at = NOW()
        WHERE ROW({current}) IS DISTINCT FROM ROW({incoming})
        RETURNING (xmax = 0) AS inserted
        "#
    )
}

pub(crate) fn rows_from_json(values: Vec<Value>) -> StoreResult<Vec<TableRow>> {
    values
        .into_iter()
        .map(|value| match value {
            Value::Object(object) => TableRow::from_json(object).map_err(StoreError::from),
            other => Err(StoreError::Codec(format!("expected a row object, got {}", other))),
        })
        .collect()
}

/// Primary store backed by PostgreSQL
pub struct PgPrimaryStore {
    pool: PgPool,
    target: String,
}

impl PgPrimaryStore {
    pub fn connect_lazy(descriptor: &StoreDescriptor) -> StoreResult<Self> {
        let pool = lazy_pool(descriptor)?;
        info!(
            target_store = %descriptor.redacted_url(),
            max_connections = descriptor.max_connections,
            "Primary store pool configured"
        );
        Ok(Self::from_pool(pool, descriptor.redacted_url()))
    }

    /// Wrap an existing pool; `target` identifies the store for run locking
    pub fn from_pool(pool: PgPool, target: impl Into<String>) -> Self {
        Self {
            pool,
            target: target.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PrimaryStore for PgPrimaryStore {
    fn target(&self) -> &str {
        &self.target
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(PRIMARY_SCHEMA_SQL).execute(&self.pool).await?;
        debug!("Primary schema ensured");
        Ok(())
    }

    async fn reset(&self) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        tx.execute(sqlx::raw_sql(DROP_ALL_SQL)).await?;
        tx.execute(sqlx::raw_sql(PRIMARY_SCHEMA_SQL)).await?;
        tx.commit().await?;
        info!(target_store = %self.target, "Primary store reset");
        Ok(())
    }

    async fn upsert_batch(&self, table: Table, rows: &[TableRow]) -> StoreResult<UpsertOutcome> {
        if rows.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        let payload = Value::Array(rows.iter().map(TableRow::to_payload).collect());
        let sql = upsert_sql(table);

        let mut tx = self.pool.begin().await?;
        let inserted: Vec<bool> = sqlx::query_scalar(&sql)
            .bind(payload)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        let new_rows = inserted.iter().filter(|i| **i).count() as u64;
        let changed = inserted.len() as u64 - new_rows;
        Ok(UpsertOutcome {
            inserted: new_rows,
            updated: changed,
            unchanged: rows.len() as u64 - new_rows - changed,
        })
    }

    async fn fetch_rows(&self, table: Table) -> StoreResult<Vec<TableRow>> {
        let sql = format!("SELECT to_jsonb(t) FROM {} t ORDER BY customer_id", table.name());
        let values: Vec<Value> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        rows_from_json(values)
    }

    async fn fetch_changed_since(
        &self,
        table: Table,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<TableRow>> {
        let sql = format!(
            "SELECT to_jsonb(t) FROM {} t \
             WHERE $1::timestamptz IS NULL OR t.updated_at > $1 \
             ORDER BY t.updated_at, t.customer_id",
            table.name()
        );
        let values: Vec<Value> = sqlx::query_scalar(&sql).bind(since).fetch_all(&self.pool).await?;
        rows_from_json(values)
    }

    async fn table_columns(&self, table: Table) -> StoreResult<Vec<String>> {
        let columns = sqlx::query_scalar(
            r#"
            SELECT column_name::text
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(table.name())
        .fetch_all(&self.pool)
        .await?;
        Ok(columns)
    }

    async fn count_rows(&self, table: Table) -> StoreResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn record_quality(&self, metrics: &[QualityMetric]) -> StoreResult<()> {
        if metrics.is_empty() {
            return Ok(());
        }

        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO data_quality_metrics \
             (id, table_name, metric_name, metric_value, threshold, passed, job_id, checked_at) ",
        );
        builder.push_values(metrics, |mut row, metric| {
            row.push_bind(metric.id)
                .push_bind(metric.table.name())
                .push_bind(metric.metric.as_str())
                .push_bind(metric.value)
                .push_bind(metric.threshold)
                .push_bind(metric.passed)
                .push_bind(metric.job_id)
                .push_bind(metric.checked_at);
        });
        builder.push(" ON CONFLICT (id) DO NOTHING");
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn save_job_run(&self, run: &JobRun) -> StoreResult<()> {
        let transitions = serde_json::to_value(&run.transitions)?;
        sqlx::query(
            r#"
            INSERT INTO etl_job_runs (
                job_id, job_name, status, started_at, ended_at, records_processed,
                failed_stage, error_kind, error_message, job_config, transitions
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (job_id) DO UPDATE SET
                status = EXCLUDED.status,
                ended_at = EXCLUDED.ended_at,
                records_processed = EXCLUDED.records_processed,
                failed_stage = EXCLUDED.failed_stage,
                error_kind = EXCLUDED.error_kind,
                error_message = EXCLUDED.error_message,
                transitions = EXCLUDED.transitions
            "#,
        )
        .bind(run.job_id)
        .bind(&run.job_name)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(run.records_processed as i64)
        .bind(run.failed_stage.map(|s| s.as_str()))
        .bind(run.error_kind.map(|k| k.as_str()))
        .bind(run.error_message.as_deref())
        .bind(&run.job_config)
        .bind(transitions)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_job_runs(&self, limit: i64) -> StoreResult<Vec<JobRun>> {
        let rows: Vec<JobRunRow> = sqlx::query_as(
            r#"
            SELECT job_id, job_name, status, started_at, ended_at, records_processed,
                   failed_stage, error_kind, error_message, job_config, transitions
            FROM etl_job_runs
            ORDER BY started_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRun::try_from).collect()
    }

    async fn try_lock(&self) -> StoreResult<Option<RunLock>> {
        let key = lock_key(&self.target);
        let mut conn = self.pool.acquire().await?.detach();

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut conn)
            .await?;

        if !acquired {
            conn.close().await?;
            return Ok(None);
        }

        debug!(target_store = %self.target, key, "Run lock acquired");
        Ok(Some(RunLock::new(
            self.target.clone(),
            Box::new(AdvisoryLock { conn, key }),
        )))
    }
}

struct AdvisoryLock {
    conn: PgConnection,
    key: i64,
}

#[async_trait]
impl LockRelease for AdvisoryLock {
    async fn release(self: Box<Self>) -> StoreResult<()> {
        let AdvisoryLock { mut conn, key } = *self;
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .execute(&mut conn)
            .await?;
        conn.close().await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct JobRunRow {
    job_id: Uuid,
    job_name: String,
    status: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    records_processed: i64,
    failed_stage: Option<String>,
    error_kind: Option<String>,
    error_message: Option<String>,
    job_config: Value,
    transitions: Value,
}

impl TryFrom<JobRunRow> for JobRun {
    type Error = StoreError;

    fn try_from(row: JobRunRow) -> Result<Self, Self::Error> {
        let transitions: Vec<StageTransition> = serde_json::from_value(row.transitions)?;
        Ok(JobRun {
            job_id: row.job_id,
            job_name: row.job_name,
            status: JobStatus::from(row.status),
            started_at: row.started_at,
            ended_at: row.ended_at,
            records_processed: row.records_processed.max(0) as u64,
            failed_stage: row.failed_stage.map(JobStatus::from),
            error_kind: row.error_kind.as_deref().and_then(ErrorKind::from_name),
            error_message: row.error_message,
            job_config: row.job_config,
            transitions,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_sql_guards_unchanged_rows() {
        let sql = upsert_sql(Table::Contracts);

        assert!(sql.contains("INSERT INTO customer_contracts (customer_id, tenure_months, contract_type"));
        assert!(sql.contains("ON CONFLICT (customer_id) DO UPDATE"));
        assert!(sql.contains(
            "WHERE ROW(customer_contracts.tenure_months, customer_contracts.contract_type) \
             IS DISTINCT FROM ROW(EXCLUDED.tenure_months, EXCLUDED.contract_type)"
        ));
    }

    #[test]
    fn test_schema_sql_declares_every_table() {
        for table in Table::ALL {
            assert!(
                PRIMARY_SCHEMA_SQL.contains(&format!("CREATE TABLE IF NOT EXISTS {}", table.name())),
                "{} missing from DDL",
                table
            );
            for column in table.column_names() {
                assert!(PRIMARY_SCHEMA_SQL.contains(column), "{}.{} missing", table, column);
            }
        }
        assert!(PRIMARY_SCHEMA_SQL.contains("customer_complete_view"));
        assert!(PRIMARY_SCHEMA_SQL.contains("churn_by_segment"));
    }

    #[test]
    fn test_rows_from_json_rejects_scalars() {
        let err = rows_from_json(vec![Value::from(3)]).unwrap_err();
        assert!(matches!(err, StoreError::Codec(_)));
    }
}
