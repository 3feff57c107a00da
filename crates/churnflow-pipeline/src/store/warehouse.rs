//! PostgreSQL analytics warehouse
//!
//! Mirrors the primary tables into a dedicated schema. Every table is range
//! partitioned on `partition_date` (the UTC date of `created_at`) with a
//! default partition, and carries a clustering index on `customer_id` plus
//! one domain column.
//!
//! A customer has exactly one row per table. The primary key has to include
//! the partition column, so a merge whose `created_at` lands in a new
//! partition removes the copy left in the old one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info};

use super::postgres::lazy_pool;
use super::{MergeOutcome, StoreError, StoreResult, Warehouse};
use crate::config::{is_valid_identifier, StoreDescriptor, DEFAULT_WAREHOUSE_SCHEMA};
use crate::schema::{Table, TableRow, PARTITION_DATE};
use crate::validate::QualityMetric;

const WAREHOUSE_SCHEMA_SQL: &str = include_str!("../../sql/warehouse_schema.sql");

/// Upsert the batch and report, per row, whether the customer was new.
///
/// `existing` is read from the statement snapshot, so it sees the table as it
/// was before the insert.
fn merge_sql(schema: &str, table: Table) -> String {
    let name = table.name();
    let columns = table.column_names();
    let column_list = columns.join(", ");
    let assignments = columns
        .iter()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"
        WITH incoming AS (
            SELECT customer_id, {column_list}, created_at, updated_at,
                   (created_at AT TIME ZONE 'UTC')::date AS {PARTITION_DATE}
            FROM jsonb_populate_recordset(NULL::{schema}.{name}, $1::jsonb)
        ),
        existing AS (
            SELECT DISTINCT w.customer_id
            FROM {schema}.{name} w
            JOIN incoming i ON i.customer_id = w.customer_id
        ),
        merged AS (
            INSERT INTO {schema}.{name} (customer_id, {column_list}, created_at, updated_at, {PARTITION_DATE})
            SELECT customer_id, {column_list}, created_at, updated_at, {PARTITION_DATE}
            FROM incoming
            ON CONFLICT (customer_id, {PARTITION_DATE}) DO UPDATE
            SET {assignments}, updated_at = EXCLUDED.updated_at
            RETURNING customer_id
        )
        SELECT NOT EXISTS (SELECT 1 FROM existing e WHERE e.customer_id = m.customer_id) AS inserted
        FROM merged m
        "#
    )
}

/// Drop copies of the batch's customers left in other partitions, e.g. after
/// the primary rows were recreated with a new `created_at`
fn prune_sql(schema: &str, table: Table) -> String {
    let name = table.name();
    format!(
        r#"
        DELETE FROM {schema}.{name} w
        USING jsonb_populate_recordset(NULL::{schema}.{name}, $1::jsonb) s
        WHERE w.customer_id = s.customer_id
          AND w.{PARTITION_DATE} <> (s.created_at AT TIME ZONE 'UTC')::date
        "#
    )
}

/// Warehouse backed by a PostgreSQL schema
pub struct PgWarehouse {
    pool: PgPool,
    schema: String,
    target: String,
}

impl PgWarehouse {
    pub fn connect_lazy(descriptor: &StoreDescriptor) -> StoreResult<Self> {
        let schema = descriptor
            .schema
            .clone()
            .unwrap_or_else(|| DEFAULT_WAREHOUSE_SCHEMA.to_string());
        let pool = lazy_pool(descriptor)?;
        info!(
            target_store = %descriptor.redacted_url(),
            schema = %schema,
            "Warehouse pool configured"
        );
        Self::from_pool(pool, schema, descriptor.redacted_url())
    }

    pub fn from_pool(
        pool: PgPool,
        schema: impl Into<String>,
        target: impl Into<String>,
    ) -> StoreResult<Self> {
        let schema = schema.into();
        if !is_valid_identifier(&schema) {
            return Err(StoreError::Query(format!("invalid warehouse schema name '{}'", schema)));
        }
        Ok(Self {
            pool,
            schema,
            target: target.into(),
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    fn target(&self) -> &str {
        &self.target
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        let ddl = WAREHOUSE_SCHEMA_SQL.replace("{schema}", &self.schema);
        sqlx::raw_sql(&ddl).execute(&self.pool).await?;
        debug!(schema = %self.schema, "Warehouse schema ensured");
        Ok(())
    }

    async fn table_columns(&self, table: Table) -> StoreResult<Vec<String>> {
        let columns = sqlx::query_scalar(
            r#"
            SELECT column_name::text
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2 AND column_name <> $3
            ORDER BY ordinal_position
            "#,
        )
        .bind(&self.schema)
        .bind(table.name())
        .bind(PARTITION_DATE)
        .fetch_all(&self.pool)
        .await?;
        Ok(columns)
    }

    async fn merge_rows(&self, table: Table, rows: &[TableRow]) -> StoreResult<MergeOutcome> {
        if rows.is_empty() {
            return Ok(MergeOutcome::default());
        }

        let payload = Value::Array(rows.iter().map(TableRow::to_payload).collect());

        let mut tx = self.pool.begin().await?;
        let inserted: Vec<bool> = sqlx::query_scalar(&merge_sql(&self.schema, table))
            .bind(payload.clone())
            .fetch_all(&mut *tx)
            .await?;
        let pruned = sqlx::query(&prune_sql(&self.schema, table))
            .bind(payload)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        if pruned > 0 {
            debug!(table = %table, pruned, "Moved rows to their current partition");
        }

        let new_rows = inserted.iter().filter(|i| **i).count() as u64;
        Ok(MergeOutcome {
            inserted: new_rows,
            updated: inserted.len() as u64 - new_rows,
        })
    }

    async fn watermark(&self, table: Table) -> StoreResult<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT watermark FROM {}.sync_watermarks WHERE table_name = $1",
            self.schema
        );
        let watermark = sqlx::query_scalar(&sql)
            .bind(table.name())
            .fetch_optional(&self.pool)
            .await?;
        Ok(watermark)
    }

    async fn set_watermark(&self, table: Table, watermark: DateTime<Utc>) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO {}.sync_watermarks (table_name, watermark, synced_at) \
             VALUES ($1, $2, NOW()) \
             ON CONFLICT (table_name) DO UPDATE \
             SET watermark = EXCLUDED.watermark, synced_at = EXCLUDED.synced_at",
            self.schema
        );
        sqlx::query(&sql)
            .bind(table.name())
            .bind(watermark)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_quality(&self, metrics: &[QualityMetric]) -> StoreResult<u64> {
        if metrics.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {}.data_quality_metrics \
             (id, table_name, metric_name, metric_value, threshold, passed, job_id, checked_at) ",
            self.schema
        ));
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
        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn count_rows(&self, table: Table) -> StoreResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}.{}", self.schema, table.name());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }
}
