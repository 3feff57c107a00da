//! Sync bridge: incremental merge from the primary store into the warehouse
//!
//! Each table carries its own watermark, the latest `updated_at` already
//! merged. A sync selects rows updated strictly after it, merges them by
//! `customer_id`, and only then advances the watermark. A sync interrupted
//! between merge and watermark update replays the same window next time,
//! which the merge absorbs without duplicates.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::schema::Table;
use crate::store::{PrimaryStore, StoreError, Warehouse};
use crate::validate::QualityMetric;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// A primary column has no counterpart in the warehouse table
    #[error("Warehouse table {table} is missing columns: {}", missing.join(", "))]
    SchemaDrift { table: Table, missing: Vec<String> },

    #[error("Lost connection while syncing {scope}: {message}")]
    Connection { scope: String, message: String },

    #[error("Failed to sync {scope}: {message}")]
    Store { scope: String, message: String },
}

impl SyncError {
    fn from_store(scope: impl Into<String>, err: StoreError) -> Self {
        let scope = scope.into();
        match err {
            StoreError::Connection(message) => SyncError::Connection { scope, message },
            other => SyncError::Store {
                scope,
                message: other.to_string(),
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Connection { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableSyncStats {
    /// Rows past the previous watermark
    pub selected: u64,
    pub inserted: u64,
    pub updated: u64,
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub tables: BTreeMap<Table, TableSyncStats>,
    pub quality_appended: u64,
}

impl SyncReport {
    pub fn merged(&self, table: Table) -> u64 {
        self.tables.get(&table).map_or(0, |s| s.inserted + s.updated)
    }
}

pub struct SyncBridge {
    primary: Arc<dyn PrimaryStore>,
    warehouse: Arc<dyn Warehouse>,
    workers: usize,
}

impl SyncBridge {
    pub fn new(primary: Arc<dyn PrimaryStore>, warehouse: Arc<dyn Warehouse>, workers: usize) -> Self {
        Self {
            primary,
            warehouse,
            workers: workers.max(1),
        }
    }

    /// Fail with [`SyncError::SchemaDrift`] if the warehouse table lacks a primary column
    pub async fn check_drift(&self, table: Table) -> Result<(), SyncError> {
        let source = self
            .primary
            .table_columns(table)
            .await
            .map_err(|e| SyncError::from_store(table.name(), e))?;
        let target: HashSet<String> = self
            .warehouse
            .table_columns(table)
            .await
            .map_err(|e| SyncError::from_store(table.name(), e))?
            .into_iter()
            .collect();

        let missing: Vec<String> = source.into_iter().filter(|c| !target.contains(c)).collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SyncError::SchemaDrift { table, missing })
        }
    }

    /// Merge every table's changes and append this run's quality metrics
    #[instrument(skip_all, fields(warehouse = %self.warehouse.target()))]
    pub async fn sync(&self, quality: &[QualityMetric]) -> Result<SyncReport, SyncError> {
        self.warehouse
            .ensure_schema()
            .await
            .map_err(|e| SyncError::from_store("warehouse schema", e))?;

        let mut report = SyncReport::default();
        let mut finished = stream::iter(Table::ALL)
            .map(|table| self.sync_table(table))
            .buffer_unordered(self.workers);
        while let Some((table, stats)) = finished.try_next().await? {
            report.tables.insert(table, stats);
        }

        report.quality_appended = self
            .warehouse
            .append_quality(quality)
            .await
            .map_err(|e| SyncError::from_store("data_quality_metrics", e))?;

        info!(
            tables = report.tables.len(),
            rows_merged = report.tables.values().map(|s| s.inserted + s.updated).sum::<u64>(),
            quality_appended = report.quality_appended,
            "Sync complete"
        );
        Ok(report)
    }

    async fn sync_table(&self, table: Table) -> Result<(Table, TableSyncStats), SyncError> {
        self.check_drift(table).await?;
        let scope = table.name();

        let since = self
            .warehouse
            .watermark(table)
            .await
            .map_err(|e| SyncError::from_store(scope, e))?;
        let rows = self
            .primary
            .fetch_changed_since(table, since)
            .await
            .map_err(|e| SyncError::from_store(scope, e))?;

        if rows.is_empty() {
            debug!(table = %table, watermark = ?since, "No changes past watermark");
            return Ok((
                table,
                TableSyncStats {
                    watermark: since,
                    ..Default::default()
                },
            ));
        }

        let merged = self
            .warehouse
            .merge_rows(table, &rows)
            .await
            .map_err(|e| SyncError::from_store(scope, e))?;

        let next = rows.iter().filter_map(|r| r.updated_at).max().max(since);
        if let Some(mark) = next {
            self.warehouse
                .set_watermark(table, mark)
                .await
                .map_err(|e| SyncError::from_store(scope, e))?;
        }

        debug!(
            table = %table,
            selected = rows.len(),
            inserted = merged.inserted,
            updated = merged.updated,
            "Table synced"
        );
        Ok((
            table,
            TableSyncStats {
                selected: rows.len() as u64,
                inserted: merged.inserted,
                updated: merged.updated,
                watermark: next,
            },
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::load::Loader;
    use crate::store::{MemoryPrimaryStore, MemoryWarehouse};
    use crate::transform::tests::raw_row;
    use crate::transform::Transformer;

    async fn loaded_primary(ids: &[&str]) -> MemoryPrimaryStore {
        let store = MemoryPrimaryStore::new("memory://primary");
        let transformer = Transformer::new();
        let records: Vec<_> = ids
            .iter()
            .map(|id| transformer.transform_row(&raw_row(id)).unwrap().record)
            .collect();
        Loader::new(Arc::new(store.clone()), 100, 2).load(&records).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_second_sync_merges_nothing() {
        let primary = loaded_primary(&["A", "B"]).await;
        let warehouse = MemoryWarehouse::new("memory://warehouse");
        let bridge = SyncBridge::new(Arc::new(primary), Arc::new(warehouse.clone()), 3);

        let first = bridge.sync(&[]).await.unwrap();
        let second = bridge.sync(&[]).await.unwrap();

        for table in Table::ALL {
            assert_eq!(first.merged(table), 2, "{table}");
            assert_eq!(second.merged(table), 0, "{table}");
            assert_eq!(second.tables[&table].watermark, first.tables[&table].watermark);
        }
        assert_eq!(warehouse.count_rows(Table::Billing).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_replayed_window_creates_no_duplicates() {
        let primary = loaded_primary(&["A"]).await;
        let warehouse = MemoryWarehouse::new("memory://warehouse");
        let rows = primary.fetch_rows(Table::Churn).await.unwrap();
        warehouse.merge_rows(Table::Churn, &rows).await.unwrap();

        // watermark never advanced, so the window is replayed
        let bridge = SyncBridge::new(Arc::new(primary), Arc::new(warehouse.clone()), 1);
        let report = bridge.sync(&[]).await.unwrap();

        assert_eq!(report.tables[&Table::Churn].updated, 1);
        assert_eq!(report.tables[&Table::Churn].inserted, 0);
        assert_eq!(warehouse.count_rows(Table::Churn).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_warehouse_column_is_drift() {
        let primary = loaded_primary(&["A"]).await;
        let warehouse = MemoryWarehouse::new("memory://warehouse");
        warehouse.without_column(Table::Segments, "risk_score").await;
        let bridge = SyncBridge::new(Arc::new(primary), Arc::new(warehouse), 2);

        let err = bridge.sync(&[]).await.unwrap_err();
        assert_eq!(
            err,
            SyncError::SchemaDrift {
                table: Table::Segments,
                missing: vec!["risk_score".to_string()]
            }
        );
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_failed_merge_keeps_watermark() {
        let primary = loaded_primary(&["A"]).await;
        let warehouse = MemoryWarehouse::new("memory://warehouse");
        warehouse.fail_next_merges(1).await;
        let bridge = SyncBridge::new(Arc::new(primary), Arc::new(warehouse.clone()), 1);

        let err = bridge.sync(&[]).await.unwrap_err();
        assert!(err.is_transient());

        let retried = bridge.sync(&[]).await.unwrap();
        for table in Table::ALL {
            assert_eq!(retried.merged(table), 1, "{table}");
        }
    }
}
