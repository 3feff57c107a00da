//! Loader: writes transformed records to the primary store
//!
//! Tables are written tier by tier so every child row finds its parent:
//! demographics first, then services, contracts, billing and churn on a
//! bounded set of concurrent workers, then segments. Within a table batches
//! go out one after another, each committed atomically. A failed batch stops
//! the load; batches already committed stay committed.

use churnflow_common::types::CustomerRecord;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::schema::{Table, TableRow};
use crate::store::{PrimaryStore, StoreError, UpsertOutcome};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("Lost connection while loading {table}: {message}")]
    Connection { table: Table, message: String },

    #[error("Batch {batch} of {table} rejected: {message}")]
    Constraint {
        table: Table,
        batch: usize,
        message: String,
    },

    #[error("Failed to write {table}: {message}")]
    Store { table: Table, message: String },
}

impl LoadError {
    fn from_store(table: Table, batch: usize, err: StoreError) -> Self {
        match err {
            StoreError::Connection(message) => LoadError::Connection { table, message },
            StoreError::Constraint { message, .. } => LoadError::Constraint {
                table,
                batch,
                message,
            },
            other => LoadError::Store {
                table,
                message: other.to_string(),
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, LoadError::Connection { .. })
    }
}

/// Rows written to one table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableLoadStats {
    /// Rows handed to the store
    pub rows: u64,
    pub batches: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub tables: BTreeMap<Table, TableLoadStats>,
    /// Tables in the order their last batch committed
    pub commit_order: Vec<Table>,
}

impl LoadReport {
    pub fn rows(&self, table: Table) -> u64 {
        self.tables.get(&table).map_or(0, |s| s.rows)
    }

    /// Customers loaded, counted by their parent rows
    pub fn customers(&self) -> u64 {
        self.rows(Table::Demographics)
    }
}

pub struct Loader {
    store: Arc<dyn PrimaryStore>,
    batch_size: usize,
    workers: usize,
}

impl Loader {
    pub fn new(store: Arc<dyn PrimaryStore>, batch_size: usize, workers: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            workers: workers.max(1),
        }
    }

    /// Write all records, tier by tier
    #[instrument(skip_all, fields(customers = records.len()))]
    pub async fn load(&self, records: &[CustomerRecord]) -> Result<LoadReport, LoadError> {
        let mut report = LoadReport::default();

        for tier in Table::load_tiers() {
            let mut finished = stream::iter(tier)
                .map(|table| self.load_table(table, records))
                .buffer_unordered(self.workers);

            while let Some((table, stats)) = finished.try_next().await? {
                report.tables.insert(table, stats);
                report.commit_order.push(table);
            }
        }

        info!(
            customers = report.customers(),
            tables = report.tables.len(),
            "Load complete"
        );
        Ok(report)
    }

    async fn load_table(
        &self,
        table: Table,
        records: &[CustomerRecord],
    ) -> Result<(Table, TableLoadStats), LoadError> {
        let rows: Vec<TableRow> = table.rows_from(records).map_err(|e| LoadError::Store {
            table,
            message: e.to_string(),
        })?;

        let mut outcome = UpsertOutcome::default();
        let mut batches = 0u64;
        for (index, batch) in rows.chunks(self.batch_size).enumerate() {
            let written = self
                .store
                .upsert_batch(table, batch)
                .await
                .map_err(|e| LoadError::from_store(table, index, e))?;
            debug!(
                table = %table,
                batch = index,
                rows = batch.len(),
                inserted = written.inserted,
                updated = written.updated,
                "Batch committed"
            );
            outcome.absorb(written);
            batches += 1;
        }

        Ok((
            table,
            TableLoadStats {
                rows: rows.len() as u64,
                batches,
                inserted: outcome.inserted,
                updated: outcome.updated,
                unchanged: outcome.unchanged,
            },
        ))
    }
}
