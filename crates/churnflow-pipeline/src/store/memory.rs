//! In-process stores
//!
//! Mirror the PostgreSQL adapters' contract (foreign keys, check
//! constraints, content-aware `updated_at`, advisory run lock) without a
//! database. Used by dry runs in tests and by the integration suite. Failure
//! injection hooks simulate dropped connections and schema drift.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    LockRelease, MergeOutcome, PrimaryStore, RunLock, StoreError, StoreResult, UpsertOutcome,
    Warehouse,
};
use crate::orchestrator::job::JobRun;
use crate::schema::{Table, TableRow};
use crate::validate::QualityMetric;

/// Hands out strictly increasing timestamps so watermarks never tie
#[derive(Debug, Default)]
struct Clock {
    last: Option<DateTime<Utc>>,
}

impl Clock {
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.last {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last = Some(next);
        next
    }
}

#[derive(Debug, Default)]
struct PrimaryState {
    tables: HashMap<Table, BTreeMap<String, TableRow>>,
    quality: Vec<QualityMetric>,
    jobs: Vec<JobRun>,
    /// Table of every committed batch, in commit order
    commits: Vec<Table>,
    dropped_columns: HashMap<Table, HashSet<String>>,
    locked: bool,
    clock: Clock,
    failing_writes: u32,
    failing_reads: u32,
}

impl PrimaryState {
    fn take_write_failure(&mut self) -> StoreResult<()> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(StoreError::Connection("injected connection reset".to_string()));
        }
        Ok(())
    }

    fn take_read_failure(&mut self) -> StoreResult<()> {
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Err(StoreError::Connection("injected connection reset".to_string()));
        }
        Ok(())
    }
}

/// Primary store held in memory; clones share the same state
#[derive(Debug, Clone)]
pub struct MemoryPrimaryStore {
    target: String,
    state: Arc<Mutex<PrimaryState>>,
}

impl MemoryPrimaryStore {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            state: Arc::new(Mutex::new(PrimaryState::default())),
        }
    }

    /// Fail the next `count` batch writes with a connection error
    pub async fn fail_next_writes(&self, count: u32) {
        self.state.lock().await.failing_writes = count;
    }

    /// Fail the next `count` reads with a connection error
    pub async fn fail_next_reads(&self, count: u32) {
        self.state.lock().await.failing_reads = count;
    }

    /// Tables of committed batches, in commit order
    pub async fn commit_log(&self) -> Vec<Table> {
        self.state.lock().await.commits.clone()
    }

    pub async fn quality_metrics(&self) -> Vec<QualityMetric> {
        self.state.lock().await.quality.clone()
    }

    pub async fn job_runs(&self) -> Vec<JobRun> {
        self.state.lock().await.jobs.clone()
    }

    /// Write rows without constraint checks, as a corrupted store would hold them
    pub async fn insert_unchecked(&self, table: Table, rows: Vec<TableRow>) {
        let mut state = self.state.lock().await;
        let now = state.clock.tick();
        let entries = state.tables.entry(table).or_default();
        for mut row in rows {
            row.created_at.get_or_insert(now);
            row.updated_at.get_or_insert(now);
            entries.insert(row.customer_id.clone(), row);
        }
    }

    /// Remove rows behind the store's back, e.g. to simulate a lost write
    pub async fn delete_unchecked(&self, table: Table, customer_id: &str) {
        if let Some(rows) = self.state.lock().await.tables.get_mut(&table) {
            rows.remove(customer_id);
        }
    }

    pub async fn drop_column(&self, table: Table, column: &str) {
        self.state
            .lock()
            .await
            .dropped_columns
            .entry(table)
            .or_default()
            .insert(column.to_string());
    }
}

/// Check a batch the way the database's constraints would
fn check_batch(state: &PrimaryState, table: Table, rows: &[TableRow]) -> StoreResult<()> {
    let parents = state.tables.get(&Table::Demographics);
    let mut seen = HashSet::new();

    for row in rows {
        if !seen.insert(row.customer_id.as_str()) {
            return Err(StoreError::constraint(
                table.name(),
                format!("customer_id {} appears twice in one batch", row.customer_id),
            ));
        }

        if table.references_parent()
            && !parents.is_some_and(|p| p.contains_key(&row.customer_id))
        {
            return Err(StoreError::constraint(
                table.name(),
                format!(
                    "customer_id {} is not present in {}",
                    row.customer_id,
                    Table::Demographics
                ),
            ));
        }

        for column in table.columns() {
            match row.get(column.name) {
                None if column.required => {
                    return Err(StoreError::constraint(
                        table.name(),
                        format!("null value in column {}", column.name),
                    ));
                },
                Some(value) if !column.domain.accepts(value) => {
                    return Err(StoreError::constraint(
                        table.name(),
                        format!("value {} violates check on {}", value, column.name),
                    ));
                },
                _ => {},
            }
        }

        if let Some(unknown) = row
            .values
            .keys()
            .find(|k| !table.column_names().contains(&k.as_str()))
        {
            return Err(StoreError::Query(format!(
                "column {} does not exist in {}",
                unknown, table
            )));
        }
    }

    Ok(())
}

#[async_trait]
impl PrimaryStore for MemoryPrimaryStore {
    fn target(&self) -> &str {
        &self.target
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        for table in Table::ALL {
            state.tables.entry(table).or_default();
        }
        Ok(())
    }

    async fn reset(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.tables.clear();
        state.quality.clear();
        state.jobs.clear();
        state.commits.clear();
        state.dropped_columns.clear();
        for table in Table::ALL {
            state.tables.entry(table).or_default();
        }
        Ok(())
    }

    async fn upsert_batch(&self, table: Table, rows: &[TableRow]) -> StoreResult<UpsertOutcome> {
        let mut state = self.state.lock().await;
        state.take_write_failure()?;
        check_batch(&state, table, rows)?;

        let now = state.clock.tick();
        let entries = state.tables.entry(table).or_default();
        let mut outcome = UpsertOutcome::default();

        for row in rows {
            match entries.get_mut(&row.customer_id) {
                Some(existing) if existing.content_differs(row) => {
                    existing.values = row.values.clone();
                    existing.updated_at = Some(now);
                    outcome.updated += 1;
                },
                Some(_) => outcome.unchanged += 1,
                None => {
                    let mut fresh = row.clone();
                    fresh.created_at = Some(now);
                    fresh.updated_at = Some(now);
                    entries.insert(row.customer_id.clone(), fresh);
                    outcome.inserted += 1;
                },
            }
        }

        state.commits.push(table);
        Ok(outcome)
    }

    async fn fetch_rows(&self, table: Table) -> StoreResult<Vec<TableRow>> {
        let mut state = self.state.lock().await;
        state.take_read_failure()?;
        Ok(state
            .tables
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn fetch_changed_since(
        &self,
        table: Table,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<TableRow>> {
        let mut state = self.state.lock().await;
        state.take_read_failure()?;
        Ok(state
            .tables
            .get(&table)
            .map(|rows| {
                rows.values()
                    .filter(|row| match (since, row.updated_at) {
                        (None, _) => true,
                        (Some(mark), Some(updated)) => updated > mark,
                        (Some(_), None) => false,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn table_columns(&self, table: Table) -> StoreResult<Vec<String>> {
        let state = self.state.lock().await;
        let dropped = state.dropped_columns.get(&table);
        Ok(table
            .physical_columns()
            .into_iter()
            .filter(|c| !dropped.is_some_and(|d| d.contains(*c)))
            .map(str::to_string)
            .collect())
    }

    async fn count_rows(&self, table: Table) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        state.take_read_failure()?;
        Ok(state.tables.get(&table).map_or(0, |rows| rows.len() as u64))
    }

    async fn record_quality(&self, metrics: &[QualityMetric]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.take_write_failure()?;
        state.quality.extend_from_slice(metrics);
        Ok(())
    }

    async fn save_job_run(&self, run: &JobRun) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        match state.jobs.iter_mut().find(|j| j.job_id == run.job_id) {
            Some(existing) => *existing = run.clone(),
            None => state.jobs.push(run.clone()),
        }
        Ok(())
    }

    async fn recent_job_runs(&self, limit: i64) -> StoreResult<Vec<JobRun>> {
        let state = self.state.lock().await;
        let mut runs = state.jobs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(runs)
    }

    async fn try_lock(&self) -> StoreResult<Option<RunLock>> {
        let mut state = self.state.lock().await;
        if state.locked {
            return Ok(None);
        }
        state.locked = true;
        Ok(Some(RunLock::new(
            self.target.clone(),
            Box::new(MemoryLock {
                state: Arc::clone(&self.state),
            }),
        )))
    }
}

struct MemoryLock {
    state: Arc<Mutex<PrimaryState>>,
}

#[async_trait]
impl LockRelease for MemoryLock {
    async fn release(self: Box<Self>) -> StoreResult<()> {
        self.state.lock().await.locked = false;
        Ok(())
    }
}

/// Mirrored row and the partition it lives in
#[derive(Debug, Clone)]
struct PartitionedRow {
    partition_date: NaiveDate,
    row: TableRow,
}

#[derive(Debug, Default)]
struct WarehouseState {
    tables: HashMap<Table, BTreeMap<String, PartitionedRow>>,
    watermarks: HashMap<Table, DateTime<Utc>>,
    quality: BTreeMap<Uuid, QualityMetric>,
    missing_columns: HashMap<Table, HashSet<String>>,
    failing_merges: u32,
}

/// Warehouse held in memory; clones share the same state
#[derive(Debug, Clone)]
pub struct MemoryWarehouse {
    target: String,
    state: Arc<Mutex<WarehouseState>>,
}

impl MemoryWarehouse {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            state: Arc::new(Mutex::new(WarehouseState::default())),
        }
    }

    /// Pretend the target table was created without `column`
    pub async fn without_column(&self, table: Table, column: &str) {
        self.state
            .lock()
            .await
            .missing_columns
            .entry(table)
            .or_default()
            .insert(column.to_string());
    }

    /// Fail the next `count` merges with a connection error
    pub async fn fail_next_merges(&self, count: u32) {
        self.state.lock().await.failing_merges = count;
    }

    pub async fn rows(&self, table: Table) -> Vec<TableRow> {
        self.state
            .lock()
            .await
            .tables
            .get(&table)
            .map(|rows| rows.values().map(|p| p.row.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn partition_of(&self, table: Table, customer_id: &str) -> Option<NaiveDate> {
        self.state
            .lock()
            .await
            .tables
            .get(&table)
            .and_then(|rows| rows.get(customer_id))
            .map(|p| p.partition_date)
    }

    /// Move every mirrored row `days` partitions back, as an older sync would have left it
    pub async fn backdate_partitions(&self, days: i64) {
        let mut state = self.state.lock().await;
        for rows in state.tables.values_mut() {
            for entry in rows.values_mut() {
                entry.partition_date -= Duration::days(days);
            }
        }
    }

    pub async fn quality_metrics(&self) -> Vec<QualityMetric> {
        self.state.lock().await.quality.values().cloned().collect()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn target(&self) -> &str {
        &self.target
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        for table in Table::ALL {
            state.tables.entry(table).or_default();
        }
        Ok(())
    }

    async fn table_columns(&self, table: Table) -> StoreResult<Vec<String>> {
        let state = self.state.lock().await;
        let missing = state.missing_columns.get(&table);
        Ok(table
            .physical_columns()
            .into_iter()
            .filter(|c| !missing.is_some_and(|m| m.contains(*c)))
            .map(str::to_string)
            .collect())
    }

    async fn merge_rows(&self, table: Table, rows: &[TableRow]) -> StoreResult<MergeOutcome> {
        let mut state = self.state.lock().await;
        if state.failing_merges > 0 {
            state.failing_merges -= 1;
            return Err(StoreError::Connection("injected warehouse disconnect".to_string()));
        }

        let entries = state.tables.entry(table).or_default();
        let mut outcome = MergeOutcome::default();
        for row in rows {
            let created_at = row.created_at.ok_or_else(|| {
                StoreError::constraint(table.name(), format!("{} has no created_at", row.customer_id))
            })?;
            // one row per customer: a new partition date moves the row
            let entry = PartitionedRow {
                partition_date: created_at.date_naive(),
                row: row.clone(),
            };
            if entries.insert(row.customer_id.clone(), entry).is_some() {
                outcome.updated += 1;
            } else {
                outcome.inserted += 1;
            }
        }
        Ok(outcome)
    }

    async fn watermark(&self, table: Table) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.state.lock().await.watermarks.get(&table).copied())
    }

    async fn set_watermark(&self, table: Table, watermark: DateTime<Utc>) -> StoreResult<()> {
        self.state.lock().await.watermarks.insert(table, watermark);
        Ok(())
    }

    async fn append_quality(&self, metrics: &[QualityMetric]) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let mut added = 0;
        for metric in metrics {
            if !state.quality.contains_key(&metric.id) {
                state.quality.insert(metric.id, metric.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    async fn count_rows(&self, table: Table) -> StoreResult<u64> {
        Ok(self
            .state
            .lock()
            .await
            .tables
            .get(&table)
            .map_or(0, |rows| rows.len() as u64))
    }
}
