//! Data-quality validation
//!
//! Measures completeness, uniqueness and validity for every sub-entity
//! table, records each measurement as a [`QualityMetric`], and gates the run
//! on configured minimums. The measurements themselves are pure functions of
//! the rows ([`measure_table`]), so the same checks apply to the loaded store
//! and to a dry run's transformed records.

use chrono::{DateTime, Utc};
use churnflow_common::types::CustomerRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::load::LoadReport;
use crate::schema::{Table, TableRow};
use crate::store::{PrimaryStore, StoreError};

pub const DEFAULT_MIN_COMPLETENESS: f64 = 0.95;
pub const DEFAULT_MIN_UNIQUENESS: f64 = 0.99;
pub const DEFAULT_MIN_VALIDITY: f64 = 0.98;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Completeness,
    Uniqueness,
    Validity,
}

impl MetricKind {
    pub const ALL: [MetricKind; 3] = [
        MetricKind::Completeness,
        MetricKind::Uniqueness,
        MetricKind::Validity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Completeness => "completeness",
            MetricKind::Uniqueness => "uniqueness",
            MetricKind::Validity => "validity",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimum acceptable value per metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    pub min_completeness: f64,
    pub min_uniqueness: f64,
    pub min_validity: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_completeness: DEFAULT_MIN_COMPLETENESS,
            min_uniqueness: DEFAULT_MIN_UNIQUENESS,
            min_validity: DEFAULT_MIN_VALIDITY,
        }
    }
}

impl QualityThresholds {
    pub fn minimum(&self, kind: MetricKind) -> f64 {
        match kind {
            MetricKind::Completeness => self.min_completeness,
            MetricKind::Uniqueness => self.min_uniqueness,
            MetricKind::Validity => self.min_validity,
        }
    }
}

/// One timestamped measurement, persisted to the primary store and the warehouse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetric {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub table: Table,
    pub metric: MetricKind,
    pub value: f64,
    pub threshold: f64,
    pub passed: bool,
    pub checked_at: DateTime<Utc>,
}

/// Metric values for one table
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TableQuality {
    pub table: Table,
    pub rows: u64,
    pub completeness: f64,
    pub uniqueness: f64,
    pub validity: f64,
}

impl TableQuality {
    pub fn value(&self, kind: MetricKind) -> f64 {
        match kind {
            MetricKind::Completeness => self.completeness,
            MetricKind::Uniqueness => self.uniqueness,
            MetricKind::Validity => self.validity,
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        1.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Measure one table's rows
///
/// - completeness: share of required values (the key included) that are present
/// - uniqueness: share of rows with a distinct `customer_id`
/// - validity: share of present, constrained values that fall in their domain
///
/// An empty table scores 1.0 on every metric.
pub fn measure_table(table: Table, rows: &[TableRow]) -> TableQuality {
    let required: Vec<_> = table.columns().iter().filter(|c| c.required).collect();
    let constrained: Vec<_> = table
        .columns()
        .iter()
        .filter(|c| c.domain.is_constrained())
        .collect();

    let mut present = 0u64;
    let mut checked = 0u64;
    let mut valid = 0u64;
    let mut distinct: HashSet<&str> = HashSet::with_capacity(rows.len());

    for row in rows {
        if !row.customer_id.trim().is_empty() {
            present += 1;
        }
        present += required.iter().filter(|c| row.get(c.name).is_some()).count() as u64;

        for column in &constrained {
            if let Some(value) = row.get(column.name) {
                checked += 1;
                if column.domain.accepts(value) {
                    valid += 1;
                }
            }
        }

        distinct.insert(row.customer_id.as_str());
    }

    let row_count = rows.len() as u64;
    TableQuality {
        table,
        rows: row_count,
        completeness: ratio(present, row_count * (required.len() as u64 + 1)),
        uniqueness: ratio(distinct.len() as u64, row_count),
        validity: ratio(valid, checked),
    }
}

/// Churn totals over the churn table
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ChurnSummary {
    pub total_customers: u64,
    pub churned: u64,
    pub active: u64,
    /// Percentage of customers churned
    pub churn_rate: f64,
}

pub fn summarize_churn(rows: &[TableRow]) -> ChurnSummary {
    let total_customers = rows.len() as u64;
    let churned = rows
        .iter()
        .filter(|row| row.get("churn_status").and_then(|v| v.as_bool()) == Some(true))
        .count() as u64;
    let churn_rate = if total_customers == 0 {
        0.0
    } else {
        (churned as f64 / total_customers as f64 * 10_000.0).round() / 100.0
    };

    ChurnSummary {
        total_customers,
        churned,
        active: total_customers - churned,
        churn_rate,
    }
}

/// A metric below its minimum
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateFailure {
    pub table: Table,
    pub metric: MetricKind,
    pub value: f64,
    pub threshold: f64,
}

impl fmt::Display for GateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:.4} < {:.4}",
            self.table, self.metric, self.value, self.threshold
        )
    }
}

fn describe(failures: &[GateFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Quality gate failed: {}", describe(failures))]
    GateFailed { failures: Vec<GateFailure> },

    #[error("{table} holds {stored} rows but the load wrote {loaded}")]
    RowCountMismatch { table: Table, loaded: u64, stored: u64 },

    #[error("Lost connection while validating: {0}")]
    Connection(String),

    #[error("Failed to read loaded state: {0}")]
    Store(String),
}

impl ValidationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ValidationError::Connection(_))
    }
}

impl From<StoreError> for ValidationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Connection(message) => ValidationError::Connection(message),
            other => ValidationError::Store(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub tables: Vec<TableQuality>,
    pub metrics: Vec<QualityMetric>,
    pub churn: ChurnSummary,
    pub failures: Vec<GateFailure>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn table(&self, table: Table) -> Option<&TableQuality> {
        self.tables.iter().find(|q| q.table == table)
    }
}

pub struct Validator {
    store: Arc<dyn PrimaryStore>,
    thresholds: QualityThresholds,
}

impl Validator {
    pub fn new(store: Arc<dyn PrimaryStore>, thresholds: QualityThresholds) -> Self {
        Self { store, thresholds }
    }

    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    /// Measure every table and compare against the thresholds
    pub fn evaluate(
        &self,
        job_id: Option<Uuid>,
        tables: &BTreeMap<Table, Vec<TableRow>>,
    ) -> ValidationReport {
        let checked_at = Utc::now();
        let mut report = ValidationReport {
            tables: Vec::with_capacity(tables.len()),
            metrics: Vec::with_capacity(tables.len() * MetricKind::ALL.len()),
            churn: tables
                .get(&Table::Churn)
                .map(|rows| summarize_churn(rows))
                .unwrap_or_default(),
            failures: Vec::new(),
        };

        for (table, rows) in tables {
            let quality = measure_table(*table, rows);
            for kind in MetricKind::ALL {
                let value = quality.value(kind);
                let threshold = self.thresholds.minimum(kind);
                let passed = value >= threshold;
                if !passed {
                    report.failures.push(GateFailure {
                        table: *table,
                        metric: kind,
                        value,
                        threshold,
                    });
                }
                report.metrics.push(QualityMetric {
                    id: Uuid::new_v4(),
                    job_id,
                    table: *table,
                    metric: kind,
                    value,
                    threshold,
                    passed,
                    checked_at,
                });
            }
            report.tables.push(quality);
        }

        report
    }

    fn gate(&self, report: ValidationReport) -> Result<ValidationReport, ValidationError> {
        if report.passed() {
            info!(
                tables = report.tables.len(),
                total_customers = report.churn.total_customers,
                churned = report.churn.churned,
                churn_rate = report.churn.churn_rate,
                "Quality gate passed"
            );
            Ok(report)
        } else {
            for failure in &report.failures {
                warn!(
                    table = %failure.table,
                    metric = %failure.metric,
                    value = failure.value,
                    threshold = failure.threshold,
                    "Quality metric below threshold"
                );
            }
            Err(ValidationError::GateFailed {
                failures: report.failures,
            })
        }
    }

    /// Validate the loaded state of the primary store
    ///
    /// Metrics are persisted before the gate is applied, so a failing run
    /// still leaves its measurements behind. When `loaded` is given, each
    /// table must hold at least as many rows as the load wrote.
    #[instrument(skip_all, fields(job_id = ?job_id))]
    pub async fn validate_store(
        &self,
        job_id: Option<Uuid>,
        loaded: Option<&LoadReport>,
    ) -> Result<ValidationReport, ValidationError> {
        let mut tables = BTreeMap::new();
        for table in Table::ALL {
            tables.insert(table, self.store.fetch_rows(table).await?);
        }

        let report = self.evaluate(job_id, &tables);
        self.store.record_quality(&report.metrics).await?;

        if let Some(loaded) = loaded {
            for (table, rows) in &tables {
                let stored = rows.len() as u64;
                let expected = loaded.rows(*table);
                if stored < expected {
                    return Err(ValidationError::RowCountMismatch {
                        table: *table,
                        loaded: expected,
                        stored,
                    });
                }
            }
        }

        self.gate(report)
    }

    /// Validate transformed records without touching the store
    pub fn validate_records(
        &self,
        job_id: Option<Uuid>,
        records: &[CustomerRecord],
    ) -> Result<ValidationReport, ValidationError> {
        let mut tables = BTreeMap::new();
        for table in Table::ALL {
            let rows = table
                .rows_from(records)
                .map_err(|e| ValidationError::Store(e.to_string()))?;
            tables.insert(table, rows);
        }
        self.gate(self.evaluate(job_id, &tables))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryPrimaryStore;
    use serde_json::json;

    fn row(customer_id: &str, values: serde_json::Value) -> TableRow {
        TableRow {
            customer_id: customer_id.to_string(),
            values: values.as_object().unwrap().clone(),
            created_at: None,
            updated_at: None,
        }
    }

    fn contract(customer_id: &str, tenure: serde_json::Value, kind: serde_json::Value) -> TableRow {
        row(customer_id, json!({"tenure_months": tenure, "contract_type": kind}))
    }

    #[test]
    fn test_complete_rows_score_one() {
        let rows: Vec<_> = (0..4)
            .map(|i| contract(&format!("c{i}"), json!(i), json!("One year")))
            .collect();
        let quality = measure_table(Table::Contracts, &rows);

        assert_eq!(quality.completeness, 1.0);
        assert_eq!(quality.uniqueness, 1.0);
        assert_eq!(quality.validity, 1.0);
    }

    #[test]
    fn test_one_duplicate_among_n() {
        let mut rows: Vec<_> = (0..9)
            .map(|i| contract(&format!("c{i}"), json!(1), json!("Two year")))
            .collect();
        rows.push(contract("c0", json!(1), json!("Two year")));

        let quality = measure_table(Table::Contracts, &rows);
        assert!((quality.uniqueness - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_missing_required_value_lowers_completeness() {
        let rows = vec![
            contract("a", json!(1), json!("One year")),
            contract("b", json!(null), json!("One year")),
        ];
        let quality = measure_table(Table::Contracts, &rows);

        // 6 required values (key + 2 columns per row), 5 present
        assert!((quality.completeness - 5.0 / 6.0).abs() < 1e-12);
        // nulls are not counted against validity
        assert_eq!(quality.validity, 1.0);
    }

    #[test]
    fn test_out_of_domain_value_lowers_validity() {
        let rows = vec![
            contract("a", json!(1), json!("One year")),
            contract("b", json!(-2), json!("Forever")),
        ];
        let quality = measure_table(Table::Contracts, &rows);
        assert!((quality.validity - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_empty_table_scores_one() {
        let quality = measure_table(Table::Segments, &[]);
        assert_eq!(quality.rows, 0);
        assert_eq!(quality.completeness, 1.0);
        assert_eq!(quality.uniqueness, 1.0);
        assert_eq!(quality.validity, 1.0);
    }

    #[test]
    fn test_churn_summary_partitions_customers() {
        let rows = vec![
            row("a", json!({"churn_status": true})),
            row("b", json!({"churn_status": false})),
            row("c", json!({"churn_status": false})),
        ];
        let summary = summarize_churn(&rows);

        assert_eq!(summary.total_customers, 3);
        assert_eq!(summary.churned + summary.active, summary.total_customers);
        assert_eq!(summary.churn_rate, 33.33);
    }

    #[test]
    fn test_gate_names_failing_metric() {
        let validator = Validator::new(
            Arc::new(MemoryPrimaryStore::new("memory://v")),
            QualityThresholds::default(),
        );
        let mut tables = BTreeMap::new();
        tables.insert(
            Table::Contracts,
            vec![contract("a", json!(1), json!("One year")), contract("a", json!(1), json!("One year"))],
        );

        let err = validator.gate(validator.evaluate(None, &tables)).unwrap_err();
        match &err {
            ValidationError::GateFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].metric, MetricKind::Uniqueness);
            },
            other => panic!("unexpected: {other}"),
        }
        assert!(!err.is_transient());
        assert!(err.to_string().contains("customer_contracts uniqueness 0.5000"));
    }

    #[tokio::test]
    async fn test_validate_store_persists_metrics_and_detects_lost_rows() {
        let store = MemoryPrimaryStore::new("memory://v");
        store
            .insert_unchecked(
                Table::Demographics,
                vec![row("a", json!({"gender": "Male", "senior_citizen": false, "partner": false, "dependents": false}))],
            )
            .await;
        let validator = Validator::new(Arc::new(store.clone()), QualityThresholds::default());

        let mut loaded = LoadReport::default();
        loaded.tables.insert(
            Table::Demographics,
            crate::load::TableLoadStats {
                rows: 2,
                ..Default::default()
            },
        );

        let err = validator.validate_store(None, Some(&loaded)).await.unwrap_err();
        assert_eq!(
            err,
            ValidationError::RowCountMismatch {
                table: Table::Demographics,
                loaded: 2,
                stored: 1
            }
        );
        assert_eq!(store.quality_metrics().await.len(), Table::ALL.len() * 3);
    }

    #[tokio::test]
    async fn test_read_failure_is_transient() {
        let store = MemoryPrimaryStore::new("memory://v");
        store.fail_next_reads(1).await;
        let validator = Validator::new(Arc::new(store), QualityThresholds::default());

        let err = validator.validate_store(None, None).await.unwrap_err();
        assert!(err.is_transient());
    }
}
