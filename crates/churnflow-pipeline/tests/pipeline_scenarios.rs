//! End-to-end pipeline runs against the in-memory stores

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use churnflow_common::types::{ContractType, PaymentMethod};
use churnflow_pipeline::error::ErrorKind;
use churnflow_pipeline::schema::{Table, TableRow};
use churnflow_pipeline::transform::segment::{self, SegmentInputs};
use churnflow_pipeline::transform::TransformError;
use churnflow_pipeline::{
    JobStatus, MemoryPrimaryStore, MemoryWarehouse, Orchestrator, PipelineConfig,
    PipelineRequest, PrimaryStore, RetryPolicy, RunOutcome, Warehouse,
};
use proptest::prelude::*;
use tempfile::NamedTempFile;

const HEADER: &str = "customerID,gender,SeniorCitizen,Partner,Dependents,tenure,PhoneService,MultipleLines,InternetService,OnlineSecurity,OnlineBackup,DeviceProtection,TechSupport,StreamingTV,StreamingMovies,Contract,PaperlessBilling,PaymentMethod,MonthlyCharges,TotalCharges,Churn";

const NEW_CUSTOMER: &str = "9237-HQITU";

const FIVE_ROWS: [&str; 5] = [
    "7590-VHVEG,Female,0,Yes,No,1,No,No phone service,DSL,No,Yes,No,No,No,No,Month-to-month,Yes,Electronic check,29.85,29.85,No",
    "5575-GNVDE,Male,0,No,No,34,Yes,No,DSL,Yes,No,Yes,No,No,No,One year,No,Mailed check,56.95,1889.5,No",
    "3668-QPYBK,Male,0,No,No,2,Yes,No,DSL,Yes,Yes,No,No,No,No,Month-to-month,Yes,Mailed check,53.85,108.15,Yes",
    "7795-CFOCW,Male,0,No,No,45,No,No phone service,DSL,Yes,No,Yes,Yes,No,No,One year,No,Bank transfer (automatic),42.30,1840.75,No",
    "9237-HQITU,Female,0,No,No,3,Yes,No,Fiber optic,No,No,No,No,No,No,Two year,Yes,Credit card (automatic),90.00, ,No",
];

struct Harness {
    orchestrator: Orchestrator,
    primary: MemoryPrimaryStore,
    warehouse: MemoryWarehouse,
}

impl Harness {
    fn new() -> Self {
        let primary = MemoryPrimaryStore::new("memory://primary");
        let warehouse = MemoryWarehouse::new("memory://warehouse");
        let mut config = PipelineConfig::default();
        config.batch_size = 2;
        config.retry = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(5),
        };
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(primary.clone()),
            Arc::new(warehouse.clone()),
        );
        Self {
            orchestrator,
            primary,
            warehouse,
        }
    }

    async fn run(&self, file: &NamedTempFile) -> RunOutcome {
        self.orchestrator
            .run(&PipelineRequest::new(file.path()))
            .await
    }
}

fn extract_file(rows: &[&str]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{HEADER}").unwrap();
    for row in rows {
        writeln!(file, "{row}").unwrap();
    }
    file.flush().unwrap();
    file
}

fn find<'a>(rows: &'a [TableRow], customer_id: &str) -> &'a TableRow {
    rows.iter()
        .find(|r| r.customer_id == customer_id)
        .unwrap_or_else(|| panic!("no row for {customer_id}"))
}

#[tokio::test]
async fn test_five_row_extract_end_to_end() {
    let harness = Harness::new();
    let file = extract_file(&FIVE_ROWS);

    let outcome = harness.run(&file).await;
    assert!(outcome.succeeded(), "{:?}", outcome.message);
    assert_eq!(outcome.records_processed, 5);

    let transform = outcome.transform.as_ref().unwrap();
    assert_eq!(transform.rows_accepted, 5);
    assert_eq!(transform.blank_total_charges, 1);

    let billing = harness.primary.fetch_rows(Table::Billing).await.unwrap();
    let new_billing = find(&billing, NEW_CUSTOMER);
    assert_eq!(new_billing.get("total_charges").unwrap().as_f64(), Some(0.0));

    let segments = harness.primary.fetch_rows(Table::Segments).await.unwrap();
    let new_segment = find(&segments, NEW_CUSTOMER);
    assert_eq!(
        new_segment.get("segment_name").unwrap().as_str(),
        Some(segment::NEW_CUSTOMERS)
    );
    assert_eq!(new_segment.get("segment_id").unwrap().as_i64(), Some(4));

    let log = harness.primary.commit_log().await;
    let demographics = log.iter().position(|t| *t == Table::Demographics).unwrap();
    let billing_commit = log.iter().position(|t| *t == Table::Billing).unwrap();
    assert!(demographics < billing_commit);

    let validation = outcome.validation.as_ref().unwrap();
    for table in Table::ALL {
        assert_eq!(validation.table(table).unwrap().completeness, 1.0, "{table}");
    }

    let sync = outcome.sync.as_ref().unwrap();
    for table in Table::ALL {
        assert_eq!(sync.merged(table), 5, "{table}");
        let mirrored = harness.warehouse.rows(table).await;
        assert_eq!(
            mirrored.iter().filter(|r| r.customer_id == NEW_CUSTOMER).count(),
            1,
            "{table}"
        );
    }

    let rerun = harness.run(&file).await;
    assert!(rerun.succeeded(), "{:?}", rerun.message);
    let sync = rerun.sync.as_ref().unwrap();
    for table in Table::ALL {
        assert_eq!(sync.merged(table), 0, "{table}");
        assert_eq!(harness.warehouse.count_rows(table).await.unwrap(), 5);
    }
}

#[tokio::test]
async fn test_reload_after_reset_keeps_one_warehouse_row_per_customer() {
    let harness = Harness::new();
    let file = extract_file(&FIVE_ROWS);
    assert!(harness.run(&file).await.succeeded());

    // the first sync happened on an earlier day
    harness.warehouse.backdate_partitions(1).await;
    harness.orchestrator.reset().await.unwrap();

    let reload = harness.run(&file).await;
    assert!(reload.succeeded(), "{:?}", reload.message);

    let sync = reload.sync.as_ref().unwrap();
    let recreated = harness.primary.fetch_rows(Table::Demographics).await.unwrap();
    let today = find(&recreated, NEW_CUSTOMER).created_at.unwrap().date_naive();
    for table in Table::ALL {
        assert_eq!(sync.tables[&table].inserted, 0, "{table}");
        assert_eq!(sync.tables[&table].updated, 5, "{table}");
        assert_eq!(harness.warehouse.count_rows(table).await.unwrap(), 5, "{table}");
        assert_eq!(
            harness.warehouse.partition_of(table, NEW_CUSTOMER).await,
            Some(today),
            "{table}"
        );
    }
}

#[tokio::test]
async fn test_invalid_contract_in_five_row_extract_loads_the_other_four() {
    let harness = Harness::new();
    let bad = FIVE_ROWS[3].replace("One year", "Three year");
    let rows = [FIVE_ROWS[0], FIVE_ROWS[1], FIVE_ROWS[2], bad.as_str(), FIVE_ROWS[4]];
    let file = extract_file(&rows);

    let outcome = harness.run(&file).await;
    assert!(outcome.succeeded(), "{:?}", outcome.message);
    assert_eq!(outcome.transform.as_ref().unwrap().rows_rejected, 1);
    assert_eq!(outcome.records_processed, 4);

    assert_eq!(outcome.rejected.len(), 1);
    let rejected = &outcome.rejected[0];
    assert_eq!(rejected.customer_id.as_deref(), Some("7795-CFOCW"));
    assert!(matches!(
        rejected.error,
        TransformError::InvalidValue { field: "Contract", .. }
    ));

    let loaded: HashSet<String> = harness
        .primary
        .fetch_rows(Table::Demographics)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.customer_id)
        .collect();
    assert_eq!(loaded.len(), 4);
    assert!(!loaded.contains("7795-CFOCW"));
}

#[tokio::test]
async fn test_loading_twice_is_idempotent() {
    let harness = Harness::new();
    let file = extract_file(&FIVE_ROWS);

    assert!(harness.run(&file).await.succeeded());
    let mut before = Vec::new();
    for table in Table::ALL {
        before.push(harness.primary.fetch_rows(table).await.unwrap());
    }

    let second = harness.run(&file).await;
    assert!(second.succeeded(), "{:?}", second.message);

    let load = second.load.as_ref().unwrap();
    for (table, rows) in Table::ALL.into_iter().zip(before) {
        let after = harness.primary.fetch_rows(table).await.unwrap();
        assert_eq!(after, rows, "{table}");
        assert_eq!(load.tables[&table].unchanged, 5, "{table}");
    }
}

#[tokio::test]
async fn test_every_child_row_has_a_parent() {
    let harness = Harness::new();
    let file = extract_file(&FIVE_ROWS);
    assert!(harness.run(&file).await.succeeded());

    let parents: HashSet<String> = harness
        .primary
        .fetch_rows(Table::Demographics)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.customer_id)
        .collect();

    for table in Table::ALL.into_iter().filter(|t| t.references_parent()) {
        for row in harness.primary.fetch_rows(table).await.unwrap() {
            assert!(parents.contains(&row.customer_id), "{table} orphan {}", row.customer_id);
        }
    }
}

#[tokio::test]
async fn test_churned_plus_active_is_total() {
    let harness = Harness::new();
    let file = extract_file(&FIVE_ROWS);

    let outcome = harness.run(&file).await;
    let churn = &outcome.validation.as_ref().unwrap().churn;

    assert_eq!(churn.total_customers, 5);
    assert_eq!(churn.churned, 1);
    assert_eq!(churn.churned + churn.active, churn.total_customers);
    assert_eq!(churn.churn_rate, 20.0);
}

#[tokio::test]
async fn test_concurrent_run_is_refused() {
    let harness = Harness::new();
    let file = extract_file(&FIVE_ROWS);
    let held = harness.primary.try_lock().await.unwrap().unwrap();

    let outcome = harness.run(&file).await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.failed_stage, Some(JobStatus::Pending));
    assert_eq!(outcome.error_kind, Some(ErrorKind::RunLockHeld));
    assert_eq!(harness.primary.count_rows(Table::Demographics).await.unwrap(), 0);

    let runs = harness.primary.job_runs().await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, JobStatus::Failed);

    held.release().await.unwrap();
    assert!(harness.run(&file).await.succeeded());
}

#[tokio::test]
async fn test_transient_write_failure_is_retried() {
    let harness = Harness::new();
    let file = extract_file(&FIVE_ROWS);
    harness.primary.fail_next_writes(2).await;

    let outcome = harness.run(&file).await;

    assert!(outcome.succeeded(), "{:?}", outcome.message);
    assert_eq!(harness.primary.count_rows(Table::Segments).await.unwrap(), 5);
}

#[tokio::test]
async fn test_persistent_connection_failure_fails_after_bounded_attempts() {
    let harness = Harness::new();
    let file = extract_file(&FIVE_ROWS);
    harness.primary.fail_next_writes(10).await;

    let outcome = harness.run(&file).await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.failed_stage, Some(JobStatus::Loading));
    assert_eq!(outcome.error_kind, Some(ErrorKind::Connection));
}

#[tokio::test]
async fn test_quality_gate_failure_stops_before_sync() {
    let harness = Harness::new();
    let junk: Vec<TableRow> = (0..10)
        .map(|i| TableRow {
            customer_id: format!("JUNK-{i}"),
            values: serde_json::json!({"tenure_months": 1, "contract_type": "Weekly"})
                .as_object()
                .unwrap()
                .clone(),
            created_at: None,
            updated_at: None,
        })
        .collect();
    harness.primary.insert_unchecked(Table::Contracts, junk).await;
    let file = extract_file(&FIVE_ROWS);

    let outcome = harness.run(&file).await;

    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.failed_stage, Some(JobStatus::Validating));
    assert_eq!(outcome.error_kind, Some(ErrorKind::Validation));
    assert!(outcome.sync.is_none());
    assert_eq!(harness.warehouse.count_rows(Table::Contracts).await.unwrap(), 0);
    // measurements survive the failed gate
    assert!(!harness.primary.quality_metrics().await.is_empty());
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let harness = Harness::new();
    let file = extract_file(&FIVE_ROWS);

    let outcome = harness
        .orchestrator
        .run(&PipelineRequest::new(file.path()).dry_run(true))
        .await;

    assert!(outcome.succeeded(), "{:?}", outcome.message);
    assert!(outcome.validation.is_some());
    assert!(outcome.load.is_none());
    for table in Table::ALL {
        assert_eq!(harness.primary.count_rows(table).await.unwrap(), 0);
        assert_eq!(harness.warehouse.count_rows(table).await.unwrap(), 0);
    }
    assert!(harness.primary.quality_metrics().await.is_empty());

    let runs = harness.primary.job_runs().await;
    let statuses: Vec<_> = runs[0].transitions.iter().map(|t| t.status).collect();
    assert_eq!(
        statuses,
        vec![
            JobStatus::Pending,
            JobStatus::Extracting,
            JobStatus::Transforming,
            JobStatus::Validating,
            JobStatus::Succeeded,
        ]
    );
}

#[tokio::test]
async fn test_missing_required_column_fails_extract() {
    let harness = Harness::new();
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{}", HEADER.replace(",PaymentMethod", "")).unwrap();
    file.flush().unwrap();

    let outcome = harness.run(&file).await;

    assert_eq!(outcome.failed_stage, Some(JobStatus::Extracting));
    assert_eq!(outcome.error_kind, Some(ErrorKind::Extract));
    assert!(outcome.message.unwrap().contains("PaymentMethod"));
}

#[tokio::test]
async fn test_job_history_lists_newest_first() {
    let harness = Harness::new();
    let file = extract_file(&FIVE_ROWS);

    let first = harness.run(&file).await;
    let second = harness.run(&file).await;

    let jobs = harness.orchestrator.recent_jobs(10).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].job_id, second.job_id);
    assert_eq!(jobs[1].job_id, first.job_id);
    assert_eq!(jobs[0].job_config["tables"].as_array().unwrap().len(), 6);
}

fn contract_types() -> impl Strategy<Value = ContractType> {
    prop_oneof![
        Just(ContractType::MonthToMonth),
        Just(ContractType::OneYear),
        Just(ContractType::TwoYear),
    ]
}

fn payment_methods() -> impl Strategy<Value = PaymentMethod> {
    prop_oneof![
        Just(PaymentMethod::ElectronicCheck),
        Just(PaymentMethod::MailedCheck),
        Just(PaymentMethod::BankTransfer),
        Just(PaymentMethod::CreditCard),
    ]
}

prop_compose! {
    fn segment_inputs()(
        tenure_months in 0i32..120,
        contract_type in contract_types(),
        monthly_charges in 0.0f64..200.0,
        payment_method in payment_methods(),
        churned in any::<bool>(),
    ) -> SegmentInputs {
        SegmentInputs { tenure_months, contract_type, monthly_charges, payment_method, churned }
    }
}

proptest! {
    #[test]
    fn prop_segmentation_is_deterministic(inputs in segment_inputs()) {
        let first = segment::assign("C-1", &inputs);
        let second = segment::assign("C-1", &inputs);
        prop_assert_eq!(&first, &second);
        prop_assert!((0..=100).contains(&first.risk_score));
        prop_assert!((1..=5).contains(&first.segment_id));
        prop_assert_eq!(first.segment_name.as_str(), segment::SEGMENT_NAMES[(first.segment_id - 1) as usize]);
    }
}
