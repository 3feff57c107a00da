//! Row transformation
//!
//! Turns raw extract rows into typed [`CustomerRecord`]s, one sub-entity
//! record of each kind per accepted row. A row that fails any coercion is
//! rejected as a whole and counted; the rest of the extract carries on.

use churnflow_common::types::{
    Billing, Churn, Contract, CustomerRecord, Demographics, Services,
};
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::extract::{RawCustomerRow, SourceRow};

pub mod coerce;
pub mod segment;

use coerce::{
    optional_text, parse_amount, parse_bool, parse_label, parse_optional_date, parse_tenure,
    parse_total_charges,
};
use segment::SegmentInputs;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("Row has no customer id")]
    MissingCustomerId,

    #[error("Customer {0} appears more than once in the extract")]
    DuplicateCustomer(String),

    #[error("Field {field} has unrecognized boolean '{value}'")]
    InvalidBoolean { field: &'static str, value: String },

    #[error("Field {field} is not a number: '{value}'")]
    InvalidNumber { field: &'static str, value: String },

    #[error("Field {field} must not be negative: '{value}'")]
    Negative { field: &'static str, value: String },

    #[error("Field {field} has unrecognized value '{value}'")]
    InvalidValue { field: &'static str, value: String },

    #[error("Field {field} is not a YYYY-MM-DD date: '{value}'")]
    InvalidDate { field: &'static str, value: String },

    /// Every row of a non-empty extract was rejected
    #[error("All {rejected} rows were rejected")]
    NoValidRows { rejected: u64 },
}

/// A source row that failed transformation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRow {
    pub line: u64,
    pub customer_id: Option<String>,
    #[serde(serialize_with = "serialize_error")]
    pub error: TransformError,
}

fn serialize_error<S: serde::Serializer>(error: &TransformError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(error)
}

/// Counters describing one transform pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransformReport {
    pub rows_read: u64,
    pub rows_accepted: u64,
    pub rows_rejected: u64,
    /// Rows whose blank total charge was stored as 0
    pub blank_total_charges: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TransformOutput {
    pub records: Vec<CustomerRecord>,
    pub rejected: Vec<RejectedRow>,
    pub report: TransformReport,
}

/// A transformed row plus whether its total charge was defaulted
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRow {
    pub record: CustomerRecord,
    pub blank_total_charge: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Transformer;

impl Transformer {
    pub fn new() -> Self {
        Self
    }

    /// Transform a single raw row into all six sub-entity records
    pub fn transform_row(&self, raw: &RawCustomerRow) -> Result<TransformedRow, TransformError> {
        let customer_id = raw.customer_id.trim().to_string();
        if customer_id.is_empty() {
            return Err(TransformError::MissingCustomerId);
        }

        let demographics = Demographics {
            customer_id: customer_id.clone(),
            gender: parse_label("gender", &raw.gender)?,
            senior_citizen: parse_bool("SeniorCitizen", &raw.senior_citizen)?,
            partner: parse_bool("Partner", &raw.partner)?,
            dependents: parse_bool("Dependents", &raw.dependents)?,
        };

        let services = Services {
            customer_id: customer_id.clone(),
            phone_service: parse_bool("PhoneService", &raw.phone_service)?,
            multiple_lines: parse_label("MultipleLines", &raw.multiple_lines)?,
            internet_service: parse_label("InternetService", &raw.internet_service)?,
            online_security: parse_label("OnlineSecurity", &raw.online_security)?,
            online_backup: parse_label("OnlineBackup", &raw.online_backup)?,
            device_protection: parse_label("DeviceProtection", &raw.device_protection)?,
            tech_support: parse_label("TechSupport", &raw.tech_support)?,
            streaming_tv: parse_label("StreamingTV", &raw.streaming_tv)?,
            streaming_movies: parse_label("StreamingMovies", &raw.streaming_movies)?,
        };

        let contract = Contract {
            customer_id: customer_id.clone(),
            tenure_months: parse_tenure(&raw.tenure)?,
            contract_type: parse_label("Contract", &raw.contract)?,
        };

        let (total_charges, blank_total_charge) = parse_total_charges(&raw.total_charges)?;
        let billing = Billing {
            customer_id: customer_id.clone(),
            monthly_charges: parse_amount("MonthlyCharges", &raw.monthly_charges)?,
            total_charges,
            payment_method: parse_label("PaymentMethod", &raw.payment_method)?,
            paperless_billing: parse_bool("PaperlessBilling", &raw.paperless_billing)?,
        };

        let churn = Churn {
            customer_id: customer_id.clone(),
            churn_status: parse_bool("Churn", &raw.churn)?,
            churn_date: parse_optional_date("ChurnDate", raw.churn_date.as_deref())?,
            churn_reason: optional_text(raw.churn_reason.as_deref()),
        };

        let segment = segment::assign(
            &customer_id,
            &SegmentInputs::from_records(&contract, &billing, &churn),
        );

        Ok(TransformedRow {
            record: CustomerRecord {
                demographics,
                services,
                contract,
                billing,
                churn,
                segment,
            },
            blank_total_charge,
        })
    }

    /// Transform every row, isolating row-level failures
    ///
    /// A repeated customer id keeps its first occurrence. Fails only when the
    /// extract had rows and none survived.
    #[instrument(skip_all)]
    pub fn transform_all<I>(&self, rows: I) -> Result<TransformOutput, TransformError>
    where
        I: IntoIterator<Item = SourceRow>,
    {
        let mut output = TransformOutput::default();
        let mut seen: HashSet<String> = HashSet::new();

        for SourceRow { line, row } in rows {
            output.report.rows_read += 1;

            let result = self.transform_row(&row).and_then(|transformed| {
                if seen.insert(transformed.record.customer_id().to_string()) {
                    Ok(transformed)
                } else {
                    Err(TransformError::DuplicateCustomer(
                        transformed.record.customer_id().to_string(),
                    ))
                }
            });

            match result {
                Ok(transformed) => {
                    if transformed.blank_total_charge {
                        output.report.blank_total_charges += 1;
                        warn!(
                            line,
                            customer_id = %transformed.record.customer_id(),
                            "Blank total charge stored as 0"
                        );
                    }
                    output.report.rows_accepted += 1;
                    output.records.push(transformed.record);
                },
                Err(error) => {
                    warn!(line, customer_id = %row.customer_id.trim(), error = %error, "Row rejected");
                    output.report.rows_rejected += 1;
                    output.rejected.push(RejectedRow {
                        line,
                        customer_id: Some(row.customer_id.trim().to_string())
                            .filter(|id| !id.is_empty()),
                        error,
                    });
                },
            }
        }

        if output.report.rows_read > 0 && output.records.is_empty() {
            return Err(TransformError::NoValidRows {
                rejected: output.report.rows_rejected,
            });
        }

        info!(
            rows_read = output.report.rows_read,
            rows_accepted = output.report.rows_accepted,
            rows_rejected = output.report.rows_rejected,
            blank_total_charges = output.report.blank_total_charges,
            "Transform complete"
        );
        Ok(output)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use super::*;
    use churnflow_common::types::{ContractType, ServiceOption};

    pub(crate) fn raw_row(customer_id: &str) -> RawCustomerRow {
        RawCustomerRow {
            customer_id: customer_id.to_string(),
            gender: "Female".to_string(),
            senior_citizen: "0".to_string(),
            partner: "Yes".to_string(),
            dependents: "No".to_string(),
            tenure: "34".to_string(),
            phone_service: "Yes".to_string(),
            multiple_lines: "No".to_string(),
            internet_service: "DSL".to_string(),
            online_security: "Yes".to_string(),
            online_backup: "No".to_string(),
            device_protection: "Yes".to_string(),
            tech_support: "No".to_string(),
            streaming_tv: "No".to_string(),
            streaming_movies: "No".to_string(),
            contract: "One year".to_string(),
            paperless_billing: "No".to_string(),
            payment_method: "Mailed check".to_string(),
            monthly_charges: "56.95".to_string(),
            total_charges: "1889.5".to_string(),
            churn: "No".to_string(),
            churn_date: None,
            churn_reason: None,
        }
    }

    fn source(line: u64, row: RawCustomerRow) -> SourceRow {
        SourceRow { line, row }
    }

    #[test]
    fn test_transform_row_builds_all_sub_entities() {
        let transformed = Transformer::new().transform_row(&raw_row("5575-GNVDE")).unwrap();
        let record = transformed.record;

        assert_eq!(record.customer_id(), "5575-GNVDE");
        assert!(record.demographics.partner);
        assert_eq!(record.services.online_security, ServiceOption::Yes);
        assert_eq!(record.contract.contract_type, ContractType::OneYear);
        assert_eq!(record.billing.total_charges, 1889.5);
        assert!(!record.churn.churn_status);
        assert_eq!(record.segment.customer_id, "5575-GNVDE");
        assert!(!transformed.blank_total_charge);
    }

    #[test]
    fn test_invalid_contract_rejects_row() {
        let mut raw = raw_row("A");
        raw.contract = "Three year".to_string();

        let err = Transformer::new().transform_row(&raw).unwrap_err();
        assert_eq!(
            err,
            TransformError::InvalidValue {
                field: "Contract",
                value: "Three year".to_string()
            }
        );
    }

    #[test]
    fn test_transform_all_isolates_bad_rows() {
        let mut bad = raw_row("B");
        bad.partner = "Perhaps".to_string();
        let rows = vec![source(2, raw_row("A")), source(3, bad), source(4, raw_row("C"))];

        let output = Transformer::new().transform_all(rows).unwrap();

        assert_eq!(output.records.len(), 2);
        assert_eq!(output.rejected.len(), 1);
        assert_eq!(output.rejected[0].line, 3);
        assert_eq!(output.rejected[0].customer_id.as_deref(), Some("B"));
        assert_eq!(output.report.rows_read, 3);
    }

    #[test]
    fn test_duplicate_customer_keeps_first() {
        let mut second = raw_row("A");
        second.gender = "Male".to_string();
        let rows = vec![source(2, raw_row("A")), source(3, second)];

        let output = Transformer::new().transform_all(rows).unwrap();

        assert_eq!(output.records.len(), 1);
        assert_eq!(output.rejected[0].error, TransformError::DuplicateCustomer("A".to_string()));
    }

    #[test]
    fn test_blank_total_charge_is_counted() {
        let mut raw = raw_row("A");
        raw.tenure = "0".to_string();
        raw.total_charges = " ".to_string();

        let output = Transformer::new().transform_all(vec![source(2, raw)]).unwrap();

        assert_eq!(output.report.blank_total_charges, 1);
        assert_eq!(output.records[0].billing.total_charges, 0.0);
    }

    #[test]
    fn test_all_rows_rejected_fails() {
        let mut raw = raw_row("");
        raw.customer_id = "   ".to_string();

        let err = Transformer::new().transform_all(vec![source(2, raw)]).unwrap_err();
        assert_eq!(err, TransformError::NoValidRows { rejected: 1 });
    }

    #[test]
    fn test_empty_extract_is_not_an_error() {
        let output = Transformer::new().transform_all(Vec::new()).unwrap();
        assert!(output.records.is_empty());
    }
}
