//! Table catalog for the customer sub-entity tables
//!
//! Each [`Table`] knows its physical name, its domain columns with their
//! constraints, and where it sits in the load order. Rows travel between the
//! stores as [`TableRow`]s: the customer key, a JSON map of domain columns,
//! and the audit timestamps owned by the store.

use chrono::{DateTime, NaiveDate, Utc};
use churnflow_common::types::{
    ContractType, CustomerRecord, Gender, InternetService, PaymentMethod, ServiceOption,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::transform::segment::SEGMENT_NAMES;

/// One of the six customer sub-entity tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Demographics,
    Services,
    Contracts,
    Billing,
    Churn,
    Segments,
}

impl Table {
    /// All tables, parents first
    pub const ALL: [Table; 6] = [
        Table::Demographics,
        Table::Services,
        Table::Contracts,
        Table::Billing,
        Table::Churn,
        Table::Segments,
    ];

    /// Physical table name, identical in the primary store and the warehouse
    pub fn name(&self) -> &'static str {
        match self {
            Table::Demographics => "customer_demographics",
            Table::Services => "customer_services",
            Table::Contracts => "customer_contracts",
            Table::Billing => "customer_billing",
            Table::Churn => "customer_churn",
            Table::Segments => "customer_segments",
        }
    }

    pub fn from_name(name: &str) -> Option<Table> {
        Table::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Load tier: 0 is committed first, tables sharing a tier may load concurrently
    pub fn load_tier(&self) -> usize {
        match self {
            Table::Demographics => 0,
            Table::Services | Table::Contracts | Table::Billing | Table::Churn => 1,
            Table::Segments => 2,
        }
    }

    /// Tables grouped by load tier, in commit order
    pub fn load_tiers() -> Vec<Vec<Table>> {
        let mut tiers: Vec<Vec<Table>> = Vec::new();
        for table in Table::ALL {
            let tier = table.load_tier();
            if tiers.len() <= tier {
                tiers.resize_with(tier + 1, Vec::new);
            }
            tiers[tier].push(table);
        }
        tiers
    }

    /// Whether rows of this table reference `customer_demographics`
    pub fn references_parent(&self) -> bool {
        !matches!(self, Table::Demographics)
    }

    /// Domain columns, excluding `customer_id` and the audit timestamps
    pub fn columns(&self) -> &'static [ColumnSpec] {
        match self {
            Table::Demographics => DEMOGRAPHICS_COLUMNS,
            Table::Services => SERVICES_COLUMNS,
            Table::Contracts => CONTRACTS_COLUMNS,
            Table::Billing => BILLING_COLUMNS,
            Table::Churn => CHURN_COLUMNS,
            Table::Segments => SEGMENTS_COLUMNS,
        }
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns().iter().map(|c| c.name).collect()
    }

    /// Every column a store must carry for this table
    pub fn physical_columns(&self) -> Vec<&'static str> {
        let mut names = vec![CUSTOMER_ID];
        names.extend(self.column_names());
        names.push(CREATED_AT);
        names.push(UPDATED_AT);
        names
    }

    /// Warehouse clustering column that accompanies `customer_id`
    pub fn cluster_column(&self) -> &'static str {
        match self {
            Table::Demographics => "gender",
            Table::Services => "internet_service",
            Table::Contracts => "contract_type",
            Table::Billing => "payment_method",
            Table::Churn => "churn_status",
            Table::Segments => "segment_name",
        }
    }

    /// Build this table's rows from transformed customer records
    pub fn rows_from(&self, records: &[CustomerRecord]) -> serde_json::Result<Vec<TableRow>> {
        records
            .iter()
            .map(|record| match self {
                Table::Demographics => TableRow::from_record(&record.demographics),
                Table::Services => TableRow::from_record(&record.services),
                Table::Contracts => TableRow::from_record(&record.contract),
                Table::Billing => TableRow::from_record(&record.billing),
                Table::Churn => TableRow::from_record(&record.churn),
                Table::Segments => TableRow::from_record(&record.segment),
            })
            .collect()
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub const CUSTOMER_ID: &str = "customer_id";
pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";
/// Warehouse-only column derived from `created_at`
pub const PARTITION_DATE: &str = "partition_date";

/// Allowed values for a column
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Domain {
    /// No constraint beyond the column type
    Any,
    Boolean,
    Date,
    /// One of a fixed set of labels
    Labels(&'static [&'static str]),
    NonNegative,
    /// Inclusive numeric range
    Range { min: f64, max: f64 },
}

impl Domain {
    /// Whether a non-null value belongs to the domain
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Domain::Any => true,
            Domain::Boolean => value.is_boolean(),
            Domain::Date => value
                .as_str()
                .is_some_and(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()),
            Domain::Labels(labels) => value.as_str().is_some_and(|s| labels.contains(&s)),
            Domain::NonNegative => value.as_f64().is_some_and(|n| n >= 0.0),
            Domain::Range { min, max } => value.as_f64().is_some_and(|n| n >= *min && n <= *max),
        }
    }

    /// Whether the domain constrains values at all
    pub fn is_constrained(&self) -> bool {
        !matches!(self, Domain::Any)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub required: bool,
    pub domain: Domain,
}

const fn required(name: &'static str, domain: Domain) -> ColumnSpec {
    ColumnSpec { name, required: true, domain }
}

const fn optional(name: &'static str, domain: Domain) -> ColumnSpec {
    ColumnSpec { name, required: false, domain }
}

const SERVICE_OPTION: Domain = Domain::Labels(ServiceOption::LABELS);

static DEMOGRAPHICS_COLUMNS: &[ColumnSpec] = &[
    required("gender", Domain::Labels(Gender::LABELS)),
    required("senior_citizen", Domain::Boolean),
    required("partner", Domain::Boolean),
    required("dependents", Domain::Boolean),
];

static SERVICES_COLUMNS: &[ColumnSpec] = &[
    required("phone_service", Domain::Boolean),
    required("multiple_lines", SERVICE_OPTION),
    required("internet_service", Domain::Labels(InternetService::LABELS)),
    required("online_security", SERVICE_OPTION),
    required("online_backup", SERVICE_OPTION),
    required("device_protection", SERVICE_OPTION),
    required("tech_support", SERVICE_OPTION),
    required("streaming_tv", SERVICE_OPTION),
    required("streaming_movies", SERVICE_OPTION),
];

static CONTRACTS_COLUMNS: &[ColumnSpec] = &[
    required("tenure_months", Domain::NonNegative),
    required("contract_type", Domain::Labels(ContractType::LABELS)),
];

static BILLING_COLUMNS: &[ColumnSpec] = &[
    required("monthly_charges", Domain::NonNegative),
    required("total_charges", Domain::NonNegative),
    required("payment_method", Domain::Labels(PaymentMethod::LABELS)),
    required("paperless_billing", Domain::Boolean),
];

static CHURN_COLUMNS: &[ColumnSpec] = &[
    required("churn_status", Domain::Boolean),
    optional("churn_date", Domain::Date),
    optional("churn_reason", Domain::Any),
];

static SEGMENTS_COLUMNS: &[ColumnSpec] = &[
    required("segment_id", Domain::Range { min: 1.0, max: 5.0 }),
    required("segment_name", Domain::Labels(SEGMENT_NAMES)),
    required("cltv_score", Domain::NonNegative),
    required("risk_score", Domain::Range { min: 0.0, max: 100.0 }),
    required("ruleset_version", Domain::Any),
];

/// One row of a sub-entity table as it moves between stores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub customer_id: String,
    /// Domain columns by name
    pub values: Map<String, Value>,
    /// Set by the store on first insert
    pub created_at: Option<DateTime<Utc>>,
    /// Set by the store whenever the domain columns change
    pub updated_at: Option<DateTime<Utc>>,
}

impl TableRow {
    /// Flatten a serializable sub-entity record into a row
    pub fn from_record<T: Serialize>(record: &T) -> serde_json::Result<Self> {
        let mut values = match serde_json::to_value(record)? {
            Value::Object(map) => map,
            other => {
                return Err(serde::ser::Error::custom(format!(
                    "expected a record object, got {}",
                    other
                )))
            },
        };

        let customer_id = match values.remove(CUSTOMER_ID) {
            Some(Value::String(id)) => id,
            _ => return Err(serde::ser::Error::custom("record has no string customer_id")),
        };

        Ok(Self {
            customer_id,
            values,
            created_at: None,
            updated_at: None,
        })
    }

    /// Rebuild a row from a store's JSON rendering of all physical columns
    pub fn from_json(mut object: Map<String, Value>) -> serde_json::Result<Self> {
        let customer_id = match object.remove(CUSTOMER_ID) {
            Some(Value::String(id)) => id,
            _ => return Err(serde::de::Error::missing_field(CUSTOMER_ID)),
        };
        let created_at = take_timestamp(&mut object, CREATED_AT)?;
        let updated_at = take_timestamp(&mut object, UPDATED_AT)?;
        object.remove(PARTITION_DATE);

        Ok(Self {
            customer_id,
            values: object,
            created_at,
            updated_at,
        })
    }

    /// Domain column value, `None` for absent or null
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column).filter(|v| !v.is_null())
    }

    /// Key plus domain columns, the shape stores accept for writes
    pub fn to_payload(&self) -> Value {
        let mut object = self.values.clone();
        object.insert(CUSTOMER_ID.to_string(), Value::String(self.customer_id.clone()));
        if let Some(created_at) = self.created_at {
            object.insert(CREATED_AT.to_string(), Value::String(created_at.to_rfc3339()));
        }
        if let Some(updated_at) = self.updated_at {
            object.insert(UPDATED_AT.to_string(), Value::String(updated_at.to_rfc3339()));
        }
        Value::Object(object)
    }

    /// Whether the domain columns differ from `other`
    ///
    /// Numbers compare by value so `1` and `1.0` read back from a store do
    /// not count as a change.
    pub fn content_differs(&self, other: &TableRow) -> bool {
        if self.values.len() != other.values.len() {
            return true;
        }
        self.values.iter().any(|(key, value)| match (value, other.values.get(key)) {
            (Value::Number(a), Some(Value::Number(b))) => a.as_f64() != b.as_f64(),
            (a, Some(b)) => a != b,
            (_, None) => true,
        })
    }
}

fn take_timestamp(
    object: &mut Map<String, Value>,
    column: &'static str,
) -> serde_json::Result<Option<DateTime<Utc>>> {
    match object.remove(column) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value).map(Some),
    }
}
