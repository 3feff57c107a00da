//! Customer domain model
//!
//! A customer is decomposed into six sub-entity records, each keyed by the
//! customer's `customer_id`. Enum values serialize to the labels used by the
//! source extract, which are also the values stored in both databases.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ChurnflowError;

fn normalized(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Customer gender as recorded in the extract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub const LABELS: &'static [&'static str] = &["Male", "Female"];

    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "Male",
            Gender::Female => "Female",
        }
    }
}

impl FromStr for Gender {
    type Err = ChurnflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "male" => Ok(Gender::Male),
            "female" => Ok(Gender::Female),
            _ => Err(ChurnflowError::invalid_value("gender", s)),
        }
    }
}

/// Sub-service subscription state
///
/// The extract spells the third state per parent service ("No phone service",
/// "No internet service"); both collapse into [`ServiceOption::NoService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceOption {
    Yes,
    No,
    #[serde(rename = "No service available")]
    NoService,
}

impl ServiceOption {
    pub const LABELS: &'static [&'static str] = &["Yes", "No", "No service available"];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceOption::Yes => "Yes",
            ServiceOption::No => "No",
            ServiceOption::NoService => "No service available",
        }
    }
}

impl FromStr for ServiceOption {
    type Err = ChurnflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "yes" => Ok(ServiceOption::Yes),
            "no" => Ok(ServiceOption::No),
            "no phone service" | "no internet service" | "no service available" => {
                Ok(ServiceOption::NoService)
            },
            _ => Err(ChurnflowError::invalid_value("service option", s)),
        }
    }
}

/// Internet service line type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InternetService {
    #[serde(rename = "DSL")]
    Dsl,
    #[serde(rename = "Fiber optic")]
    FiberOptic,
    No,
}

impl InternetService {
    pub const LABELS: &'static [&'static str] = &["DSL", "Fiber optic", "No"];

    pub fn as_str(&self) -> &'static str {
        match self {
            InternetService::Dsl => "DSL",
            InternetService::FiberOptic => "Fiber optic",
            InternetService::No => "No",
        }
    }
}

impl FromStr for InternetService {
    type Err = ChurnflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "dsl" => Ok(InternetService::Dsl),
            "fiber optic" => Ok(InternetService::FiberOptic),
            "no" => Ok(InternetService::No),
            _ => Err(ChurnflowError::invalid_value("internet service", s)),
        }
    }
}

/// Contract term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractType {
    #[serde(rename = "Month-to-month")]
    MonthToMonth,
    #[serde(rename = "One year")]
    OneYear,
    #[serde(rename = "Two year")]
    TwoYear,
}

impl ContractType {
    pub const LABELS: &'static [&'static str] = &["Month-to-month", "One year", "Two year"];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContractType::MonthToMonth => "Month-to-month",
            ContractType::OneYear => "One year",
            ContractType::TwoYear => "Two year",
        }
    }
}

impl FromStr for ContractType {
    type Err = ChurnflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "month-to-month" => Ok(ContractType::MonthToMonth),
            "one year" => Ok(ContractType::OneYear),
            "two year" => Ok(ContractType::TwoYear),
            _ => Err(ChurnflowError::invalid_value("contract type", s)),
        }
    }
}

/// Payment method on the billing account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    #[serde(rename = "Electronic check")]
    ElectronicCheck,
    #[serde(rename = "Mailed check")]
    MailedCheck,
    #[serde(rename = "Bank transfer (automatic)")]
    BankTransfer,
    #[serde(rename = "Credit card (automatic)")]
    CreditCard,
}

impl PaymentMethod {
    pub const LABELS: &'static [&'static str] = &[
        "Electronic check",
        "Mailed check",
        "Bank transfer (automatic)",
        "Credit card (automatic)",
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::ElectronicCheck => "Electronic check",
            PaymentMethod::MailedCheck => "Mailed check",
            PaymentMethod::BankTransfer => "Bank transfer (automatic)",
            PaymentMethod::CreditCard => "Credit card (automatic)",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = ChurnflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalized(s).as_str() {
            "electronic check" => Ok(PaymentMethod::ElectronicCheck),
            "mailed check" => Ok(PaymentMethod::MailedCheck),
            "bank transfer (automatic)" => Ok(PaymentMethod::BankTransfer),
            "credit card (automatic)" => Ok(PaymentMethod::CreditCard),
            _ => Err(ChurnflowError::invalid_value("payment method", s)),
        }
    }
}

macro_rules! impl_display_via_as_str {
    ($($ty:ty),+) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        })+
    };
}

impl_display_via_as_str!(Gender, ServiceOption, InternetService, ContractType, PaymentMethod);

/// Demographic facet; every other sub-entity references this row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Demographics {
    pub customer_id: String,
    pub gender: Gender,
    pub senior_citizen: bool,
    pub partner: bool,
    pub dependents: bool,
}

/// Subscribed services
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Services {
    pub customer_id: String,
    pub phone_service: bool,
    pub multiple_lines: ServiceOption,
    pub internet_service: InternetService,
    pub online_security: ServiceOption,
    pub online_backup: ServiceOption,
    pub device_protection: ServiceOption,
    pub tech_support: ServiceOption,
    pub streaming_tv: ServiceOption,
    pub streaming_movies: ServiceOption,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub customer_id: String,
    pub tenure_months: i32,
    pub contract_type: ContractType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Billing {
    pub customer_id: String,
    pub monthly_charges: f64,
    /// Blank in the extract for customers not yet billed; stored as 0
    pub total_charges: f64,
    pub payment_method: PaymentMethod,
    pub paperless_billing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Churn {
    pub customer_id: String,
    pub churn_status: bool,
    pub churn_date: Option<NaiveDate>,
    pub churn_reason: Option<String>,
}

/// Derived classification produced by the segmentation rule engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub customer_id: String,
    pub segment_id: i16,
    pub segment_name: String,
    pub cltv_score: f64,
    pub risk_score: i32,
    pub ruleset_version: String,
}

/// All six sub-entity records built from one source row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub demographics: Demographics,
    pub services: Services,
    pub contract: Contract,
    pub billing: Billing,
    pub churn: Churn,
    pub segment: Segment,
}

impl CustomerRecord {
    pub fn customer_id(&self) -> &str {
        &self.demographics.customer_id
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_type_from_str() {
        assert_eq!("Month-to-month".parse::<ContractType>().unwrap(), ContractType::MonthToMonth);
        assert_eq!(" one year ".parse::<ContractType>().unwrap(), ContractType::OneYear);
        assert_eq!("TWO YEAR".parse::<ContractType>().unwrap(), ContractType::TwoYear);
        assert!("Three year".parse::<ContractType>().is_err());
    }

    #[test]
    fn test_service_option_collapses_no_service_variants() {
        assert_eq!("No phone service".parse::<ServiceOption>().unwrap(), ServiceOption::NoService);
        assert_eq!(
            "No internet service".parse::<ServiceOption>().unwrap(),
            ServiceOption::NoService
        );
        assert_eq!(ServiceOption::NoService.as_str(), "No service available");
    }

    #[test]
    fn test_enum_serializes_to_source_label() {
        let json = serde_json::to_value(PaymentMethod::BankTransfer).unwrap();
        assert_eq!(json, serde_json::json!("Bank transfer (automatic)"));

        let json = serde_json::to_value(InternetService::FiberOptic).unwrap();
        assert_eq!(json, serde_json::json!("Fiber optic"));
    }

    #[test]
    fn test_labels_match_as_str() {
        for label in ContractType::LABELS {
            assert_eq!(label.parse::<ContractType>().unwrap().as_str(), *label);
        }
        for label in PaymentMethod::LABELS {
            assert_eq!(label.parse::<PaymentMethod>().unwrap().as_str(), *label);
        }
        for label in ServiceOption::LABELS {
            assert_eq!(label.parse::<ServiceOption>().unwrap().as_str(), *label);
        }
    }

    #[test]
    fn test_invalid_value_names_field() {
        let err = "Bitcoin".parse::<PaymentMethod>().unwrap_err();
        assert_eq!(err.to_string(), "Invalid value for payment method: 'Bitcoin'");
    }
}
