//! Customer segmentation rule engine
//!
//! Scores each customer for lifetime value and churn risk, then assigns the
//! first segment whose rule matches. Rules are plain data, evaluated in
//! order, and the last rule always matches.

use churnflow_common::types::{Billing, Churn, Contract, ContractType, PaymentMethod, Segment};

/// Stored with every segment row so reclassification can be traced to the rules used
pub const RULESET_VERSION: &str = "v1";

pub const HIGH_VALUE_LOYAL: &str = "High Value Loyal";
pub const MEDIUM_VALUE_STABLE: &str = "Medium Value Stable";
pub const HIGH_RISK: &str = "High Risk";
pub const NEW_CUSTOMERS: &str = "New Customers";
pub const STANDARD: &str = "Standard";

pub const SEGMENT_NAMES: &[&str] = &[
    HIGH_VALUE_LOYAL,
    MEDIUM_VALUE_STABLE,
    HIGH_RISK,
    NEW_CUSTOMERS,
    STANDARD,
];

const MAX_RISK: i32 = 100;
const HIGH_MONTHLY_CHARGE: f64 = 80.0;
const SHORT_TENURE_MONTHS: i32 = 12;

/// Inputs the scores are computed from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentInputs {
    pub tenure_months: i32,
    pub contract_type: ContractType,
    pub monthly_charges: f64,
    pub payment_method: PaymentMethod,
    pub churned: bool,
}

impl SegmentInputs {
    pub fn from_records(contract: &Contract, billing: &Billing, churn: &Churn) -> Self {
        Self {
            tenure_months: contract.tenure_months,
            contract_type: contract.contract_type,
            monthly_charges: billing.monthly_charges,
            payment_method: billing.payment_method,
            churned: churn.churn_status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scores {
    pub cltv_score: f64,
    pub risk_score: i32,
    pub tenure_months: i32,
}

/// Customer lifetime value: monthly charge over the months served, to the cent
pub fn cltv_score(inputs: &SegmentInputs) -> f64 {
    let value = inputs.monthly_charges * f64::from(inputs.tenure_months);
    (value * 100.0).round() / 100.0
}

/// Churn risk on a 0-100 scale
///
/// The high-charge term applies to every internet service type, not only
/// fiber optic, so a segment depends on the contract, billing and churn
/// records alone. DSL customers paying over the threshold score 15 higher
/// than a fiber-only rule would give them.
pub fn risk_score(inputs: &SegmentInputs) -> i32 {
    let mut risk = match inputs.contract_type {
        ContractType::MonthToMonth => 30,
        ContractType::OneYear => 10,
        ContractType::TwoYear => 0,
    };
    if inputs.payment_method == PaymentMethod::ElectronicCheck {
        risk += 20;
    }
    if inputs.monthly_charges > HIGH_MONTHLY_CHARGE {
        risk += 15;
    }
    if inputs.tenure_months < SHORT_TENURE_MONTHS {
        risk += 25;
    }
    if inputs.churned {
        risk += 20;
    }
    risk.min(MAX_RISK)
}

pub fn score(inputs: &SegmentInputs) -> Scores {
    Scores {
        cltv_score: cltv_score(inputs),
        risk_score: risk_score(inputs),
        tenure_months: inputs.tenure_months,
    }
}

/// One classification rule: a predicate over the scores and the segment it yields
#[derive(Clone, Copy)]
pub struct SegmentRule {
    pub id: i16,
    pub name: &'static str,
    pub predicate: fn(&Scores) -> bool,
}

impl std::fmt::Debug for SegmentRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentRule")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

const FALLBACK: SegmentRule = SegmentRule {
    id: 5,
    name: STANDARD,
    predicate: |_| true,
};

/// Ordered rule list, first match wins
pub static RULES: [SegmentRule; 5] = [
    SegmentRule {
        id: 1,
        name: HIGH_VALUE_LOYAL,
        predicate: |s| s.risk_score < 20 && s.cltv_score > 2000.0,
    },
    SegmentRule {
        id: 2,
        name: MEDIUM_VALUE_STABLE,
        predicate: |s| s.risk_score < 40 && s.cltv_score > 1000.0,
    },
    SegmentRule {
        id: 3,
        name: HIGH_RISK,
        predicate: |s| s.risk_score > 60,
    },
    SegmentRule {
        id: 4,
        name: NEW_CUSTOMERS,
        predicate: |s| s.tenure_months < SHORT_TENURE_MONTHS,
    },
    FALLBACK,
];

/// First rule in `rules` matching `scores`; the fallback if none does
pub fn classify<'a>(rules: &'a [SegmentRule], scores: &Scores) -> &'a SegmentRule {
    rules
        .iter()
        .find(|rule| (rule.predicate)(scores))
        .unwrap_or(&FALLBACK)
}

/// Derive the segment record for one customer
pub fn assign(customer_id: &str, inputs: &SegmentInputs) -> Segment {
    let scores = score(inputs);
    let rule = classify(&RULES, &scores);
    Segment {
        customer_id: customer_id.to_string(),
        segment_id: rule.id,
        segment_name: rule.name.to_string(),
        cltv_score: scores.cltv_score,
        risk_score: scores.risk_score,
        ruleset_version: RULESET_VERSION.to_string(),
    }
}
