//! Field coercion from raw extract text to typed values

use chrono::NaiveDate;
use churnflow_common::ChurnflowError;
use std::str::FromStr;

use super::TransformError;

/// "Yes"/"No" (any case, surrounding whitespace ignored) or "1"/"0"
pub fn parse_bool(field: &'static str, raw: &str) -> Result<bool, TransformError> {
    match raw.trim().to_lowercase().as_str() {
        "yes" | "1" => Ok(true),
        "no" | "0" => Ok(false),
        _ => Err(TransformError::InvalidBoolean {
            field,
            value: raw.to_string(),
        }),
    }
}

pub fn parse_tenure(raw: &str) -> Result<i32, TransformError> {
    let field = "tenure";
    let value: i32 = raw.trim().parse().map_err(|_| TransformError::InvalidNumber {
        field,
        value: raw.to_string(),
    })?;
    if value < 0 {
        return Err(TransformError::Negative {
            field,
            value: raw.to_string(),
        });
    }
    Ok(value)
}

/// Non-negative, finite currency amount
pub fn parse_amount(field: &'static str, raw: &str) -> Result<f64, TransformError> {
    let value: f64 = raw
        .trim()
        .parse()
        .ok()
        .filter(|v: &f64| v.is_finite())
        .ok_or_else(|| TransformError::InvalidNumber {
            field,
            value: raw.to_string(),
        })?;
    if value < 0.0 {
        return Err(TransformError::Negative {
            field,
            value: raw.to_string(),
        });
    }
    Ok(value)
}

/// Total charge, with blank text read as 0
///
/// Returns the amount and whether it was defaulted.
pub fn parse_total_charges(raw: &str) -> Result<(f64, bool), TransformError> {
    if raw.trim().is_empty() {
        return Ok((0.0, true));
    }
    parse_amount("TotalCharges", raw).map(|v| (v, false))
}

/// Parse a label into a domain enum
pub fn parse_label<T>(field: &'static str, raw: &str) -> Result<T, TransformError>
where
    T: FromStr<Err = ChurnflowError>,
{
    raw.parse().map_err(|_| TransformError::InvalidValue {
        field,
        value: raw.to_string(),
    })
}

/// Optional `YYYY-MM-DD` date; blank reads as absent
pub fn parse_optional_date(
    field: &'static str,
    raw: Option<&str>,
) -> Result<Option<NaiveDate>, TransformError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(text) => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| TransformError::InvalidDate {
                field,
                value: text.to_string(),
            }),
    }
}

/// Optional free text; blank reads as absent
pub fn optional_text(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}
