//! Source extract reader
//!
//! Opens a CSV extract, checks that every required column is present, and
//! hands out raw rows lazily. Field values are left as text; typing them is
//! the transformer's job.

use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, instrument};

/// Columns every extract must carry
pub const REQUIRED_COLUMNS: &[&str] = &[
    "customerID",
    "gender",
    "SeniorCitizen",
    "Partner",
    "Dependents",
    "tenure",
    "PhoneService",
    "MultipleLines",
    "InternetService",
    "OnlineSecurity",
    "OnlineBackup",
    "DeviceProtection",
    "TechSupport",
    "StreamingTV",
    "StreamingMovies",
    "Contract",
    "PaperlessBilling",
    "PaymentMethod",
    "MonthlyCharges",
    "TotalCharges",
    "Churn",
];

/// Columns read when present
pub const OPTIONAL_COLUMNS: &[&str] = &["ChurnDate", "ChurnReason"];

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Cannot read source {locator}: {source}")]
    Unreadable {
        locator: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Source {locator} is missing required columns: {}", missing.join(", "))]
    MissingColumns { locator: String, missing: Vec<String> },

    #[error("Malformed record at line {line} of {locator}: {message}")]
    Malformed {
        locator: String,
        line: u64,
        message: String,
    },
}

/// One source row, every field as the raw text found in the extract
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawCustomerRow {
    #[serde(rename = "customerID")]
    pub customer_id: String,
    pub gender: String,
    #[serde(rename = "SeniorCitizen")]
    pub senior_citizen: String,
    #[serde(rename = "Partner")]
    pub partner: String,
    #[serde(rename = "Dependents")]
    pub dependents: String,
    pub tenure: String,
    #[serde(rename = "PhoneService")]
    pub phone_service: String,
    #[serde(rename = "MultipleLines")]
    pub multiple_lines: String,
    #[serde(rename = "InternetService")]
    pub internet_service: String,
    #[serde(rename = "OnlineSecurity")]
    pub online_security: String,
    #[serde(rename = "OnlineBackup")]
    pub online_backup: String,
    #[serde(rename = "DeviceProtection")]
    pub device_protection: String,
    #[serde(rename = "TechSupport")]
    pub tech_support: String,
    #[serde(rename = "StreamingTV")]
    pub streaming_tv: String,
    #[serde(rename = "StreamingMovies")]
    pub streaming_movies: String,
    #[serde(rename = "Contract")]
    pub contract: String,
    #[serde(rename = "PaperlessBilling")]
    pub paperless_billing: String,
    #[serde(rename = "PaymentMethod")]
    pub payment_method: String,
    #[serde(rename = "MonthlyCharges")]
    pub monthly_charges: String,
    #[serde(rename = "TotalCharges")]
    pub total_charges: String,
    #[serde(rename = "Churn")]
    pub churn: String,
    #[serde(rename = "ChurnDate", default)]
    pub churn_date: Option<String>,
    #[serde(rename = "ChurnReason", default)]
    pub churn_reason: Option<String>,
}

/// A raw row and the source line it started on
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub line: u64,
    pub row: RawCustomerRow,
}

type BoxedReader = Box<dyn Read + Send>;

/// Lazy, single-pass sequence of source rows
///
/// Iteration stops for good after the first malformed record.
pub struct Extraction {
    locator: String,
    header: Vec<String>,
    records: csv::DeserializeRecordsIntoIter<BoxedReader, RawCustomerRow>,
    failed: bool,
}

impl Extraction {
    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// Columns present in the source, in header order
    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Drain the sequence, stopping at the first malformed record
    pub fn collect_rows(self) -> Result<Vec<SourceRow>, ExtractError> {
        self.collect()
    }
}

impl Iterator for Extraction {
    type Item = Result<SourceRow, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        // Position before the read is the start of the record about to be parsed
        let line = self.records.reader().position().line();
        let result = self.records.next()?;
        Some(match result {
            Ok(row) => Ok(SourceRow { line, row }),
            Err(err) => {
                self.failed = true;
                let line = err.position().map_or(line, |p| p.line());
                Err(ExtractError::Malformed {
                    locator: self.locator.clone(),
                    line,
                    message: err.to_string(),
                })
            },
        })
    }
}

/// Opens source extracts
pub struct Extractor;

impl Extractor {
    /// Open a CSV file on disk
    #[instrument(skip_all, fields(source = %path.display()))]
    pub fn open(path: &Path) -> Result<Extraction, ExtractError> {
        let locator = path.display().to_string();
        let file = File::open(path).map_err(|source| ExtractError::Unreadable {
            locator: locator.clone(),
            source,
        })?;
        Self::from_reader(locator, file)
    }

    /// Read an extract from any byte stream; `locator` names it in errors
    pub fn from_reader<R>(locator: impl Into<String>, reader: R) -> Result<Extraction, ExtractError>
    where
        R: Read + Send + 'static,
    {
        let locator = locator.into();
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(Box::new(reader) as BoxedReader);

        let header: Vec<String> = csv_reader
            .headers()
            .map_err(|err| match err.kind() {
                csv::ErrorKind::Io(_) => ExtractError::Unreadable {
                    locator: locator.clone(),
                    source: std::io::Error::other(err.to_string()),
                },
                _ => ExtractError::Malformed {
                    locator: locator.clone(),
                    line: 1,
                    message: err.to_string(),
                },
            })?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .filter(|required| !header.iter().any(|h| h == *required))
            .map(|c| c.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ExtractError::MissingColumns { locator, missing });
        }

        // Deserialization matches on the trimmed names
        csv_reader.set_headers(csv::StringRecord::from(header.clone()));

        debug!(
            columns = header.len(),
            optional = OPTIONAL_COLUMNS.iter().filter(|c| header.iter().any(|h| h == *c)).count(),
            "Source header accepted"
        );

        Ok(Extraction {
            locator,
            header,
            records: csv_reader.into_deserialize(),
            failed: false,
        })
    }
}
