//! Churnflow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging, and error handling for the churnflow workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`ChurnflowError`] and the [`Result`] alias
//! - **Logging**: subscriber setup shared by every binary
//! - **Types**: the customer domain model (sub-entity records and their enums)
//!
//! # Example
//!
//! ```no_run
//! use churnflow_common::types::ContractType;
//!
//! let contract: ContractType = "Two year".parse().unwrap();
//! assert_eq!(contract.as_str(), "Two year");
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{ChurnflowError, Result};
