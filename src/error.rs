// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for federated queries
//!
//! - [`PlanningError`]: always fatal, raised before any remote call.
//! - [`SourceError`]: scoped to one source; converted into a status entry and
//!   never propagated past the fetching phase.
//! - [`ExecutionError`]: fatal to the whole query; no partial result.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connector::error::SourceError;

/// Errors detected while turning a descriptor into a plan.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum PlanningError {
    #[error("Type mismatch between {left} ({left_type}) and {right} ({right_type}): {reason}")]
    TypeMismatch {
        left: String,
        left_type: String,
        right: String,
        right_type: String,
        reason: String,
    },

    #[error(
        "Refusing unsafe cartesian product of '{left}' and '{right}' (estimated {estimated_rows} rows)"
    )]
    UnsafeCartesian {
        left: String,
        right: String,
        estimated_rows: u64,
    },

    #[error("Field '{field}' has no logical mapping in source '{source_name}'")]
    MissingLogicalField { source_name: String, field: String },

    #[error("Unknown source '{source_name}'. Available sources: {available}")]
    UnknownSource {
        source_name: String,
        available: String,
    },

    #[error("Source '{source_name}' is listed more than once")]
    DuplicateSource { source_name: String },

    #[error("Invalid query descriptor: {message}")]
    InvalidDescriptor { message: String },
}

impl PlanningError {
    pub fn type_mismatch(
        left: impl Into<String>,
        left_type: impl Into<String>,
        right: impl Into<String>,
        right_type: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::TypeMismatch {
            left: left.into(),
            left_type: left_type.into(),
            right: right.into(),
            right_type: right_type.into(),
            reason: reason.into(),
        }
    }

    pub fn missing_field(source_name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingLogicalField {
            source_name: source_name.into(),
            field: field.into(),
        }
    }

    pub fn unknown_source(source_name: impl Into<String>, available: &[&str]) -> Self {
        Self::UnknownSource {
            source_name: source_name.into(),
            available: available
                .iter()
                .map(|a| format!("'{a}'"))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidDescriptor { message: msg.into() }
    }
}

/// Errors that abort an execution after planning succeeded.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Aggregation exceeded {threshold} distinct groups")]
    AggregationMemoryExceeded { threshold: usize },

    #[error("No source could be read: {}", format_failures(.failures))]
    FederationUnavailable { failures: BTreeMap<String, String> },

    #[error("Result exceeded the materialization limit of {limit} rows")]
    ResultTooLarge { limit: usize },

    #[error("Federated query exceeded its deadline of {timeout_ms}ms")]
    DeadlineExceeded { timeout_ms: u64 },

    #[error("Federated query cancelled")]
    Cancelled,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ExecutionError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }
}

fn format_failures(failures: &BTreeMap<String, String>) -> String {
    failures
        .iter()
        .map(|(name, reason)| format!("{name}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Unified error type returned by the federation engine
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum FederationError {
    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// A source failed outside of query execution (registration, refresh).
    #[error("Source '{source_name}' failed: {error}")]
    Source {
        source_name: String,
        error: SourceError,
    },
}

impl FederationError {
    pub fn from_source(source_name: impl Into<String>, error: SourceError) -> Self {
        Self::Source {
            source_name: source_name.into(),
            error,
        }
    }

    pub fn is_planning(&self) -> bool {
        matches!(self, FederationError::Planning(_))
    }
}

/// Result type alias for federation operations
pub type FederationResult<T> = Result<T, FederationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_lists_every_failure() {
        let mut failures = BTreeMap::new();
        failures.insert("A".to_string(), "timeout".to_string());
        failures.insert("B".to_string(), "connection refused".to_string());
        let err = ExecutionError::FederationUnavailable { failures };
        assert_eq!(
            err.to_string(),
            "No source could be read: A: timeout; B: connection refused"
        );
    }

    #[test]
    fn planning_errors_convert_transparently() {
        let err: FederationError = PlanningError::missing_field("B", "user_id").into();
        assert!(err.is_planning());
        assert_eq!(
            err.to_string(),
            "Field 'user_id' has no logical mapping in source 'B'"
        );
    }

    #[test]
    fn unknown_source_lists_alternatives() {
        let err = PlanningError::unknown_source("C", &["A", "B"]);
        assert_eq!(
            err.to_string(),
            "Unknown source 'C'. Available sources: 'A', 'B'"
        );
    }
}
