// SPDX-License-Identifier: Apache-2.0

//! Normalized source errors
//!
//! Every adapter maps its driver-specific failures onto [`SourceError`], so the
//! engine can decide between retrying, degrading the source and re-planning
//! without knowing which store produced the error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure scoped to a single source.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum SourceError {
    /// The store could not be reached or refused the session.
    #[error("Connection failed: {message}")]
    Connect { message: String },

    /// The store did not answer within the allotted time.
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The store's schema no longer matches the registered descriptor.
    #[error("Schema drift on '{field}': {message}")]
    SchemaDrift { field: String, message: String },

    /// The store rejected the request.
    #[error("Query failed: {message}")]
    Query { message: String },

    /// The connector does not offer this operation.
    #[error("Operation not supported: {operation}")]
    Unsupported { operation: String },

    #[error("Operation cancelled")]
    Cancelled,
}

impl SourceError {
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect { message: msg.into() }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    pub fn schema_drift(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SchemaDrift {
            field: field.into(),
            message: msg.into(),
        }
    }

    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query { message: msg.into() }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Only timeouts are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Timeout { .. })
    }
}

/// Result type alias for connector operations
pub type SourceResult<T> = Result<T, SourceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_are_retryable() {
        assert!(SourceError::timeout(100).is_retryable());
        assert!(!SourceError::connect("refused").is_retryable());
        assert!(!SourceError::schema_drift("id", "column dropped").is_retryable());
        assert!(!SourceError::Cancelled.is_retryable());
    }

    #[test]
    fn messages_name_the_failure() {
        let err = SourceError::schema_drift("user_id", "column renamed");
        assert_eq!(err.to_string(), "Schema drift on 'user_id': column renamed");
    }
}
