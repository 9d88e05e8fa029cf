// SPDX-License-Identifier: Apache-2.0

//! Result envelope returned to callers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::connector::types::Row;

/// Outcome of one source in one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    Ok,
    Timeout,
    Error { reason: String },
    /// Not contacted (the result came from the cache).
    Skipped,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Ok => "ok",
            SourceStatus::Timeout => "timeout",
            SourceStatus::Error { .. } => "error",
            SourceStatus::Skipped => "skipped",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, SourceStatus::Ok)
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceStatus::Error { reason } => write!(f, "error({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

impl PartialEq<&str> for SourceStatus {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// Fetch statistics of one source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceFetchMetadata {
    pub rows: u64,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

/// Rows plus everything needed to judge their completeness.
///
/// Rows are held in a shared immutable batch and handed out through
/// [`ResultEnvelope::rows`]; iterating again needs no re-execution, but a
/// fresh result does.
#[derive(Debug, Clone, Serialize)]
pub struct ResultEnvelope {
    pub columns: Vec<String>,
    #[serde(serialize_with = "serialize_batch")]
    batch: Arc<Vec<Row>>,
    pub status: BTreeMap<String, SourceStatus>,
    /// True when at least one source did not contribute all of its rows.
    pub partial: bool,
    pub cached: bool,
    pub fingerprint: String,
    pub execution_id: Uuid,
    pub fetches: BTreeMap<String, SourceFetchMetadata>,
    pub warnings: Vec<String>,
    /// Sources whose schema changed under the registered descriptor.
    pub stale_sources: Vec<String>,
    /// Sources whose join key values could not all be coerced; the rows
    /// carrying them are missing from the result.
    pub incomplete_sources: Vec<String>,
    pub total_ms: u64,
}

fn serialize_batch<S: Serializer>(batch: &Arc<Vec<Row>>, serializer: S) -> Result<S::Ok, S::Error> {
    batch.as_slice().serialize(serializer)
}

impl ResultEnvelope {
    pub(crate) fn new(columns: Vec<String>, batch: Arc<Vec<Row>>, fingerprint: String) -> Self {
        Self {
            columns,
            batch,
            status: BTreeMap::new(),
            partial: false,
            cached: false,
            fingerprint,
            execution_id: Uuid::new_v4(),
            fetches: BTreeMap::new(),
            warnings: Vec::new(),
            stale_sources: Vec::new(),
            incomplete_sources: Vec::new(),
            total_ms: 0,
        }
    }

    /// Lazily yields the result rows.
    pub fn rows(&self) -> RowIter {
        RowIter {
            batch: Arc::clone(&self.batch),
            position: 0,
        }
    }

    pub fn row_count(&self) -> usize {
        self.batch.len()
    }

    pub(crate) fn batch(&self) -> Arc<Vec<Row>> {
        Arc::clone(&self.batch)
    }

    /// Status of `source`, if it took part.
    pub fn source_status(&self, source: &str) -> Option<&SourceStatus> {
        self.status.get(source)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// Iterator over an envelope's rows.
#[derive(Debug, Clone)]
pub struct RowIter {
    batch: Arc<Vec<Row>>,
    position: usize,
}

impl Iterator for RowIter {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        let row = self.batch.get(self.position)?.clone();
        self.position += 1;
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.batch.len().saturating_sub(self.position);
        (left, Some(left))
    }
}

impl ExactSizeIterator for RowIter {}
