// SPDX-License-Identifier: Apache-2.0

//! Failure and partial-result coordination.
//!
//! Folds per-source fetch reports into the status map of a result envelope
//! and decides whether the result is usable at all.

use std::collections::BTreeMap;

use tracing::warn;

use crate::connector::error::SourceError;
use crate::error::ExecutionError;
use crate::federation::envelope::{ResultEnvelope, SourceFetchMetadata, SourceStatus};
use crate::federation::exec::fetch::FetchReport;

/// Per-source view of one execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceSummary {
    pub status: BTreeMap<String, SourceStatus>,
    pub fetches: BTreeMap<String, SourceFetchMetadata>,
    pub stale_sources: Vec<String>,
    /// Sources that answered but had rows dropped by join key coercion.
    pub incomplete_sources: Vec<String>,
}

impl SourceSummary {
    /// True when some source did not contribute all of its rows.
    pub fn is_partial(&self) -> bool {
        !self.incomplete_sources.is_empty() || self.status.values().any(|s| !s.is_ok())
    }

    /// Flags sources whose rows were fetched but partly dropped.
    pub fn mark_incomplete(&mut self, sources: &[String]) {
        for source in sources {
            if !self.incomplete_sources.contains(source) {
                self.incomplete_sources.push(source.clone());
            }
        }
        self.incomplete_sources.sort();
    }

    /// Fails with `FederationUnavailable` when no source succeeded.
    pub fn ensure_available(&self) -> Result<(), ExecutionError> {
        if self.status.values().any(SourceStatus::is_ok) {
            return Ok(());
        }
        let failures = self
            .status
            .iter()
            .map(|(name, status)| (name.clone(), status.to_string()))
            .collect();
        Err(ExecutionError::FederationUnavailable { failures })
    }

    /// Copies status, fetch metadata and staleness into `envelope`.
    pub fn apply(self, envelope: &mut ResultEnvelope) {
        envelope.partial = self.is_partial();
        envelope.status = self.status;
        envelope.fetches = self.fetches;
        envelope.stale_sources = self.stale_sources;
        envelope.incomplete_sources = self.incomplete_sources;
    }
}

fn status_of(error: &SourceError) -> SourceStatus {
    match error {
        SourceError::Timeout { .. } => SourceStatus::Timeout,
        other => SourceStatus::Error {
            reason: other.to_string(),
        },
    }
}

/// Builds the summary for `sources` from the reports of their fetches.
///
/// A source without a report is treated as failed.
pub fn summarize(sources: &[String], reports: &[FetchReport]) -> SourceSummary {
    let mut summary = SourceSummary::default();

    for report in reports {
        let status = match &report.outcome {
            Ok(()) => SourceStatus::Ok,
            Err(error) => {
                if matches!(error, SourceError::Timeout { .. }) {
                    crate::metrics::record_source_timeout();
                }
                if matches!(error, SourceError::SchemaDrift { .. })
                    && !summary.stale_sources.contains(&report.source)
                {
                    summary.stale_sources.push(report.source.clone());
                }
                warn!(source = %report.source, error = %error, "Source did not contribute");
                status_of(error)
            }
        };
        summary.status.insert(report.source.clone(), status);
        summary.fetches.insert(
            report.source.clone(),
            SourceFetchMetadata {
                rows: if report.is_ok() { report.rows } else { 0 },
                attempts: report.attempts,
                elapsed_ms: report.elapsed.as_millis() as u64,
            },
        );
    }

    for source in sources {
        summary
            .status
            .entry(source.clone())
            .or_insert_with(|| SourceStatus::Error {
                reason: "no fetch report".into(),
            });
    }
    summary.stale_sources.sort();
    summary
}
