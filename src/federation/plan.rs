// SPDX-License-Identifier: Apache-2.0

//! Federated execution plan.
//!
//! A plan is a list of steps in topological order: every non-fetch step only
//! reads steps declared before it. Plans are immutable once built and carry
//! source names only, never connector handles.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::connector::types::{AggregateFunction, ColumnFilter, ScanRequest};
use crate::federation::exec::aggregate::ReducerBinding;
use crate::federation::exec::sort::SortKey;
use crate::federation::reconcile::{Coercion, LogicalType};

pub type StepId = usize;

/// Per-source fetch with everything the source agreed to evaluate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchStep {
    pub source: String,
    pub request: ScanRequest,
    #[serde(skip)]
    pub estimated_rows: u64,
    #[serde(skip)]
    pub timeout: Duration,
}

/// Predicate evaluated by the engine after a fetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostFilter {
    /// Index in the input step's columns.
    pub column: usize,
    pub coercion: Coercion,
    pub filter: ColumnFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterStep {
    pub input: StepId,
    pub predicates: Vec<PostFilter>,
}

/// One equality key of a join, resolved to input column indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JoinKey {
    pub left: usize,
    pub right: usize,
    pub left_coercion: Coercion,
    pub right_coercion: Coercion,
    pub logical_type: LogicalType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// Hash join between two earlier steps.
///
/// `preserved` is set for outer joins: unmatched rows of that side survive,
/// padded with NULLs. An empty key list is a cartesian product.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinStep {
    pub left: StepId,
    pub right: StepId,
    pub keys: Vec<JoinKey>,
    pub preserved: Option<Side>,
    pub build: Side,
    #[serde(skip)]
    pub estimated_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateStep {
    pub input: StepId,
    pub group_by: Vec<usize>,
    pub reducers: Vec<ReducerBinding>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SortLimitStep {
    pub input: StepId,
    pub keys: Vec<SortKey>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectStep {
    pub input: StepId,
    pub columns: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StepKind {
    Fetch(FetchStep),
    Filter(FilterStep),
    Join(JoinStep),
    Aggregate(AggregateStep),
    SortLimit(SortLimitStep),
    Project(ProjectStep),
}

/// A plan step and the names of the columns it produces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub id: StepId,
    pub columns: Vec<String>,
    pub kind: StepKind,
}

impl Step {
    /// Steps read by this one.
    pub fn inputs(&self) -> Vec<StepId> {
        match &self.kind {
            StepKind::Fetch(_) => vec![],
            StepKind::Filter(s) => vec![s.input],
            StepKind::Join(s) => vec![s.left, s.right],
            StepKind::Aggregate(s) => vec![s.input],
            StepKind::SortLimit(s) => vec![s.input],
            StepKind::Project(s) => vec![s.input],
        }
    }

    pub fn as_fetch(&self) -> Option<&FetchStep> {
        match &self.kind {
            StepKind::Fetch(fetch) => Some(fetch),
            _ => None,
        }
    }
}

/// Immutable federated plan
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    steps: Vec<Step>,
    fingerprint: String,
    cache_ttl: Option<Duration>,
    bypass_cache: bool,
}

impl Plan {
    /// Seals a list of steps. Fails if a step reads itself or a later step.
    pub fn new(
        steps: Vec<Step>,
        cache_ttl: Option<Duration>,
        bypass_cache: bool,
    ) -> Result<Self, String> {
        if steps.is_empty() {
            return Err("plan has no steps".into());
        }
        for (idx, step) in steps.iter().enumerate() {
            if step.id != idx {
                return Err(format!("step {} is declared at position {idx}", step.id));
            }
            if let Some(bad) = step.inputs().into_iter().find(|&input| input >= idx) {
                return Err(format!("step {idx} reads step {bad} before it is produced"));
            }
        }
        let fingerprint = fingerprint(&steps);
        Ok(Self {
            steps,
            fingerprint,
            cache_ttl,
            bypass_cache,
        })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.steps.get(id)
    }

    /// The step producing the result; always the last one.
    pub fn output(&self) -> &Step {
        &self.steps[self.steps.len() - 1]
    }

    pub fn output_columns(&self) -> &[String] {
        &self.output().columns
    }

    pub fn fetches(&self) -> impl Iterator<Item = (StepId, &FetchStep)> {
        self.steps
            .iter()
            .filter_map(|step| step.as_fetch().map(|fetch| (step.id, fetch)))
    }

    /// Sources read by this plan, in fetch order.
    pub fn sources(&self) -> Vec<String> {
        self.fetches().map(|(_, f)| f.source.clone()).collect()
    }

    pub fn touches(&self, source: &str) -> bool {
        self.fetches().any(|(_, f)| f.source == source)
    }

    pub fn source_set(&self) -> BTreeSet<String> {
        self.sources().into_iter().collect()
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl
    }

    pub fn bypass_cache(&self) -> bool {
        self.bypass_cache
    }

    /// Longest per-attempt fetch timeout.
    pub fn max_fetch_timeout(&self) -> Duration {
        self.fetches()
            .map(|(_, f)| f.timeout)
            .max()
            .unwrap_or_default()
    }

    pub fn has_aggregate(&self) -> bool {
        self.steps.iter().any(|s| {
            matches!(s.kind, StepKind::Aggregate(_))
                || s.as_fetch().is_some_and(|f| f.request.aggregate.is_some())
        })
    }

    /// Human-readable rendering, one step per line.
    pub fn explain(&self) -> String {
        self.steps
            .iter()
            .map(|step| {
                let detail = match &step.kind {
                    StepKind::Fetch(f) => format!(
                        "fetch {} (filters={}, aggregate={}, order={}, limit={:?}, est={})",
                        f.source,
                        f.request.filters.len(),
                        f.request.aggregate.is_some(),
                        f.request.order.len(),
                        f.request.limit,
                        f.estimated_rows
                    ),
                    StepKind::Filter(f) => {
                        format!("filter #{} ({} predicates)", f.input, f.predicates.len())
                    }
                    StepKind::Join(j) => format!(
                        "join #{} #{} (keys={}, preserved={:?}, build={:?}, est={})",
                        j.left,
                        j.right,
                        j.keys.len(),
                        j.preserved,
                        j.build,
                        j.estimated_rows
                    ),
                    StepKind::Aggregate(a) => format!(
                        "aggregate #{} (groups={}, reducers={})",
                        a.input,
                        a.group_by.len(),
                        a.reducers
                            .iter()
                            .map(|r| r.function.to_string())
                            .collect::<Vec<_>>()
                            .join(",")
                    ),
                    StepKind::SortLimit(s) => {
                        format!("sort #{} (keys={}, limit={:?})", s.input, s.keys.len(), s.limit)
                    }
                    StepKind::Project(p) => format!("project #{} ({} columns)", p.input, p.columns.len()),
                };
                format!("#{} {} -> [{}]", step.id, detail, step.columns.join(", "))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// SHA-256 over the canonical JSON form of the steps.
///
/// Estimates and timeouts are excluded so that a refreshed statistic or a
/// different timeout does not change the identity of the result.
fn fingerprint(steps: &[Step]) -> String {
    let canonical =
        serde_json::to_vec(steps).unwrap_or_else(|_| format!("{steps:?}").into_bytes());
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    format!("{:x}", hasher.finalize())
}

/// Whether a reducer can run on a column of the given logical type.
pub fn reducer_accepts(function: AggregateFunction, logical: LogicalType) -> bool {
    match function {
        AggregateFunction::Sum | AggregateFunction::Avg => logical.is_numeric(),
        AggregateFunction::Count | AggregateFunction::Min | AggregateFunction::Max => {
            logical != LogicalType::Bytes
        }
    }
}
