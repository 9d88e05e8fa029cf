// SPDX-License-Identifier: Apache-2.0

//! Federated execution engine.
//!
//! Every fetch step runs in its own task and streams rows over a bounded
//! channel. The executor walks the plan from its output step and pushes rows
//! through a chain of [`RowSink`]s: build sides are buffered into hash
//! tables, probe sides stream through them, and only aggregate and sort steps
//! materialize their input.
//!
//! Fetch permits are granted in the order the executor drains the channels,
//! so a bounded `max_in_flight_sources` can never starve the input the
//! executor is waiting on.

pub mod aggregate;
pub mod fetch;
pub mod filter;
pub mod join;
pub mod sort;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::FederationConfig;
use crate::connector::error::SourceError;
use crate::connector::registry::SourceRegistry;
use crate::connector::types::Row;
use crate::error::ExecutionError;
use crate::federation::plan::{JoinStep, Plan, Side, StepId, StepKind};
use crate::federation::reconcile::Coercion;
use crate::federation::types::FieldRef;

use self::aggregate::{GroupAggregator, ReducerBinding};
use self::fetch::{FetchEvent, FetchReport, FetchWorker, RetryPolicy};
use self::filter::{BoundPredicate, RowFilter};
use self::join::{extract_key, JoinTable, KeyColumn};
use self::sort::sort_and_limit;

/// Lifecycle of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Pending,
    Fetching,
    Joining,
    Aggregating,
    Done,
    Failed,
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Fetching => "fetching",
            ExecutionState::Joining => "joining",
            ExecutionState::Aggregating => "aggregating",
            ExecutionState::Done => "done",
            ExecutionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Rows and per-source outcomes of one execution.
#[derive(Debug)]
pub struct ExecutionOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// One report per fetch step, in the order the fetches were drained.
    pub reports: Vec<FetchReport>,
    pub warnings: Vec<String>,
    /// Sources with join key values the coercion rejected. Their rows were
    /// fetched but could not take part in the join.
    pub incomplete_sources: Vec<String>,
}

/// Receiver of a step's rows.
///
/// `reset` discards everything accepted so far: the producing fetch restarted
/// or failed and its contribution starts over (or stays empty).
trait RowSink: Send {
    fn accept(&mut self, row: Row) -> Result<(), ExecutionError>;
    fn reset(&mut self);
}

/// Buffers rows up to a limit.
struct CollectSink {
    rows: Vec<Row>,
    limit: usize,
}

impl CollectSink {
    fn new(limit: usize) -> Self {
        Self {
            rows: Vec::new(),
            limit,
        }
    }
}

impl RowSink for CollectSink {
    fn accept(&mut self, row: Row) -> Result<(), ExecutionError> {
        if self.rows.len() >= self.limit {
            return Err(ExecutionError::ResultTooLarge { limit: self.limit });
        }
        self.rows.push(row);
        Ok(())
    }

    fn reset(&mut self) {
        self.rows.clear();
    }
}

struct FilterSink<'s> {
    filter: RowFilter,
    out: &'s mut dyn RowSink,
}

impl RowSink for FilterSink<'_> {
    fn accept(&mut self, row: Row) -> Result<(), ExecutionError> {
        if self.filter.matches(&row) {
            self.out.accept(row)?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.out.reset();
    }
}

struct ProjectSink<'s> {
    columns: Vec<usize>,
    out: &'s mut dyn RowSink,
}

impl RowSink for ProjectSink<'_> {
    fn accept(&mut self, row: Row) -> Result<(), ExecutionError> {
        let values = self.columns.iter().map(|&i| row.get(i).clone()).collect();
        self.out.accept(Row::new(values))
    }

    fn reset(&mut self) {
        self.out.reset();
    }
}

struct AggregateSink {
    group_by: Vec<usize>,
    reducers: Vec<ReducerBinding>,
    threshold: usize,
    aggregator: GroupAggregator,
}

impl AggregateSink {
    fn new(group_by: Vec<usize>, reducers: Vec<ReducerBinding>, threshold: usize) -> Self {
        let aggregator = GroupAggregator::new(group_by.clone(), reducers.clone(), threshold);
        Self {
            group_by,
            reducers,
            threshold,
            aggregator,
        }
    }
}

impl RowSink for AggregateSink {
    fn accept(&mut self, row: Row) -> Result<(), ExecutionError> {
        self.aggregator.push(&row)
    }

    fn reset(&mut self) {
        self.aggregator =
            GroupAggregator::new(self.group_by.clone(), self.reducers.clone(), self.threshold);
    }
}

/// Loads the build input of a join.
struct BuildSink {
    table: JoinTable,
    limit: usize,
}

impl RowSink for BuildSink {
    fn accept(&mut self, row: Row) -> Result<(), ExecutionError> {
        if self.table.len() >= self.limit {
            return Err(ExecutionError::ResultTooLarge { limit: self.limit });
        }
        self.table.insert(row);
        Ok(())
    }

    fn reset(&mut self) {
        self.table.clear();
    }
}

/// Streams the probe input of a join through the build table.
struct ProbeSink<'s> {
    table: JoinTable,
    keys: Vec<KeyColumn>,
    build: Side,
    preserved: Option<Side>,
    probe_width: usize,
    build_width: usize,
    emitted: usize,
    limit: usize,
    rejected: u64,
    out: &'s mut dyn RowSink,
}

impl ProbeSink<'_> {
    /// Output rows are always `left ++ right`.
    fn combine(&self, build_row: &Row, probe_row: &Row) -> Row {
        match self.build {
            Side::Left => build_row.concat(probe_row),
            Side::Right => probe_row.concat(build_row),
        }
    }

    fn emit(&mut self, row: Row) -> Result<(), ExecutionError> {
        if self.emitted >= self.limit {
            return Err(ExecutionError::ResultTooLarge { limit: self.limit });
        }
        self.emitted += 1;
        self.out.accept(row)
    }

    /// Pads build rows no probe row matched, for outer joins preserving the
    /// build side. Returns the rejected key counts of the build and probe
    /// sides.
    fn finish(mut self) -> Result<(u64, u64), ExecutionError> {
        if self.preserved == Some(self.build) {
            let padding = Row::nulls(self.probe_width);
            let unmatched: Vec<Row> = self
                .table
                .unmatched()
                .map(|row| self.combine(row, &padding))
                .collect();
            for row in unmatched {
                self.emit(row)?;
            }
        }
        Ok((self.table.rejected(), self.rejected))
    }
}

impl RowSink for ProbeSink<'_> {
    fn accept(&mut self, row: Row) -> Result<(), ExecutionError> {
        let hits = match extract_key(&row, &self.keys, &mut self.rejected) {
            Some(key) => self.table.probe(&key),
            None => Vec::new(),
        };

        if hits.is_empty() {
            if self.preserved == Some(self.build.other()) {
                let padded = self.combine(&Row::nulls(self.build_width), &row);
                self.emit(padded)?;
            }
            return Ok(());
        }

        for idx in hits {
            let joined = self.combine(self.table.row(idx), &row);
            self.emit(joined)?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.table.clear_matches();
        self.emitted = 0;
        self.rejected = 0;
        self.out.reset();
    }
}

/// The order in which the executor drains fetch steps when producing `id`.
fn consumption_order(plan: &Plan, id: StepId, order: &mut Vec<StepId>) {
    let Some(step) = plan.step(id) else {
        return;
    };
    match &step.kind {
        StepKind::Fetch(_) => order.push(id),
        StepKind::Filter(s) => consumption_order(plan, s.input, order),
        StepKind::Join(j) => {
            let (build, probe) = build_and_probe(j);
            consumption_order(plan, build, order);
            consumption_order(plan, probe, order);
        }
        StepKind::Aggregate(s) => consumption_order(plan, s.input, order),
        StepKind::SortLimit(s) => consumption_order(plan, s.input, order),
        StepKind::Project(s) => consumption_order(plan, s.input, order),
    }
}

fn build_and_probe(join: &JoinStep) -> (StepId, StepId) {
    match join.build {
        Side::Left => (join.left, join.right),
        Side::Right => (join.right, join.left),
    }
}

/// Creates one channel per fetch step and a spawner task that starts the
/// workers in consumption order as permits become available.
fn spawn_fetches(
    plan: &Plan,
    registry: &SourceRegistry,
    config: &FederationConfig,
    cancel: &CancellationToken,
) -> HashMap<StepId, mpsc::Receiver<FetchEvent>> {
    let capacity = config.channel_capacity.max(1);
    let retry = RetryPolicy {
        max_retries: config.max_timeout_retries,
        base_delay: config.retry_base_delay(),
    };

    let mut receivers = HashMap::new();
    let mut workers = HashMap::new();
    for step in plan.steps() {
        let Some(fetch) = step.as_fetch() else {
            continue;
        };
        let (tx, rx) = mpsc::channel(capacity);
        receivers.insert(step.id, rx);

        match registry.get(&fetch.source) {
            Some(descriptor) => {
                workers.insert(
                    step.id,
                    FetchWorker {
                        source: fetch.source.clone(),
                        connector: descriptor.connector(),
                        request: fetch.request.clone(),
                        width: step.columns.len(),
                        timeout: fetch.timeout,
                        retry,
                        cancel: cancel.clone(),
                        tx,
                    },
                );
            }
            None => {
                // Unregistered since planning; reported as a failed source
                let report = FetchReport::lost(
                    &fetch.source,
                    SourceError::connect("source is no longer registered"),
                );
                let _ = tx.try_send(FetchEvent::Done(report));
            }
        }
    }

    let max_in_flight = config
        .max_in_flight_sources
        .unwrap_or_else(|| plan.source_set().len())
        .max(1);
    let semaphore = Arc::new(Semaphore::new(max_in_flight));

    let mut order = Vec::new();
    consumption_order(plan, plan.output().id, &mut order);
    let cancel = cancel.clone();

    tokio::spawn(async move {
        for id in order {
            let Some(worker) = workers.remove(&id) else {
                continue;
            };
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            debug!(source = %worker.source, step = id, "Starting fetch");
            tokio::spawn(worker.run(Some(permit)));
        }
    });

    receivers
}

struct Executor<'p> {
    plan: &'p Plan,
    config: &'p FederationConfig,
    cancel: CancellationToken,
    receivers: HashMap<StepId, mpsc::Receiver<FetchEvent>>,
    reports: Vec<FetchReport>,
    warnings: Vec<String>,
    incomplete: BTreeSet<String>,
    state: ExecutionState,
}

impl<'p> Executor<'p> {
    fn transition(&mut self, next: ExecutionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Execution state change");
            self.state = next;
        }
    }

    /// Pushes the rows of step `id` into `sink`.
    fn feed<'a>(
        &'a mut self,
        id: StepId,
        sink: &'a mut dyn RowSink,
    ) -> BoxFuture<'a, Result<(), ExecutionError>> {
        async move {
            let plan = self.plan;
            let step = plan
                .step(id)
                .ok_or_else(|| ExecutionError::internal(format!("plan has no step {id}")))?;

            match &step.kind {
                StepKind::Fetch(fetch) => self.drain(id, &fetch.source, sink).await,
                StepKind::Filter(f) => {
                    let predicates = f
                        .predicates
                        .iter()
                        .map(|p| BoundPredicate {
                            column: p.column,
                            coercion: p.coercion,
                            filter: p.filter.clone(),
                        })
                        .collect();
                    let mut filtered = FilterSink {
                        filter: RowFilter::new(predicates),
                        out: sink,
                    };
                    self.feed(f.input, &mut filtered).await
                }
                StepKind::Join(join) => self.join(join, sink).await,
                StepKind::Aggregate(a) => {
                    let mut agg = AggregateSink::new(
                        a.group_by.clone(),
                        a.reducers.clone(),
                        self.config.aggregation_spill_threshold,
                    );
                    self.feed(a.input, &mut agg).await?;
                    self.transition(ExecutionState::Aggregating);
                    debug!(groups = agg.aggregator.group_count(), "Aggregation complete");
                    for row in agg.aggregator.finish() {
                        sink.accept(row)?;
                    }
                    Ok(())
                }
                StepKind::SortLimit(s) => {
                    let mut collected = CollectSink::new(self.config.max_result_rows);
                    self.feed(s.input, &mut collected).await?;
                    let mut rows = collected.rows;
                    sort_and_limit(&mut rows, &s.keys, s.limit);
                    for row in rows {
                        sink.accept(row)?;
                    }
                    Ok(())
                }
                StepKind::Project(p) => {
                    let mut projected = ProjectSink {
                        columns: p.columns.clone(),
                        out: sink,
                    };
                    self.feed(p.input, &mut projected).await
                }
            }
        }
        .boxed()
    }

    /// Reads one fetch channel to its final report.
    async fn drain(
        &mut self,
        id: StepId,
        source: &str,
        sink: &mut dyn RowSink,
    ) -> Result<(), ExecutionError> {
        let mut rx = self
            .receivers
            .remove(&id)
            .ok_or_else(|| ExecutionError::internal(format!("fetch step {id} drained twice")))?;

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ExecutionError::Cancelled),
                event = rx.recv() => event,
            };

            match event {
                Some(FetchEvent::Row(row)) => sink.accept(row)?,
                Some(FetchEvent::Reset) => sink.reset(),
                Some(FetchEvent::Done(report)) => {
                    if let Err(error) = &report.outcome {
                        if *error == SourceError::Cancelled {
                            return Err(ExecutionError::Cancelled);
                        }
                        warn!(
                            source = %source,
                            attempts = report.attempts,
                            error = %error,
                            "Source degraded to an empty contribution"
                        );
                        sink.reset();
                    }
                    self.reports.push(report);
                    return Ok(());
                }
                None => {
                    warn!(source = %source, "Fetch worker stopped without a report");
                    sink.reset();
                    self.reports.push(FetchReport::lost(
                        source,
                        SourceError::connect("fetch worker stopped without a report"),
                    ));
                    return Ok(());
                }
            }
        }
    }

    async fn join(&mut self, join: &JoinStep, sink: &mut dyn RowSink) -> Result<(), ExecutionError> {
        let plan = self.plan;
        let width = |id: StepId| plan.step(id).map(|s| s.columns.len()).unwrap_or(0);
        let (build_id, probe_id) = build_and_probe(join);

        let (build_keys, probe_keys): (Vec<KeyColumn>, Vec<KeyColumn>) = join
            .keys
            .iter()
            .map(|k| {
                let left = KeyColumn {
                    column: k.left,
                    coercion: k.left_coercion,
                };
                let right = KeyColumn {
                    column: k.right,
                    coercion: k.right_coercion,
                };
                match join.build {
                    Side::Left => (left, right),
                    Side::Right => (right, left),
                }
            })
            .unzip();

        let mut build = BuildSink {
            table: JoinTable::new(build_keys.clone()),
            limit: self.config.max_result_rows,
        };
        self.feed(build_id, &mut build).await?;
        self.transition(ExecutionState::Joining);
        debug!(step = build_id, rows = build.table.len(), "Join build side loaded");

        let mut probe = ProbeSink {
            table: build.table,
            keys: probe_keys.clone(),
            build: join.build,
            preserved: join.preserved,
            probe_width: width(probe_id),
            build_width: width(build_id),
            emitted: 0,
            limit: self.config.max_result_rows,
            rejected: 0,
            out: sink,
        };
        self.feed(probe_id, &mut probe).await?;

        let (build_rejected, probe_rejected) = probe.finish()?;
        let logical = join
            .keys
            .first()
            .map(|k| k.logical_type.to_string())
            .unwrap_or_default();
        self.note_rejected_keys(build_id, &build_keys, build_rejected, &logical);
        self.note_rejected_keys(probe_id, &probe_keys, probe_rejected, &logical);
        Ok(())
    }

    /// Records join key values of `input` that could not be coerced. The
    /// owning sources are reported incomplete, which makes the result partial.
    fn note_rejected_keys(&mut self, input: StepId, keys: &[KeyColumn], rejected: u64, logical: &str) {
        if rejected == 0 {
            return;
        }
        let plan = self.plan;
        let columns = plan.step(input).map(|s| s.columns.as_slice()).unwrap_or_default();
        let sources: BTreeSet<String> = keys
            .iter()
            .filter(|k| k.coercion != Coercion::Identity)
            .filter_map(|k| columns.get(k.column))
            .filter_map(|name| FieldRef::parse(name))
            .map(|r| r.source)
            .collect();

        for source in sources {
            let message = format!(
                "{rejected} join key value(s) from '{source}' could not be coerced to {logical} and never matched"
            );
            warn!(source = %source, rejected, "Join keys rejected by coercion");
            self.warnings.push(message);
            self.incomplete.insert(source);
        }
    }
}

/// Runs `plan` against the sources of `registry`.
///
/// Source failures are not errors here: they show up as failed reports and
/// empty contributions. The caller decides whether the result is usable.
#[instrument(skip_all, fields(fingerprint = %plan.fingerprint()))]
pub async fn execute(
    plan: &Plan,
    registry: &SourceRegistry,
    config: &FederationConfig,
    cancel: CancellationToken,
) -> Result<ExecutionOutput, ExecutionError> {
    // Everything spawned below stops once this execution is dropped or done
    let cancel = cancel.child_token();
    let _guard = cancel.clone().drop_guard();

    let mut executor = Executor {
        plan,
        config,
        cancel: cancel.clone(),
        receivers: HashMap::new(),
        reports: Vec::new(),
        warnings: Vec::new(),
        incomplete: BTreeSet::new(),
        state: ExecutionState::Pending,
    };
    executor.receivers = spawn_fetches(plan, registry, config, &cancel);
    executor.transition(ExecutionState::Fetching);

    let mut output = CollectSink::new(config.max_result_rows);
    match executor.feed(plan.output().id, &mut output).await {
        Ok(()) => {
            executor.transition(ExecutionState::Done);
            Ok(ExecutionOutput {
                columns: plan.output_columns().to_vec(),
                rows: output.rows,
                reports: executor.reports,
                warnings: executor.warnings,
                incomplete_sources: executor.incomplete.into_iter().collect(),
            })
        }
        Err(e) => {
            executor.transition(ExecutionState::Failed);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::drivers::memory::MemoryConnector;
    use crate::connector::types::{StoreKind, TableColumn, Value};
    use crate::federation::planner::build_plan;
    use crate::federation::types::{JoinKind, QueryDescriptor};

    fn table(tags: &[(i64, &str)]) -> Arc<MemoryConnector> {
        Arc::new(
            MemoryConnector::new(StoreKind::Relational)
                .with_column(TableColumn::new("id", "int"))
                .with_column(TableColumn::new("tag", "text"))
                .with_rows(
                    tags.iter()
                        .map(|(id, tag)| Row::new(vec![Value::Int(*id), Value::from(*tag)]))
                        .collect(),
                ),
        )
    }

    async fn run(kind: JoinKind, config: FederationConfig) -> Result<ExecutionOutput, ExecutionError> {
        let mut registry = SourceRegistry::new();
        registry.connect("A", table(&[(1, "a"), (2, "b")])).await.unwrap();
        registry.connect("B", table(&[(1, "x"), (3, "y")])).await.unwrap();
        let descriptor = QueryDescriptor::new(["A", "B"]).join("A.id", "B.id", kind);
        let plan = build_plan(&descriptor, &registry, &config).unwrap();
        execute(&plan, &registry, &config, CancellationToken::new()).await
    }

    fn sorted(rows: Vec<Row>) -> Vec<Row> {
        let mut rows = rows;
        rows.sort_by(|a, b| a.get(0).total_cmp(b.get(0)));
        rows
    }

    #[tokio::test]
    async fn inner_join_keeps_matches_only() {
        let output = run(JoinKind::Inner, FederationConfig::default()).await.unwrap();
        assert_eq!(output.columns, vec!["A.id", "A.tag", "B.id", "B.tag"]);
        assert_eq!(
            output.rows,
            vec![Row::new(vec![Value::Int(1), "a".into(), Value::Int(1), "x".into()])]
        );
        assert_eq!(output.reports.len(), 2);
        assert!(output.reports.iter().all(FetchReport::is_ok));
    }

    #[tokio::test]
    async fn left_join_pads_unmatched_rows() {
        let output = run(JoinKind::Left, FederationConfig::default()).await.unwrap();
        assert_eq!(
            sorted(output.rows),
            vec![
                Row::new(vec![Value::Int(1), "a".into(), Value::Int(1), "x".into()]),
                Row::new(vec![Value::Int(2), "b".into(), Value::Null, Value::Null]),
            ]
        );
    }

    #[tokio::test]
    async fn single_permit_still_completes() {
        let config = FederationConfig {
            max_in_flight_sources: Some(1),
            channel_capacity: 1,
            ..Default::default()
        };
        let output = run(JoinKind::Inner, config).await.unwrap();
        assert_eq!(output.rows.len(), 1);
    }

    #[tokio::test]
    async fn join_output_is_bounded() {
        let config = FederationConfig {
            max_result_rows: 1,
            ..Default::default()
        };
        let err = run(JoinKind::Left, config).await.unwrap_err();
        assert_eq!(err, ExecutionError::ResultTooLarge { limit: 1 });
    }

    #[tokio::test]
    async fn cancelled_token_aborts() {
        let mut registry = SourceRegistry::new();
        registry.connect("A", table(&[(1, "a")])).await.unwrap();
        let config = FederationConfig::default();
        let plan = build_plan(&QueryDescriptor::new(["A"]), &registry, &config).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = execute(&plan, &registry, &config, cancel).await.unwrap_err();
        assert_eq!(err, ExecutionError::Cancelled);
    }
}
