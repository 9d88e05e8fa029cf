// SPDX-License-Identifier: Apache-2.0

//! Federation query planner.
//!
//! Turns a [`QueryDescriptor`] into a [`Plan`] without any remote call:
//!
//! 1. Resolves every source against the registry snapshot
//! 2. Reconciles filter, join, aggregate and order fields
//! 3. Decides filter, aggregate and order/limit pushdown per source
//! 4. Orders fetches by estimated cardinality and builds a left-deep join tree
//! 5. Appends aggregate, sort/limit and projection steps

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::config::FederationConfig;
use crate::connector::registry::{SourceDescriptor, SourceRegistry};
use crate::connector::types::{
    ColumnFilter, OrderKey, PushedAggregate, PushedReducer, ScanRequest, TableColumn,
};
use crate::error::PlanningError;
use crate::federation::exec::aggregate::ReducerBinding;
use crate::federation::exec::sort::SortKey;
use crate::federation::plan::{
    reducer_accepts, AggregateStep, FetchStep, FilterStep, JoinKey, JoinStep, Plan, PostFilter,
    ProjectStep, Side, SortLimitStep, Step, StepId, StepKind,
};
use crate::federation::reconcile::{
    coerce_literal, reconcile_field, reconcile_join, Coercion, LogicalField,
};
use crate::federation::types::{FieldRef, JoinKind, QueryDescriptor};

/// A source resolved against the registry.
struct SourcePlan {
    name: String,
    declared_at: usize,
    descriptor: Arc<SourceDescriptor>,
    estimated_rows: u64,
    selective: bool,
    pushed: Vec<ColumnFilter>,
    post: Vec<(String, Coercion, ColumnFilter)>,
}

impl SourcePlan {
    fn column(&self, field: &str) -> Result<&TableColumn, PlanningError> {
        self.descriptor
            .schema()
            .column(field)
            .ok_or_else(|| PlanningError::missing_field(&self.name, field))
    }
}

/// A join edge whose key types reconcile.
struct ResolvedEdge {
    left: FieldRef,
    right: FieldRef,
    kind: JoinKind,
    field: LogicalField,
}

/// Accumulated state of the left-deep join tree.
struct JoinedSet {
    step: StepId,
    columns: Vec<String>,
    sources: Vec<String>,
    estimated_rows: u64,
    selective: bool,
}

#[derive(Default)]
struct StepList {
    steps: Vec<Step>,
}

impl StepList {
    fn push(&mut self, columns: Vec<String>, kind: StepKind) -> StepId {
        let id = self.steps.len();
        self.steps.push(Step { id, columns, kind });
        id
    }

    fn columns(&self, id: StepId) -> &[String] {
        &self.steps[id].columns
    }
}

fn position(columns: &[String], name: &str) -> Option<usize> {
    columns.iter().position(|c| c == name)
}

/// Resolves an output column name (qualified field or reducer alias).
fn resolve_output(
    columns: &[String],
    name: &str,
    sources: &[String],
) -> Result<usize, PlanningError> {
    if let Some(idx) = position(columns, name) {
        return Ok(idx);
    }
    match FieldRef::parse(name) {
        Some(r) if sources.contains(&r.source) => Err(PlanningError::invalid(format!(
            "column '{name}' is not available at this point of the query"
        ))),
        _ => Err(PlanningError::invalid(format!("unknown output column '{name}'"))),
    }
}

/// Builds the execution plan for `descriptor`.
#[instrument(skip_all, fields(sources = ?descriptor.sources))]
pub fn build_plan(
    descriptor: &QueryDescriptor,
    registry: &SourceRegistry,
    config: &FederationConfig,
) -> Result<Plan, PlanningError> {
    descriptor.validate()?;

    let timeout = Duration::from_millis(
        descriptor
            .timeout_ms
            .unwrap_or(config.default_source_timeout_ms),
    );

    // Resolve sources and every field they are asked for
    let mut sources = resolve_sources(descriptor, registry, config)?;
    let referenced = descriptor.referenced_fields();
    for source in &sources {
        if let Some(fields) = referenced.get(&source.name) {
            for field in fields {
                source.column(field)?;
            }
        }
    }

    for source in sources.iter_mut() {
        let filters = descriptor.filters.get(&source.name);
        plan_filters(source, filters)?;
    }

    let edges = resolve_edges(descriptor, &sources)?;
    validate_aggregate(descriptor, &sources)?;

    let single = sources.len() == 1;
    let mut steps = StepList::default();

    // Fetch steps, smallest estimate first, ties by declaration order
    let mut order: Vec<usize> = (0..sources.len()).collect();
    order.sort_by_key(|&i| (sources[i].estimated_rows, sources[i].declared_at));

    let agg_pushdown = single && aggregate_pushable(descriptor, &sources[0]);
    let order_pushdown = single
        && descriptor.aggregate.is_none()
        && order_limit_pushable(descriptor, &sources[0]);

    let mut inputs: BTreeMap<String, StepId> = BTreeMap::new();
    for &i in &order {
        let source = &sources[i];
        let mut request = ScanRequest {
            filters: source.pushed.clone(),
            ..Default::default()
        };

        let columns = if agg_pushdown {
            let aggregate = descriptor.aggregate.as_ref().map(|spec| PushedAggregate {
                group_by: spec.group_by.iter().map(|g| g.field.clone()).collect(),
                reducers: spec
                    .reducers
                    .iter()
                    .map(|r| PushedReducer {
                        function: r.function,
                        column: r.field.as_ref().map(|f| f.field.clone()),
                        alias: r.output_name(),
                    })
                    .collect(),
            });
            let mut columns: Vec<String> = descriptor
                .aggregate
                .iter()
                .flat_map(|spec| spec.group_by.iter().map(FieldRef::qualified))
                .collect();
            if let Some(pushed) = &aggregate {
                columns.extend(pushed.reducers.iter().map(|r| r.alias.clone()));
            }
            request.aggregate = aggregate;
            columns
        } else {
            let projection = projection_for(descriptor, source, &referenced);
            let names = projection
                .clone()
                .unwrap_or_else(|| source.descriptor.schema().column_names());
            request.projection = projection;
            names
                .iter()
                .map(|f| FieldRef::new(&source.name, f).qualified())
                .collect()
        };

        if order_pushdown {
            request.order = descriptor
                .order_by
                .iter()
                .filter_map(|o| {
                    FieldRef::parse(&o.field).map(|r| OrderKey {
                        column: r.field,
                        direction: o.direction,
                    })
                })
                .collect();
            request.limit = descriptor.limit;
        }

        let fetch = steps.push(
            columns,
            StepKind::Fetch(FetchStep {
                source: source.name.clone(),
                request,
                estimated_rows: source.estimated_rows,
                timeout,
            }),
        );
        inputs.insert(source.name.clone(), fetch);
    }

    // Post-fetch filters for sources that could not evaluate them
    for &i in &order {
        let source = &sources[i];
        if source.post.is_empty() {
            continue;
        }
        let fetch = inputs[&source.name];
        let columns = steps.columns(fetch).to_vec();
        let predicates = source
            .post
            .iter()
            .map(|(qualified, coercion, filter)| {
                position(&columns, qualified)
                    .map(|column| PostFilter {
                        column,
                        coercion: *coercion,
                        filter: filter.clone(),
                    })
                    .ok_or_else(|| PlanningError::missing_field(&source.name, &filter.column))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let filtered = steps.push(
            columns,
            StepKind::Filter(FilterStep {
                input: fetch,
                predicates,
            }),
        );
        inputs.insert(source.name.clone(), filtered);
    }

    // Left-deep join tree
    let first = &sources[order[0]];
    let mut joined = JoinedSet {
        step: inputs[&first.name],
        columns: steps.columns(inputs[&first.name]).to_vec(),
        sources: vec![first.name.clone()],
        estimated_rows: first.estimated_rows,
        selective: first.selective,
    };
    let mut remaining: Vec<usize> = order[1..].to_vec();
    while !remaining.is_empty() {
        let connected = remaining.iter().position(|&i| {
            edges.iter().any(|e| connects(e, &joined.sources, &sources[i].name))
        });
        let next = remaining.remove(connected.unwrap_or(0));
        joined = plan_join(&mut steps, joined, &sources[next], inputs[&sources[next].name], &edges)?;
    }

    let declared: Vec<String> = descriptor.sources.clone();
    let mut current = joined.step;

    // Aggregation
    if let Some(spec) = descriptor.aggregate.as_ref().filter(|_| !agg_pushdown) {
        let input_columns = steps.columns(current).to_vec();
        let group_by = spec
            .group_by
            .iter()
            .map(|g| resolve_output(&input_columns, &g.qualified(), &declared))
            .collect::<Result<Vec<_>, _>>()?;
        let reducers = spec
            .reducers
            .iter()
            .map(|r| {
                Ok(ReducerBinding {
                    function: r.function,
                    input: r
                        .field
                        .as_ref()
                        .map(|f| resolve_output(&input_columns, &f.qualified(), &declared))
                        .transpose()?,
                })
            })
            .collect::<Result<Vec<_>, PlanningError>>()?;

        let mut columns: Vec<String> = spec.group_by.iter().map(FieldRef::qualified).collect();
        columns.extend(spec.reducers.iter().map(|r| r.output_name()));
        current = steps.push(
            columns,
            StepKind::Aggregate(AggregateStep {
                input: current,
                group_by,
                reducers,
            }),
        );
    }

    // Sort and limit unless the single source already applied them
    if !order_pushdown && (!descriptor.order_by.is_empty() || descriptor.limit.is_some()) {
        let columns = steps.columns(current).to_vec();
        let keys = descriptor
            .order_by
            .iter()
            .map(|o| {
                Ok(SortKey {
                    column: resolve_output(&columns, &o.field, &declared)?,
                    direction: o.direction,
                })
            })
            .collect::<Result<Vec<_>, PlanningError>>()?;
        current = steps.push(
            columns,
            StepKind::SortLimit(SortLimitStep {
                input: current,
                keys,
                limit: descriptor.limit,
            }),
        );
    }

    // Final projection: explicit select, or declaration order of sources
    let columns = steps.columns(current).to_vec();
    let selected: Vec<String> = if !descriptor.select.is_empty() {
        descriptor.select.clone()
    } else if descriptor.aggregate.is_none() && joined.sources != declared {
        declared
            .iter()
            .flat_map(|name| {
                let prefix = format!("{name}.");
                columns
                    .iter()
                    .filter(move |c| c.starts_with(&prefix))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    } else {
        Vec::new()
    };
    if !selected.is_empty() && selected != columns {
        let indices = selected
            .iter()
            .map(|name| resolve_output(&columns, name, &declared))
            .collect::<Result<Vec<_>, _>>()?;
        steps.push(
            selected,
            StepKind::Project(ProjectStep {
                input: current,
                columns: indices,
            }),
        );
    }

    let plan = Plan::new(
        steps.steps,
        descriptor.cache_ttl_ms.map(Duration::from_millis),
        descriptor.bypass_cache,
    )
    .map_err(PlanningError::invalid)?;

    debug!(
        fingerprint = %plan.fingerprint(),
        steps = plan.steps().len(),
        join_order = ?joined.sources,
        "Built federation plan"
    );
    Ok(plan)
}

fn resolve_sources(
    descriptor: &QueryDescriptor,
    registry: &SourceRegistry,
    config: &FederationConfig,
) -> Result<Vec<SourcePlan>, PlanningError> {
    descriptor
        .sources
        .iter()
        .enumerate()
        .map(|(declared_at, name)| {
            let source = registry
                .get(name)
                .ok_or_else(|| PlanningError::unknown_source(name, &registry.names()))?;
            let selective = descriptor
                .filters
                .get(name)
                .is_some_and(|filters| filters.iter().any(|f| f.operator.is_selective()));
            Ok(SourcePlan {
                name: name.clone(),
                declared_at,
                estimated_rows: source
                    .cardinality_estimate()
                    .unwrap_or(config.unknown_cardinality_penalty),
                descriptor: source,
                selective,
                pushed: Vec::new(),
                post: Vec::new(),
            })
        })
        .collect()
}

/// Coerces literals and splits filters into pushed and post-fetch sets.
///
/// A filter is pushed only when the source supports it and the field needs no
/// coercion, so the store compares exactly what the engine would.
fn plan_filters(
    source: &mut SourcePlan,
    filters: Option<&Vec<ColumnFilter>>,
) -> Result<(), PlanningError> {
    let Some(filters) = filters else {
        return Ok(());
    };
    let can_push = source.descriptor.capabilities().supports_filter_pushdown;

    for filter in filters {
        let field_ref = FieldRef::new(&source.name, &filter.column);
        let field = reconcile_field(&field_ref, source.column(&filter.column)?);
        let coerced = coerce_literal(&field, filter)?;
        let coercion = field.coercion(&source.name);

        if can_push && coercion == Coercion::Identity {
            source.pushed.push(coerced);
        } else {
            source.post.push((field_ref.qualified(), coercion, coerced));
        }
    }

    // Canonical order so equivalent descriptors share a fingerprint
    let canonical = |f: &ColumnFilter| (f.column.clone(), f.operator.as_str(), f.value.to_string());
    source.pushed.sort_by_key(canonical);
    source.post.sort_by_key(|(_, _, f)| canonical(f));
    Ok(())
}

fn resolve_edges(
    descriptor: &QueryDescriptor,
    sources: &[SourcePlan],
) -> Result<Vec<ResolvedEdge>, PlanningError> {
    let by_name: BTreeMap<&str, &SourcePlan> =
        sources.iter().map(|s| (s.name.as_str(), s)).collect();

    descriptor
        .joins
        .iter()
        .map(|edge| {
            let left = by_name[edge.left.source.as_str()];
            let right = by_name[edge.right.source.as_str()];
            let field = reconcile_join(
                &edge.left,
                left.column(&edge.left.field)?,
                &edge.right,
                right.column(&edge.right.field)?,
            )?;
            Ok(ResolvedEdge {
                left: edge.left.clone(),
                right: edge.right.clone(),
                kind: edge.kind,
                field,
            })
        })
        .collect()
}

fn validate_aggregate(
    descriptor: &QueryDescriptor,
    sources: &[SourcePlan],
) -> Result<(), PlanningError> {
    let Some(spec) = &descriptor.aggregate else {
        return Ok(());
    };
    for reducer in &spec.reducers {
        let Some(field_ref) = &reducer.field else {
            continue;
        };
        let Some(source) = sources.iter().find(|s| s.name == field_ref.source) else {
            return Err(PlanningError::invalid(format!(
                "reducer field '{field_ref}' references an unlisted source"
            )));
        };
        let field = reconcile_field(field_ref, source.column(&field_ref.field)?);
        if !reducer_accepts(reducer.function, field.logical_type) {
            return Err(PlanningError::type_mismatch(
                field_ref.qualified(),
                field.logical_type.to_string(),
                reducer.output_name(),
                "numeric",
                format!("{} needs a numeric field", reducer.function),
            ));
        }
    }
    for group in &spec.group_by {
        if !sources.iter().any(|s| s.name == group.source) {
            return Err(PlanningError::invalid(format!(
                "group-by field '{group}' references an unlisted source"
            )));
        }
    }
    Ok(())
}

/// Fields a source must return; `None` returns every column.
fn projection_for(
    descriptor: &QueryDescriptor,
    source: &SourcePlan,
    referenced: &BTreeMap<String, BTreeSet<String>>,
) -> Option<Vec<String>> {
    if descriptor.select.is_empty() && descriptor.aggregate.is_none() {
        return None;
    }
    let wanted = referenced.get(&source.name);
    let mut projection: Vec<String> = source
        .descriptor
        .schema()
        .columns
        .iter()
        .filter(|c| wanted.is_some_and(|w| w.contains(&c.name)))
        .map(|c| c.name.clone())
        .collect();
    if projection.is_empty() {
        // Sources joined only for their existence still need one column
        projection.extend(source.descriptor.schema().columns.first().map(|c| c.name.clone()));
    }
    Some(projection)
}

fn identity_field(source: &SourcePlan, field: &FieldRef) -> bool {
    field.source == source.name
        && source
            .column(&field.field)
            .map(|c| reconcile_field(field, c).coercion(&source.name) == Coercion::Identity)
            .unwrap_or(false)
}

fn aggregate_pushable(descriptor: &QueryDescriptor, source: &SourcePlan) -> bool {
    let Some(spec) = &descriptor.aggregate else {
        return false;
    };
    source.descriptor.capabilities().supports_agg_pushdown
        && source.post.is_empty()
        && spec.group_by.iter().all(|g| identity_field(source, g))
        && spec
            .reducers
            .iter()
            .filter_map(|r| r.field.as_ref())
            .all(|f| identity_field(source, f))
}

fn order_limit_pushable(descriptor: &QueryDescriptor, source: &SourcePlan) -> bool {
    if descriptor.order_by.is_empty() && descriptor.limit.is_none() {
        return false;
    }
    if !source.post.is_empty() {
        return false;
    }
    descriptor.order_by.is_empty()
        || (source.descriptor.capabilities().supports_order_pushdown
            && descriptor.order_by.iter().all(|o| {
                FieldRef::parse(&o.field).is_some_and(|r| identity_field(source, &r))
            }))
}

fn connects(edge: &ResolvedEdge, joined: &[String], candidate: &str) -> bool {
    (edge.left.source == candidate && joined.contains(&edge.right.source))
        || (edge.right.source == candidate && joined.contains(&edge.left.source))
}

/// Adds `source` to the join tree.
fn plan_join(
    steps: &mut StepList,
    joined: JoinedSet,
    source: &SourcePlan,
    input: StepId,
    edges: &[ResolvedEdge],
) -> Result<JoinedSet, PlanningError> {
    let right_columns = steps.columns(input).to_vec();
    let mut keys = Vec::new();
    let mut kinds: BTreeSet<Option<Side>> = BTreeSet::new();

    for edge in edges.iter().filter(|e| connects(e, &joined.sources, &source.name)) {
        // Orient the edge as (joined side, new source side)
        let (existing, incoming, new_is_edge_left) = if edge.right.source == source.name {
            (&edge.left, &edge.right, false)
        } else {
            (&edge.right, &edge.left, true)
        };
        let left = position(&joined.columns, &existing.qualified())
            .ok_or_else(|| PlanningError::missing_field(&existing.source, &existing.field))?;
        let right = position(&right_columns, &incoming.qualified())
            .ok_or_else(|| PlanningError::missing_field(&incoming.source, &incoming.field))?;
        keys.push(JoinKey {
            left,
            right,
            left_coercion: edge.field.coercion(&existing.source),
            right_coercion: edge.field.coercion(&incoming.source),
            logical_type: edge.field.logical_type,
        });

        // For a left edge the edge's left source is the preserved one
        kinds.insert(match edge.kind {
            JoinKind::Inner => None,
            JoinKind::Left if new_is_edge_left => Some(Side::Right),
            JoinKind::Left => Some(Side::Left),
        });
    }

    if kinds.len() > 1 {
        return Err(PlanningError::invalid(format!(
            "conflicting join kinds between [{}] and '{}'",
            joined.sources.join(", "),
            source.name
        )));
    }
    let preserved = kinds.into_iter().next().flatten();

    let estimated_rows = if keys.is_empty() {
        let product = joined.estimated_rows.saturating_mul(source.estimated_rows);
        let guarded = joined.estimated_rows >= 2 && source.estimated_rows >= 2;
        if guarded && !joined.selective && !source.selective {
            return Err(PlanningError::UnsafeCartesian {
                left: joined.sources.join(","),
                right: source.name.clone(),
                estimated_rows: product,
            });
        }
        product
    } else {
        joined.estimated_rows.max(source.estimated_rows)
    };

    let build = if joined.estimated_rows <= source.estimated_rows {
        Side::Left
    } else {
        Side::Right
    };

    let mut columns = joined.columns;
    columns.extend(right_columns);
    let step = steps.push(
        columns.clone(),
        StepKind::Join(JoinStep {
            left: joined.step,
            right: input,
            keys,
            preserved,
            build,
            estimated_rows,
        }),
    );

    let mut sources = joined.sources;
    sources.push(source.name.clone());
    Ok(JoinedSet {
        step,
        columns,
        sources,
        estimated_rows,
        selective: joined.selective || source.selective,
    })
}
