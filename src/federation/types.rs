// SPDX-License-Identifier: Apache-2.0

//! Types for the Cross-Store Federation engine.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::connector::types::{AggregateFunction, ColumnFilter, SortDirection};
use crate::error::PlanningError;

/// A `source.field` reference.
///
/// The first `.` separates the source name from the field, so nested document
/// paths such as `events.meta.user` keep their inner dots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldRef {
    pub source: String,
    pub field: String,
}

impl FieldRef {
    pub fn new(source: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            field: field.into(),
        }
    }

    pub fn parse(qualified: &str) -> Option<Self> {
        let (source, field) = qualified.split_once('.')?;
        if source.is_empty() || field.is_empty() {
            return None;
        }
        Some(Self::new(source, field))
    }

    pub fn qualified(&self) -> String {
        format!("{}.{}", self.source, self.field)
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.source, self.field)
    }
}

impl TryFrom<String> for FieldRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("expected 'source.field', got '{value}'"))
    }
}

impl From<FieldRef> for String {
    fn from(value: FieldRef) -> Self {
        value.qualified()
    }
}

/// Join kind between two sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    #[default]
    Inner,
    /// Keeps every row of the `left` side, padding the right with NULLs.
    Left,
}

/// Equality edge of the join graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinEdge {
    pub left: FieldRef,
    pub right: FieldRef,
    #[serde(default)]
    pub kind: JoinKind,
}

/// A reducer of the aggregation spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReducerSpec {
    pub function: AggregateFunction,
    /// `None` is only valid for `count` and counts rows.
    #[serde(default)]
    pub field: Option<FieldRef>,
    #[serde(default)]
    pub alias: Option<String>,
}

impl ReducerSpec {
    pub fn new(function: AggregateFunction, field: Option<FieldRef>) -> Self {
        Self {
            function,
            field,
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Output column name: the alias, or `sum(A.amt)` / `count(*)`.
    pub fn output_name(&self) -> String {
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        match &self.field {
            Some(field) => format!("{}({})", self.function, field),
            None => format!("{}(*)", self.function),
        }
    }
}

/// Optional aggregation: group-by fields plus reducers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpec {
    #[serde(default)]
    pub group_by: Vec<FieldRef>,
    pub reducers: Vec<ReducerSpec>,
}

/// Ordering on an output column (qualified field or reducer alias).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Structured federated query, produced by an external translator.
///
/// Wire form: `{ sources, filters, joins, aggregate, orderBy, limit, ... }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    /// Participating sources, in declaration order (the planner's tie-break).
    pub sources: Vec<String>,
    /// Per-source predicates, ANDed together.
    #[serde(default)]
    pub filters: BTreeMap<String, Vec<ColumnFilter>>,
    #[serde(default)]
    pub joins: Vec<JoinEdge>,
    #[serde(default)]
    pub aggregate: Option<AggregateSpec>,
    #[serde(default, alias = "orderBy")]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub limit: Option<u64>,
    /// Output columns; empty selects every column.
    #[serde(default)]
    pub select: Vec<String>,
    /// Cache TTL for this query, overriding the engine default.
    #[serde(default, alias = "cacheTtlMs")]
    pub cache_ttl_ms: Option<u64>,
    /// Per-source fetch timeout for this query.
    #[serde(default, alias = "timeoutMs")]
    pub timeout_ms: Option<u64>,
    /// Skip the cache lookup. The fresh result still replaces any cached one.
    #[serde(default, alias = "bypassCache")]
    pub bypass_cache: bool,
}

impl QueryDescriptor {
    pub fn new<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn filter(mut self, source: &str, filter: ColumnFilter) -> Self {
        self.filters.entry(source.to_string()).or_default().push(filter);
        self
    }

    pub fn join(mut self, left: &str, right: &str, kind: JoinKind) -> Self {
        match (FieldRef::parse(left), FieldRef::parse(right)) {
            (Some(left), Some(right)) => self.joins.push(JoinEdge { left, right, kind }),
            _ => {
                // Kept malformed so validation reports it.
                self.joins.push(JoinEdge {
                    left: FieldRef::new(left, ""),
                    right: FieldRef::new(right, ""),
                    kind,
                })
            }
        }
        self
    }

    pub fn aggregate(mut self, spec: AggregateSpec) -> Self {
        self.aggregate = Some(spec);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn cache_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.cache_ttl_ms = Some(ttl_ms);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Structural checks that need no source metadata.
    pub fn validate(&self) -> Result<(), PlanningError> {
        if self.sources.is_empty() {
            return Err(PlanningError::invalid("at least one source is required"));
        }

        let mut seen = BTreeSet::new();
        for source in &self.sources {
            if source.is_empty() {
                return Err(PlanningError::invalid("source names must not be empty"));
            }
            if !seen.insert(source.as_str()) {
                return Err(PlanningError::DuplicateSource {
                    source_name: source.clone(),
                });
            }
        }

        for source in self.filters.keys() {
            if !seen.contains(source.as_str()) {
                return Err(PlanningError::invalid(format!(
                    "filters reference source '{source}' which is not listed in sources"
                )));
            }
        }

        for edge in &self.joins {
            if edge.left.field.is_empty() || edge.right.field.is_empty() {
                return Err(PlanningError::invalid(format!(
                    "join edge '{}' <-> '{}' must use source.field references",
                    edge.left.source, edge.right.source
                )));
            }
            for side in [&edge.left, &edge.right] {
                if !seen.contains(side.source.as_str()) {
                    return Err(PlanningError::invalid(format!(
                        "join references source '{}' which is not listed in sources",
                        side.source
                    )));
                }
            }
            if edge.left.source == edge.right.source {
                return Err(PlanningError::invalid(format!(
                    "self-join on '{}' is not supported",
                    edge.left.source
                )));
            }
        }

        if let Some(aggregate) = &self.aggregate {
            if aggregate.reducers.is_empty() && aggregate.group_by.is_empty() {
                return Err(PlanningError::invalid(
                    "aggregate needs at least one group-by field or reducer",
                ));
            }
            for reducer in &aggregate.reducers {
                if reducer.field.is_none() && reducer.function != AggregateFunction::Count {
                    return Err(PlanningError::invalid(format!(
                        "{} requires a field",
                        reducer.function
                    )));
                }
            }
        }

        Ok(())
    }

    /// Every qualified field the query reads, per source.
    pub fn referenced_fields(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut fields: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut add = |r: &FieldRef| {
            fields.entry(r.source.clone()).or_default().insert(r.field.clone());
        };

        for (source, filters) in &self.filters {
            for filter in filters {
                add(&FieldRef::new(source.clone(), filter.column.clone()));
            }
        }
        for edge in &self.joins {
            add(&edge.left);
            add(&edge.right);
        }
        if let Some(aggregate) = &self.aggregate {
            aggregate.group_by.iter().for_each(&mut add);
            aggregate
                .reducers
                .iter()
                .filter_map(|r| r.field.as_ref())
                .for_each(&mut add);
        }
        for name in self.select.iter().chain(self.order_by.iter().map(|o| &o.field)) {
            if let Some(r) = FieldRef::parse(name) {
                if self.sources.contains(&r.source) {
                    add(&r);
                }
            }
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::types::{FilterOperator, Value};

    #[test]
    fn parses_wire_form() {
        let json = r#"{
            "sources": ["orders", "users"],
            "filters": { "orders": [ { "column": "status", "operator": "eq", "value": "paid" } ] },
            "joins": [ { "left": "orders.user_id", "right": "users.id", "kind": "left" } ],
            "aggregate": { "group_by": ["users.country"], "reducers": [ { "function": "sum", "field": "orders.amount", "alias": "revenue" } ] },
            "orderBy": [ { "field": "revenue", "direction": "desc" } ],
            "limit": 10
        }"#;
        let descriptor: QueryDescriptor = serde_json::from_str(json).unwrap();
        descriptor.validate().unwrap();

        assert_eq!(descriptor.sources, vec!["orders", "users"]);
        assert_eq!(descriptor.joins[0].kind, JoinKind::Left);
        assert_eq!(descriptor.joins[0].right, FieldRef::new("users", "id"));
        assert_eq!(descriptor.order_by[0].direction, SortDirection::Desc);
        assert_eq!(descriptor.limit, Some(10));
        let reducer = &descriptor.aggregate.as_ref().unwrap().reducers[0];
        assert_eq!(reducer.output_name(), "revenue");
    }

    #[test]
    fn rejects_malformed_field_refs() {
        let json = r#"{ "sources": ["a"], "joins": [ { "left": "a", "right": "b.id" } ] }"#;
        assert!(serde_json::from_str::<QueryDescriptor>(json).is_err());
    }

    #[test]
    fn nested_document_paths_keep_inner_dots() {
        let r = FieldRef::parse("events.meta.user").unwrap();
        assert_eq!(r.source, "events");
        assert_eq!(r.field, "meta.user");
    }

    #[test]
    fn validate_catches_structural_errors() {
        assert!(QueryDescriptor::default().validate().is_err());

        let dup = QueryDescriptor::new(["a", "a"]);
        assert!(matches!(
            dup.validate(),
            Err(PlanningError::DuplicateSource { .. })
        ));

        let stray_filter = QueryDescriptor::new(["a"]).filter(
            "b",
            ColumnFilter::new("x", FilterOperator::Eq, Value::Int(1)),
        );
        assert!(stray_filter.validate().is_err());

        let self_join = QueryDescriptor::new(["a"]).join("a.id", "a.parent", JoinKind::Inner);
        assert!(self_join.validate().is_err());

        let sum_without_field = QueryDescriptor::new(["a"]).aggregate(AggregateSpec {
            group_by: vec![],
            reducers: vec![ReducerSpec::new(AggregateFunction::Sum, None)],
        });
        assert!(sum_without_field.validate().is_err());
    }

    #[test]
    fn referenced_fields_cover_every_clause() {
        let descriptor = QueryDescriptor::new(["a", "b"])
            .filter("a", ColumnFilter::new("status", FilterOperator::Eq, "ok".into()))
            .join("a.id", "b.a_id", JoinKind::Inner)
            .select(["b.name", "a.id"])
            .order_by(OrderBy::asc("b.created"));

        let fields = descriptor.referenced_fields();
        let a: Vec<_> = fields["a"].iter().cloned().collect();
        let b: Vec<_> = fields["b"].iter().cloned().collect();
        assert_eq!(a, vec!["id", "status"]);
        assert_eq!(b, vec!["a_id", "created", "name"]);
    }
}
