// SPDX-License-Identifier: Apache-2.0

//! Universal data types shared by every store connector
//!
//! These types provide a normalized representation of rows, schemas and scan
//! requests across relational, document, search and key-value stores.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of store behind a connector.
///
/// Informational only: planning and execution branch on capabilities, never
/// on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Relational,
    Document,
    Search,
    KeyValue,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Relational => write!(f, "relational"),
            StoreKind::Document => write!(f, "document"),
            StoreKind::Search => write!(f, "search"),
            StoreKind::KeyValue => write!(f, "kv"),
        }
    }
}

/// Reported capabilities for a connector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorCapabilities {
    pub supports_filter_pushdown: bool,
    pub supports_agg_pushdown: bool,
    pub supports_order_pushdown: bool,
    pub supports_lookup: bool,
}

impl ConnectorCapabilities {
    /// No pushdown at all: the engine filters, aggregates and sorts itself.
    pub const fn scan_only() -> Self {
        Self {
            supports_filter_pushdown: false,
            supports_agg_pushdown: false,
            supports_order_pushdown: false,
            supports_lookup: false,
        }
    }

    pub const fn full() -> Self {
        Self {
            supports_filter_pushdown: true,
            supports_agg_pushdown: true,
            supports_order_pushdown: true,
            supports_lookup: true,
        }
    }
}

/// Universal value representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
    Array(Vec<Value>),
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short type label used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int64",
            Value::Float(_) => "float64",
            Value::Text(_) => "string",
            Value::Timestamp(_) => "timestamp",
            Value::Bytes(_) => "bytes",
            Value::Json(_) => "json",
            Value::Array(_) => "array",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Ordering between two values of compatible types.
    ///
    /// Ints and floats compare numerically; everything else only compares
    /// within its own variant. Returns `None` for NULLs and incomparable pairs.
    pub fn partial_cmp_value(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Total order used by sorting: NULLs sort after every non-NULL value,
    /// incomparable variants fall back to a fixed variant rank.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            _ => {}
        }
        self.partial_cmp_value(other)
            .unwrap_or_else(|| self.rank().cmp(&other.rank()))
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Text(_) => 3,
            Value::Timestamp(_) => 4,
            Value::Bytes(_) => 5,
            Value::Json(_) => 6,
            Value::Array(_) => 7,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Json(j) => write!(f, "{j}"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Hashable, totally-equal projection of a [`Value`].
///
/// Join and group-by keys are built from coerced logical values, so two keys
/// are equal exactly when their logical values are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    Null,
    Bool(bool),
    Int(i64),
    /// IEEE-754 bits with `-0.0` folded into `0.0` and a single NaN.
    Float(u64),
    Text(String),
    /// Microseconds since the Unix epoch.
    Timestamp(i64),
    Bytes(Vec<u8>),
    /// JSON and arrays compare by their canonical text.
    Other(String),
}

impl From<&Value> for KeyValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => KeyValue::Null,
            Value::Bool(b) => KeyValue::Bool(*b),
            Value::Int(i) => KeyValue::Int(*i),
            Value::Float(f) => {
                let normalized = if *f == 0.0 {
                    0.0f64
                } else if f.is_nan() {
                    f64::NAN
                } else {
                    *f
                };
                KeyValue::Float(normalized.to_bits())
            }
            Value::Text(s) => KeyValue::Text(s.clone()),
            Value::Timestamp(ts) => KeyValue::Timestamp(ts.timestamp_micros()),
            Value::Bytes(b) => KeyValue::Bytes(b.clone()),
            other => KeyValue::Other(other.to_string()),
        }
    }
}

impl KeyValue {
    pub fn is_null(&self) -> bool {
        matches!(self, KeyValue::Null)
    }
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// A single row of data (indexed by column order)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// A row of `width` NULLs, used to pad unmatched join sides.
    pub fn nulls(width: usize) -> Self {
        Self {
            values: vec![Value::Null; width],
        }
    }

    pub fn get(&self, idx: usize) -> &Value {
        self.values.get(idx).unwrap_or(&Value::Null)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Concatenates two rows, left values first.
    pub fn concat(&self, other: &Row) -> Row {
        let mut values = Vec::with_capacity(self.values.len() + other.values.len());
        values.extend_from_slice(&self.values);
        values.extend_from_slice(&other.values);
        Row { values }
    }
}

/// Column metadata for a source schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableColumn {
    /// Column or field name
    pub name: String,
    /// Physical data type as the store reports it (e.g. "INTEGER", "string")
    pub data_type: String,
    /// Whether the column allows NULL / missing values
    pub nullable: bool,
    /// Sampled values, used to detect string-encoded numbers and timestamps
    #[serde(default)]
    pub samples: Vec<Value>,
}

impl TableColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            samples: Vec::new(),
        }
    }

    pub fn with_samples(mut self, samples: Vec<Value>) -> Self {
        self.samples = samples;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Source schema metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableSchema {
    /// Column definitions, in the order scans return them
    pub columns: Vec<TableColumn>,
    /// Estimated row count (if the store exposes statistics)
    pub row_count_estimate: Option<u64>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&TableColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Sort direction for query results
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Filter operator for predicates
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    #[default]
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    IsNull,
    IsNotNull,
}

impl FilterOperator {
    /// Whether the operator needs a comparison literal.
    pub fn takes_value(&self) -> bool {
        !matches!(self, FilterOperator::IsNull | FilterOperator::IsNotNull)
    }

    /// Operators that meaningfully narrow a scan. `!=` and `IS NOT NULL`
    /// usually keep most rows and do not count.
    pub fn is_selective(&self) -> bool {
        !matches!(self, FilterOperator::Neq | FilterOperator::IsNotNull)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "=",
            FilterOperator::Neq => "!=",
            FilterOperator::Gt => ">",
            FilterOperator::Gte => ">=",
            FilterOperator::Lt => "<",
            FilterOperator::Lte => "<=",
            FilterOperator::Like => "LIKE",
            FilterOperator::IsNull => "IS NULL",
            FilterOperator::IsNotNull => "IS NOT NULL",
        }
    }
}

/// Column filter for a single source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnFilter {
    pub column: String,
    pub operator: FilterOperator,
    #[serde(default = "null_value")]
    pub value: Value,
}

fn null_value() -> Value {
    Value::Null
}

impl ColumnFilter {
    pub fn new(column: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            column: column.into(),
            operator,
            value,
        }
    }

    /// Evaluates the predicate against an already-coerced value.
    ///
    /// Comparisons against NULL are false, as in SQL.
    pub fn matches(&self, value: &Value) -> bool {
        match self.operator {
            FilterOperator::IsNull => value.is_null(),
            FilterOperator::IsNotNull => !value.is_null(),
            FilterOperator::Like => match (value, &self.value) {
                (Value::Text(s), Value::Text(pattern)) => like_match(s, pattern),
                _ => false,
            },
            op => {
                if value.is_null() || self.value.is_null() {
                    return false;
                }
                let Some(ord) = value.partial_cmp_value(&self.value) else {
                    return false;
                };
                match op {
                    FilterOperator::Eq => ord == Ordering::Equal,
                    FilterOperator::Neq => ord != Ordering::Equal,
                    FilterOperator::Gt => ord == Ordering::Greater,
                    FilterOperator::Gte => ord != Ordering::Less,
                    FilterOperator::Lt => ord == Ordering::Less,
                    FilterOperator::Lte => ord != Ordering::Greater,
                    _ => false,
                }
            }
        }
    }
}

/// SQL `LIKE` with `%` and `_` wildcards, case-sensitive.
pub fn like_match(input: &str, pattern: &str) -> bool {
    let text: Vec<char> = input.chars().collect();
    let pat: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pat.len() && (pat[p] == '_' || pat[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pat.len() && pat[p] == '%' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '%' {
        p += 1;
    }
    p == pat.len()
}

/// Ordering key for a scan or a sort step
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderKey {
    pub column: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Aggregate reducer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Count => "count",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        };
        write!(f, "{name}")
    }
}

/// A reducer over a single source column, pushed down to the store.
///
/// `column == None` is only valid for `count` and counts rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PushedReducer {
    pub function: AggregateFunction,
    pub column: Option<String>,
    pub alias: String,
}

/// An aggregation evaluated entirely by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PushedAggregate {
    pub group_by: Vec<String>,
    pub reducers: Vec<PushedReducer>,
}

/// Request passed to [`Connector::scan`](super::traits::Connector::scan).
///
/// Row layout contract: with an aggregate, rows are `group_by` columns
/// followed by reducer results; otherwise rows follow `projection` or, when it
/// is `None`, the schema column order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub filters: Vec<ColumnFilter>,
    pub projection: Option<Vec<String>>,
    pub order: Vec<OrderKey>,
    pub limit: Option<u64>,
    pub aggregate: Option<PushedAggregate>,
}

impl ScanRequest {
    /// Names of the columns the connector must return, in order.
    pub fn output_columns(&self, schema: &TableSchema) -> Vec<String> {
        if let Some(agg) = &self.aggregate {
            let mut cols = agg.group_by.clone();
            cols.extend(agg.reducers.iter().map(|r| r.alias.clone()));
            return cols;
        }
        match &self.projection {
            Some(cols) => cols.clone(),
            None => schema.column_names(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_supports_both_wildcards() {
        assert!(like_match("federation", "fed%"));
        assert!(like_match("federation", "%ration"));
        assert!(like_match("federation", "f_deration"));
        assert!(like_match("federation", "%dera%"));
        assert!(!like_match("federation", "fed"));
        assert!(!like_match("federation", "%x%"));
    }

    #[test]
    fn filters_never_match_null() {
        let filter = ColumnFilter::new("amt", FilterOperator::Neq, Value::Int(3));
        assert!(!filter.matches(&Value::Null));
        assert!(filter.matches(&Value::Int(4)));

        let is_null = ColumnFilter::new("amt", FilterOperator::IsNull, Value::Null);
        assert!(is_null.matches(&Value::Null));
    }

    #[test]
    fn numeric_filters_compare_across_int_and_float() {
        let filter = ColumnFilter::new("amt", FilterOperator::Gte, Value::Float(9.5));
        assert!(filter.matches(&Value::Int(10)));
        assert!(!filter.matches(&Value::Int(9)));
    }

    #[test]
    fn key_value_folds_negative_zero() {
        assert_eq!(
            KeyValue::from(&Value::Float(-0.0)),
            KeyValue::from(&Value::Float(0.0))
        );
        assert_ne!(KeyValue::from(&Value::Int(1)), KeyValue::from(&Value::Text("1".into())));
    }

    #[test]
    fn total_cmp_puts_nulls_last() {
        let mut values = vec![Value::Null, Value::Int(3), Value::Int(1)];
        values.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(values, vec![Value::Int(1), Value::Int(3), Value::Null]);
    }

    #[test]
    fn scan_output_columns_follow_aggregate_layout() {
        let request = ScanRequest {
            aggregate: Some(PushedAggregate {
                group_by: vec!["cat".into()],
                reducers: vec![PushedReducer {
                    function: AggregateFunction::Sum,
                    column: Some("amt".into()),
                    alias: "sum(amt)".into(),
                }],
            }),
            ..Default::default()
        };
        assert_eq!(
            request.output_columns(&TableSchema::default()),
            vec!["cat".to_string(), "sum(amt)".to_string()]
        );
    }
}
