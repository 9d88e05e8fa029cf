// SPDX-License-Identifier: Apache-2.0

//! Schema/Type Reconciler
//!
//! Maps each store's physical types onto a small logical type system and picks
//! an explicit coercion per source whenever two fields are compared across
//! stores (join keys) or against a literal (filters).

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::connector::types::{ColumnFilter, FilterOperator, TableColumn, Value};
use crate::error::PlanningError;
use crate::federation::types::FieldRef;

/// Logical type shared by every source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalType {
    Int64,
    Float64,
    String,
    Bool,
    Timestamp,
    Bytes,
}

impl LogicalType {
    pub fn is_numeric(self) -> bool {
        matches!(self, LogicalType::Int64 | LogicalType::Float64)
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogicalType::Int64 => "int64",
            LogicalType::Float64 => "float64",
            LogicalType::String => "string",
            LogicalType::Bool => "bool",
            LogicalType::Timestamp => "timestamp",
            LogicalType::Bytes => "bytes",
        };
        write!(f, "{name}")
    }
}

/// Maps a physical type name to its logical type.
///
/// Returns `None` for names outside the table; such columns are read as
/// strings through [`Coercion::ToString`].
pub fn physical_to_logical(physical: &str) -> Option<LogicalType> {
    let lowered = physical.trim().to_ascii_lowercase();
    let base = lowered.split('(').next().unwrap_or_default().trim();

    let logical = match base {
        "int" | "int2" | "int4" | "int8" | "integer" | "smallint" | "bigint" | "tinyint"
        | "mediumint" | "serial" | "smallserial" | "bigserial" | "long" | "short" | "byte"
        | "int32" | "int64" => LogicalType::Int64,
        "real" | "float" | "float4" | "float8" | "double" | "double precision" | "numeric"
        | "decimal" | "number" | "money" | "half_float" | "scaled_float" | "float32"
        | "float64" => LogicalType::Float64,
        "text" | "varchar" | "character varying" | "char" | "character" | "bpchar" | "string"
        | "keyword" | "citext" | "name" | "uuid" | "wildcard" | "constant_keyword" => {
            LogicalType::String
        }
        "bool" | "boolean" => LogicalType::Bool,
        "timestamp" | "timestamptz" | "timestamp with time zone"
        | "timestamp without time zone" | "datetime" | "date" | "date_nanos" => {
            LogicalType::Timestamp
        }
        "bytea" | "blob" | "binary" | "bytes" | "varbinary" | "bindata" => LogicalType::Bytes,
        _ => return None,
    };
    Some(logical)
}

/// Named coercion from a source value to its logical representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Coercion {
    Identity,
    ParseInt,
    /// Integral numbers written in any numeric notation (`"42"`, `"42.0"`).
    ParseNumber,
    ParseFloat,
    IntToFloat,
    ToString,
    EpochMillisToTimestamp,
    ParseTimestamp,
    ParseBool,
}

const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

fn integral_f64(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && (-I64_BOUND..I64_BOUND).contains(&f)).then_some(f as i64)
}

/// Integral numbers in decimal or scientific notation, parsed without going
/// through `f64`. Anything that does not fit an `i64` exactly is rejected.
fn integral_text(s: &str) -> Option<i64> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(i);
    }
    let exact = Decimal::from_str_exact(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()?;
    if !exact.fract().is_zero() {
        return None;
    }
    exact.trunc().to_i64()
}

impl Coercion {
    pub fn id(self) -> &'static str {
        match self {
            Coercion::Identity => "identity",
            Coercion::ParseInt => "parse_int",
            Coercion::ParseNumber => "parse_number",
            Coercion::ParseFloat => "parse_float",
            Coercion::IntToFloat => "int_to_float",
            Coercion::ToString => "to_string",
            Coercion::EpochMillisToTimestamp => "epoch_millis_to_timestamp",
            Coercion::ParseTimestamp => "parse_timestamp",
            Coercion::ParseBool => "parse_bool",
        }
    }

    /// Coercions that may lose precision.
    pub fn is_lossy(self) -> bool {
        matches!(self, Coercion::ParseFloat | Coercion::IntToFloat)
    }

    /// Applies the coercion. NULL stays NULL; `None` means the value cannot be
    /// represented in the target type.
    pub fn apply(self, value: &Value) -> Option<Value> {
        if value.is_null() {
            return Some(Value::Null);
        }
        match self {
            Coercion::Identity => Some(value.clone()),
            Coercion::ParseInt => match value {
                Value::Int(i) => Some(Value::Int(*i)),
                Value::Float(f) => integral_f64(*f).map(Value::Int),
                Value::Text(s) => s.trim().parse::<i64>().ok().map(Value::Int),
                _ => None,
            },
            Coercion::ParseNumber => match value {
                Value::Int(i) => Some(Value::Int(*i)),
                Value::Float(f) => integral_f64(*f).map(Value::Int),
                Value::Text(s) => integral_text(s.trim()).map(Value::Int),
                _ => None,
            },
            Coercion::ParseFloat => match value {
                Value::Int(i) => Some(Value::Float(*i as f64)),
                Value::Float(f) => Some(Value::Float(*f)),
                Value::Text(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(Value::Float),
                _ => None,
            },
            Coercion::IntToFloat => value.as_f64().map(Value::Float),
            Coercion::ToString => match value {
                Value::Text(s) => Some(Value::Text(s.clone())),
                Value::Json(serde_json::Value::String(s)) => Some(Value::Text(s.clone())),
                other => Some(Value::Text(other.to_string())),
            },
            Coercion::EpochMillisToTimestamp => match value {
                Value::Int(ms) => DateTime::from_timestamp_millis(*ms).map(Value::Timestamp),
                Value::Timestamp(ts) => Some(Value::Timestamp(*ts)),
                _ => None,
            },
            Coercion::ParseTimestamp => match value {
                Value::Timestamp(ts) => Some(Value::Timestamp(*ts)),
                Value::Text(s) => parse_timestamp(s).map(Value::Timestamp),
                _ => None,
            },
            Coercion::ParseBool => match value {
                Value::Bool(b) => Some(Value::Bool(*b)),
                Value::Int(0) => Some(Value::Bool(false)),
                Value::Int(1) => Some(Value::Bool(true)),
                Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "t" | "1" => Some(Value::Bool(true)),
                    "false" | "f" | "0" => Some(Value::Bool(false)),
                    _ => None,
                },
                _ => None,
            },
        }
    }
}

impl fmt::Display for Coercion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Parses RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]` (UTC) and bare dates.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let s = input.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// A reconciled field: logical type plus per-source physical type and
/// coercion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalField {
    pub name: String,
    pub logical_type: LogicalType,
    pub nullable: bool,
    pub physical: BTreeMap<String, String>,
    pub coercions: BTreeMap<String, Coercion>,
}

impl LogicalField {
    pub fn coercion(&self, source: &str) -> Coercion {
        self.coercions.get(source).copied().unwrap_or(Coercion::Identity)
    }

    pub fn is_lossy(&self) -> bool {
        self.coercions.values().any(|c| c.is_lossy())
    }
}

/// Native logical type and coercion of a single column.
fn native(column: &TableColumn) -> (LogicalType, Coercion) {
    match physical_to_logical(&column.data_type) {
        Some(logical) => (logical, Coercion::Identity),
        None => (LogicalType::String, Coercion::ToString),
    }
}

/// Reconciles a field read from a single source (filters, aggregates,
/// ordering).
pub fn reconcile_field(field: &FieldRef, column: &TableColumn) -> LogicalField {
    let (logical_type, coercion) = native(column);
    LogicalField {
        name: field.qualified(),
        logical_type,
        nullable: column.nullable,
        physical: BTreeMap::from([(field.source.clone(), column.data_type.clone())]),
        coercions: BTreeMap::from([(field.source.clone(), coercion)]),
    }
}

/// First non-null sample the coercion rejects.
fn first_rejected(samples: &[Value], coercion: Coercion) -> Option<&Value> {
    samples
        .iter()
        .filter(|v| !v.is_null())
        .find(|v| coercion.apply(v).is_none())
}

/// Resolution of a pair where one side is typed and the other a string.
///
/// Returns `(logical, typed-side coercion, string-side coercion)`.
fn resolve_against_string(
    typed: LogicalType,
    typed_native: Coercion,
    samples: &[Value],
) -> Result<(LogicalType, Coercion, Coercion), String> {
    let describe = |v: &Value| format!("sample value '{v}' is not a valid {typed}");
    match typed {
        LogicalType::Int64 => {
            for candidate in [Coercion::ParseInt, Coercion::ParseNumber] {
                if first_rejected(samples, candidate).is_none() {
                    return Ok((LogicalType::Int64, typed_native, candidate));
                }
            }
            match first_rejected(samples, Coercion::ParseFloat) {
                None => Ok((LogicalType::Float64, Coercion::IntToFloat, Coercion::ParseFloat)),
                Some(v) => Err(describe(v)),
            }
        }
        LogicalType::Float64 => match first_rejected(samples, Coercion::ParseFloat) {
            None => Ok((LogicalType::Float64, typed_native, Coercion::ParseFloat)),
            Some(v) => Err(describe(v)),
        },
        LogicalType::Timestamp => match first_rejected(samples, Coercion::ParseTimestamp) {
            None => Ok((LogicalType::Timestamp, typed_native, Coercion::ParseTimestamp)),
            Some(v) => Err(describe(v)),
        },
        LogicalType::Bool => match first_rejected(samples, Coercion::ParseBool) {
            None => Ok((LogicalType::Bool, typed_native, Coercion::ParseBool)),
            Some(v) => Err(describe(v)),
        },
        LogicalType::String | LogicalType::Bytes => {
            Err(format!("no lossless coercion between {typed} and string"))
        }
    }
}

/// Resolves two join-key columns to the widest lossless logical type.
///
/// Fails with `TypeMismatch` naming both fields when no coercion exists.
/// String-encoded numbers, timestamps and booleans are recognised from the
/// string side's sampled values; a column without samples is trusted and
/// uncoercible values at runtime become NULL keys.
pub fn reconcile_join(
    left: &FieldRef,
    left_column: &TableColumn,
    right: &FieldRef,
    right_column: &TableColumn,
) -> Result<LogicalField, PlanningError> {
    let (lt, lc) = native(left_column);
    let (rt, rc) = native(right_column);

    let resolved = if lt == rt {
        Ok((lt, lc, rc))
    } else {
        match (lt, rt) {
            (LogicalType::Int64, LogicalType::Float64) => {
                Ok((LogicalType::Float64, Coercion::IntToFloat, rc))
            }
            (LogicalType::Float64, LogicalType::Int64) => {
                Ok((LogicalType::Float64, lc, Coercion::IntToFloat))
            }
            (LogicalType::Timestamp, LogicalType::Int64) => {
                Ok((LogicalType::Timestamp, lc, Coercion::EpochMillisToTimestamp))
            }
            (LogicalType::Int64, LogicalType::Timestamp) => {
                Ok((LogicalType::Timestamp, Coercion::EpochMillisToTimestamp, rc))
            }
            (typed, LogicalType::String) => resolve_against_string(typed, lc, &right_column.samples),
            (LogicalType::String, typed) => resolve_against_string(typed, rc, &left_column.samples)
                .map(|(logical, typed_side, string_side)| (logical, string_side, typed_side)),
            (a, b) => Err(format!("no lossless coercion between {a} and {b}")),
        }
    };

    let (logical_type, left_coercion, right_coercion) = resolved.map_err(|reason| {
        PlanningError::type_mismatch(
            left.qualified(),
            &left_column.data_type,
            right.qualified(),
            &right_column.data_type,
            reason,
        )
    })?;

    let field = LogicalField {
        name: format!("{left}={right}"),
        logical_type,
        nullable: left_column.nullable || right_column.nullable,
        physical: BTreeMap::from([
            (left.source.clone(), left_column.data_type.clone()),
            (right.source.clone(), right_column.data_type.clone()),
        ]),
        coercions: BTreeMap::from([
            (left.source.clone(), left_coercion),
            (right.source.clone(), right_coercion),
        ]),
    };

    if field.is_lossy() {
        warn_lossy_once(left, right, logical_type);
    }
    Ok(field)
}

static LOSSY_PAIRS: OnceLock<Mutex<HashSet<(String, String)>>> = OnceLock::new();

/// Logs a precision-loss warning the first time a field pair is coerced.
///
/// Returns whether the warning was emitted by this call.
pub fn warn_lossy_once(left: &FieldRef, right: &FieldRef, target: LogicalType) -> bool {
    let (a, b) = (left.qualified(), right.qualified());
    let key = if a <= b { (a, b) } else { (b, a) };
    let first = LOSSY_PAIRS
        .get_or_init(|| Mutex::new(HashSet::new()))
        .lock()
        .insert(key);
    if first {
        warn!(
            left = %left,
            right = %right,
            target = %target,
            "Join key coercion may lose precision"
        );
    }
    first
}

/// Coerces a filter literal to the field's logical type.
pub fn coerce_literal(field: &LogicalField, filter: &ColumnFilter) -> Result<ColumnFilter, PlanningError> {
    let mismatch = |reason: String| {
        PlanningError::type_mismatch(
            field.name.clone(),
            field.logical_type.to_string(),
            format!("literal {}", filter.value),
            filter.value.type_name(),
            reason,
        )
    };

    if !filter.operator.takes_value() {
        return Ok(ColumnFilter::new(&filter.column, filter.operator, Value::Null));
    }
    if filter.value.is_null() {
        return Err(mismatch(format!(
            "operator {} needs a non-null literal",
            filter.operator.as_str()
        )));
    }
    if filter.operator == FilterOperator::Like {
        return match (&filter.value, field.logical_type) {
            (Value::Text(_), LogicalType::String) => Ok(filter.clone()),
            _ => Err(mismatch("LIKE needs a string field and a string pattern".into())),
        };
    }

    let coercion = match (field.logical_type, &filter.value) {
        (LogicalType::Int64, _) => Coercion::ParseNumber,
        (LogicalType::Float64, _) => Coercion::ParseFloat,
        (LogicalType::String, _) => Coercion::ToString,
        (LogicalType::Bool, _) => Coercion::ParseBool,
        (LogicalType::Timestamp, Value::Int(_)) => Coercion::EpochMillisToTimestamp,
        (LogicalType::Timestamp, _) => Coercion::ParseTimestamp,
        (LogicalType::Bytes, Value::Bytes(_)) => Coercion::Identity,
        (LogicalType::Bytes, _) => {
            return Err(mismatch("only byte literals compare with bytes".into()))
        }
    };

    let value = coercion
        .apply(&filter.value)
        .ok_or_else(|| mismatch(format!("{coercion} cannot convert the literal")))?;
    Ok(ColumnFilter::new(&filter.column, filter.operator, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_col() -> TableColumn {
        TableColumn::new("id", "BIGINT")
    }

    fn string_col(samples: &[&str]) -> TableColumn {
        TableColumn::new("user_id", "string")
            .with_samples(samples.iter().map(|s| Value::Text(s.to_string())).collect())
    }

    fn refs() -> (FieldRef, FieldRef) {
        (FieldRef::new("A", "id"), FieldRef::new("B", "user_id"))
    }

    #[test]
    fn physical_names_are_case_and_parameter_insensitive() {
        assert_eq!(physical_to_logical("VARCHAR(255)"), Some(LogicalType::String));
        assert_eq!(physical_to_logical("numeric(10,2)"), Some(LogicalType::Float64));
        assert_eq!(
            physical_to_logical("timestamp with time zone"),
            Some(LogicalType::Timestamp)
        );
        assert_eq!(physical_to_logical("long"), Some(LogicalType::Int64));
        assert_eq!(physical_to_logical("geo_point"), None);
    }

    #[test]
    fn string_encoded_integers_reconcile_to_int64() {
        let (a, b) = refs();
        let field = reconcile_join(&a, &int_col(), &b, &string_col(&["42", "7"])).unwrap();
        assert_eq!(field.logical_type, LogicalType::Int64);
        assert_eq!(field.coercion("A"), Coercion::Identity);
        assert_eq!(field.coercion("B"), Coercion::ParseInt);
        assert_eq!(Coercion::ParseInt.apply(&"42".into()), Some(Value::Int(42)));
    }

    #[test]
    fn integral_decimals_use_parse_number() {
        let (a, b) = refs();
        let field = reconcile_join(&a, &int_col(), &b, &string_col(&["42.0"])).unwrap();
        assert_eq!(field.coercion("B"), Coercion::ParseNumber);
        assert_eq!(Coercion::ParseNumber.apply(&"42.0".into()), Some(Value::Int(42)));
        assert_eq!(Coercion::ParseNumber.apply(&"42.5".into()), None);
    }

    #[test]
    fn parse_number_keeps_full_integer_precision() {
        let apply = |s: &str| Coercion::ParseNumber.apply(&s.into());
        assert_eq!(apply("9007199254740993.0"), Some(Value::Int(9_007_199_254_740_993)));
        assert_eq!(apply("9223372036854775807.00"), Some(Value::Int(i64::MAX)));
        assert_eq!(apply("-9007199254740993.000"), Some(Value::Int(-9_007_199_254_740_993)));
        assert_eq!(apply("4.2e1"), Some(Value::Int(42)));
        assert_eq!(apply("9223372036854775808.0"), None);
        assert_eq!(apply("9007199254740993.5"), None);
    }

    #[test]
    fn non_numeric_samples_are_a_type_mismatch() {
        let (a, b) = refs();
        let err = reconcile_join(&a, &int_col(), &b, &string_col(&["42", "forty-two"])).unwrap_err();
        match err {
            PlanningError::TypeMismatch { left, right, reason, .. } => {
                assert_eq!(left, "A.id");
                assert_eq!(right, "B.user_id");
                assert!(reason.contains("forty-two"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn fractional_samples_widen_to_float() {
        let (a, b) = refs();
        let field = reconcile_join(&a, &int_col(), &b, &string_col(&["1.5"])).unwrap();
        assert_eq!(field.logical_type, LogicalType::Float64);
        assert_eq!(field.coercion("A"), Coercion::IntToFloat);
        assert!(field.is_lossy());
    }

    #[test]
    fn swapped_sides_keep_coercions_on_the_right_source() {
        let (a, b) = refs();
        let field = reconcile_join(&b, &string_col(&["1"]), &a, &int_col()).unwrap();
        assert_eq!(field.coercion("B"), Coercion::ParseInt);
        assert_eq!(field.coercion("A"), Coercion::Identity);
    }

    #[test]
    fn epoch_millis_meet_timestamps() {
        let field = reconcile_join(
            &FieldRef::new("A", "created"),
            &TableColumn::new("created", "timestamptz"),
            &FieldRef::new("B", "ts"),
            &TableColumn::new("ts", "long"),
        )
        .unwrap();
        assert_eq!(field.logical_type, LogicalType::Timestamp);
        assert_eq!(field.coercion("B"), Coercion::EpochMillisToTimestamp);
        assert_eq!(
            Coercion::EpochMillisToTimestamp.apply(&Value::Int(0)),
            Some(Value::Timestamp(DateTime::from_timestamp_millis(0).unwrap()))
        );
    }

    #[test]
    fn bool_and_int_do_not_reconcile() {
        let err = reconcile_join(
            &FieldRef::new("A", "flag"),
            &TableColumn::new("flag", "boolean"),
            &FieldRef::new("B", "n"),
            &TableColumn::new("n", "integer"),
        );
        assert!(matches!(err, Err(PlanningError::TypeMismatch { .. })));
    }

    #[test]
    fn lossy_warning_fires_once_per_pair() {
        let a = FieldRef::new("lossy_a", "x");
        let b = FieldRef::new("lossy_b", "y");
        assert!(warn_lossy_once(&a, &b, LogicalType::Float64));
        assert!(!warn_lossy_once(&b, &a, LogicalType::Float64));
    }

    #[test]
    fn literals_are_coerced_to_the_field_type() {
        let field = reconcile_field(&FieldRef::new("A", "id"), &int_col());
        let coerced = coerce_literal(
            &field,
            &ColumnFilter::new("id", FilterOperator::Eq, "42".into()),
        )
        .unwrap();
        assert_eq!(coerced.value, Value::Int(42));

        let err = coerce_literal(
            &field,
            &ColumnFilter::new("id", FilterOperator::Eq, "abc".into()),
        );
        assert!(err.is_err());
    }

    #[test]
    fn timestamps_parse_common_layouts() {
        assert!(parse_timestamp("2024-03-01T10:00:00Z").is_some());
        assert!(parse_timestamp("2024-03-01 10:00:00").is_some());
        assert!(parse_timestamp("2024-03-01").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }
}
