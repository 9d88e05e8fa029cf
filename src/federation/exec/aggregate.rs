// SPDX-License-Identifier: Apache-2.0

//! Streaming group-by aggregation.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

use crate::connector::types::{AggregateFunction, KeyValue, Row, Value};
use crate::error::ExecutionError;

/// A reducer bound to an input column index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReducerBinding {
    pub function: AggregateFunction,
    /// `None` counts rows.
    pub input: Option<usize>,
}

#[derive(Debug, Clone)]
enum Accumulator {
    Sum(SumState),
    Count(i64),
    Avg { sum: f64, count: i64 },
    Min(Value),
    Max(Value),
}

/// Sum with an exact integer part. The result is narrowed to `i64` or widened
/// to float only in `finish`, so it does not depend on arrival order.
#[derive(Debug, Clone, Default)]
struct SumState {
    int: i128,
    float: f64,
    has_float: bool,
    seen: bool,
}

impl SumState {
    fn add(&mut self, value: &Value) {
        match value {
            Value::Int(i) => self.int = self.int.saturating_add(i128::from(*i)),
            Value::Float(f) => {
                self.float += f;
                self.has_float = true;
            }
            _ => return,
        }
        self.seen = true;
    }

    fn finish(&self) -> Value {
        if !self.seen {
            return Value::Null;
        }
        if self.has_float {
            return Value::Float(self.int as f64 + self.float);
        }
        match i64::try_from(self.int) {
            Ok(total) => Value::Int(total),
            Err(_) => Value::Float(self.int as f64),
        }
    }
}

impl Accumulator {
    fn new(function: AggregateFunction) -> Self {
        match function {
            AggregateFunction::Sum => Accumulator::Sum(SumState::default()),
            AggregateFunction::Count => Accumulator::Count(0),
            AggregateFunction::Avg => Accumulator::Avg { sum: 0.0, count: 0 },
            AggregateFunction::Min => Accumulator::Min(Value::Null),
            AggregateFunction::Max => Accumulator::Max(Value::Null),
        }
    }

    fn update(&mut self, input: Option<&Value>) {
        match self {
            Accumulator::Count(n) => {
                if input.map_or(true, |v| !v.is_null()) {
                    *n += 1;
                }
            }
            Accumulator::Sum(state) => {
                if let Some(value) = input {
                    state.add(value);
                }
            }
            Accumulator::Avg { sum, count } => {
                if let Some(x) = input.and_then(Value::as_f64) {
                    *sum += x;
                    *count += 1;
                }
            }
            Accumulator::Min(current) => {
                if let Some(value) = input {
                    replace_if(current, value, Ordering::Less);
                }
            }
            Accumulator::Max(current) => {
                if let Some(value) = input {
                    replace_if(current, value, Ordering::Greater);
                }
            }
        }
    }

    fn finish(&self) -> Value {
        match self {
            Accumulator::Sum(state) => state.finish(),
            Accumulator::Count(n) => Value::Int(*n),
            Accumulator::Avg { count: 0, .. } => Value::Null,
            Accumulator::Avg { sum, count } => Value::Float(sum / *count as f64),
            Accumulator::Min(v) | Accumulator::Max(v) => v.clone(),
        }
    }
}

fn replace_if(current: &mut Value, candidate: &Value, wanted: Ordering) {
    if candidate.is_null() {
        return;
    }
    if current.is_null() || candidate.partial_cmp_value(current) == Some(wanted) {
        *current = candidate.clone();
    }
}

/// Hash aggregation keyed by the group tuple.
///
/// Groups are emitted in first-encounter order. Results do not depend on the
/// arrival order of rows within a group except for float rounding.
#[derive(Debug)]
pub struct GroupAggregator {
    group_columns: Vec<usize>,
    reducers: Vec<ReducerBinding>,
    max_groups: usize,
    index: HashMap<Vec<KeyValue>, usize>,
    groups: Vec<(Vec<Value>, Vec<Accumulator>)>,
}

impl GroupAggregator {
    pub fn new(group_columns: Vec<usize>, reducers: Vec<ReducerBinding>, max_groups: usize) -> Self {
        Self {
            group_columns,
            reducers,
            max_groups,
            index: HashMap::new(),
            groups: Vec::new(),
        }
    }

    /// Folds one row into its group.
    pub fn push(&mut self, row: &Row) -> Result<(), ExecutionError> {
        let key: Vec<KeyValue> = self
            .group_columns
            .iter()
            .map(|&idx| KeyValue::from(row.get(idx)))
            .collect();

        let slot = match self.index.get(&key) {
            Some(&slot) => slot,
            None => {
                if self.groups.len() >= self.max_groups {
                    return Err(ExecutionError::AggregationMemoryExceeded {
                        threshold: self.max_groups,
                    });
                }
                let values = self
                    .group_columns
                    .iter()
                    .map(|&idx| row.get(idx).clone())
                    .collect();
                let accumulators = self
                    .reducers
                    .iter()
                    .map(|r| Accumulator::new(r.function))
                    .collect();
                self.groups.push((values, accumulators));
                self.index.insert(key, self.groups.len() - 1);
                self.groups.len() - 1
            }
        };

        let (_, accumulators) = &mut self.groups[slot];
        for (acc, reducer) in accumulators.iter_mut().zip(&self.reducers) {
            acc.update(reducer.input.map(|idx| row.get(idx)));
        }
        Ok(())
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Emits `group values ++ reducer results` per group.
    ///
    /// A global aggregation (no group columns) over zero rows still yields one
    /// row, e.g. `count = 0`.
    pub fn finish(self) -> Vec<Row> {
        if self.groups.is_empty() && self.group_columns.is_empty() {
            let values = self
                .reducers
                .iter()
                .map(|r| Accumulator::new(r.function).finish())
                .collect();
            return vec![Row::new(values)];
        }

        self.groups
            .into_iter()
            .map(|(mut values, accumulators)| {
                values.extend(accumulators.iter().map(Accumulator::finish));
                Row::new(values)
            })
            .collect()
    }
}
