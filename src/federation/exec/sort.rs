// SPDX-License-Identifier: Apache-2.0

//! Stable multi-key sort with limit.

use std::cmp::Ordering;

use serde::Serialize;

use crate::connector::types::{Row, SortDirection};

/// Sort key resolved to a column index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SortKey {
    pub column: usize,
    pub direction: SortDirection,
}

/// Compares two rows key by key. NULLs sort last in both directions.
pub fn compare_rows(a: &Row, b: &Row, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let (left, right) = (a.get(key.column), b.get(key.column));
        let ord = match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let ord = left.total_cmp(right);
                match key.direction {
                    SortDirection::Asc => ord,
                    SortDirection::Desc => ord.reverse(),
                }
            }
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Sorts in place (ties keep arrival order) and truncates to `limit`.
pub fn sort_and_limit(rows: &mut Vec<Row>, keys: &[SortKey], limit: Option<u64>) {
    if !keys.is_empty() {
        rows.sort_by(|a, b| compare_rows(a, b, keys));
    }
    if let Some(limit) = limit {
        rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::types::Value;

    fn rows(values: &[(Value, &str)]) -> Vec<Row> {
        values
            .iter()
            .map(|(v, tag)| Row::new(vec![v.clone(), Value::Text(tag.to_string())]))
            .collect()
    }

    fn tags(rows: &[Row]) -> Vec<String> {
        rows.iter().map(|r| r.get(1).to_string()).collect()
    }

    #[test]
    fn ascending_is_stable_with_nulls_last() {
        let mut data = rows(&[
            (Value::Null, "n"),
            (Value::Int(2), "b1"),
            (Value::Int(1), "a"),
            (Value::Int(2), "b2"),
        ]);
        let keys = [SortKey {
            column: 0,
            direction: SortDirection::Asc,
        }];
        sort_and_limit(&mut data, &keys, None);
        assert_eq!(tags(&data), vec!["a", "b1", "b2", "n"]);
    }

    #[test]
    fn descending_keeps_nulls_last_and_applies_limit() {
        let mut data = rows(&[
            (Value::Null, "n"),
            (Value::Int(1), "a"),
            (Value::Int(3), "c"),
            (Value::Int(2), "b"),
        ]);
        let keys = [SortKey {
            column: 0,
            direction: SortDirection::Desc,
        }];
        sort_and_limit(&mut data, &keys, Some(3));
        assert_eq!(tags(&data), vec!["c", "b", "a"]);
    }

    #[test]
    fn limit_without_keys_keeps_arrival_order() {
        let mut data = rows(&[(Value::Int(3), "x"), (Value::Int(1), "y")]);
        sort_and_limit(&mut data, &[], Some(1));
        assert_eq!(tags(&data), vec!["x"]);
    }
}
