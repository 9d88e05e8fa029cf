// SPDX-License-Identifier: Apache-2.0

//! Hash join.
//!
//! The build side is loaded into a bucket-chained table keyed by coerced
//! logical key values; probe rows are then matched one at a time. Keys with a
//! NULL component (including values the coercion rejects) never match.

use std::collections::HashMap;

use crate::connector::types::{KeyValue, Row, Value};
use crate::federation::reconcile::Coercion;

const END: usize = usize::MAX;

/// Column and coercion of one key component on one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyColumn {
    pub column: usize,
    pub coercion: Coercion,
}

/// Extracts the coerced key of `row`.
///
/// Returns `None` when a component is NULL. `rejected` counts non-null values
/// the coercion could not convert.
pub fn extract_key(row: &Row, columns: &[KeyColumn], rejected: &mut u64) -> Option<Vec<KeyValue>> {
    let mut key = Vec::with_capacity(columns.len());
    for kc in columns {
        let raw = row.get(kc.column);
        if raw.is_null() {
            return None;
        }
        let value = match kc.coercion {
            Coercion::Identity => raw.clone(),
            coercion => match coercion.apply(raw) {
                Some(v) => v,
                None => {
                    *rejected += 1;
                    Value::Null
                }
            },
        };
        if value.is_null() {
            return None;
        }
        key.push(KeyValue::from(&value));
    }
    Some(key)
}

/// Build-side hash table.
#[derive(Debug)]
pub struct JoinTable {
    key_columns: Vec<KeyColumn>,
    rows: Vec<Row>,
    heads: HashMap<Vec<KeyValue>, usize>,
    next: Vec<usize>,
    matched: Vec<bool>,
    rejected: u64,
}

impl JoinTable {
    pub fn new(key_columns: Vec<KeyColumn>) -> Self {
        Self {
            key_columns,
            rows: Vec::new(),
            heads: HashMap::new(),
            next: Vec::new(),
            matched: Vec::new(),
            rejected: 0,
        }
    }

    /// Adds a build row. Rows with NULL keys are kept (an outer join may still
    /// emit them) but are not reachable by probes.
    pub fn insert(&mut self, row: Row) {
        let idx = self.rows.len();
        let key = extract_key(&row, &self.key_columns, &mut self.rejected);
        self.rows.push(row);
        self.matched.push(false);
        self.next.push(END);

        if let Some(key) = key {
            // Chain in insertion order: new rows go to the tail of their bucket
            match self.heads.get(&key) {
                None => {
                    self.heads.insert(key, idx);
                }
                Some(&head) => {
                    let mut tail = head;
                    while self.next[tail] != END {
                        tail = self.next[tail];
                    }
                    self.next[tail] = idx;
                }
            }
        }
    }

    /// Indices of build rows matching `key`, in insertion order; marks them
    /// matched.
    pub fn probe(&mut self, key: &[KeyValue]) -> Vec<usize> {
        let mut hits = Vec::new();
        let mut cursor = self.heads.get(key).copied().unwrap_or(END);
        while cursor != END {
            hits.push(cursor);
            self.matched[cursor] = true;
            cursor = self.next[cursor];
        }
        hits
    }

    pub fn row(&self, idx: usize) -> &Row {
        &self.rows[idx]
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Forgets every probe match (the probe side restarted).
    pub fn clear_matches(&mut self) {
        self.matched.iter_mut().for_each(|m| *m = false);
    }

    /// Drops all rows (the build side restarted or failed).
    pub fn clear(&mut self) {
        self.rows.clear();
        self.heads.clear();
        self.next.clear();
        self.matched.clear();
        self.rejected = 0;
    }

    /// Build rows no probe matched, in insertion order.
    pub fn unmatched(&self) -> impl Iterator<Item = &Row> {
        self.rows
            .iter()
            .zip(&self.matched)
            .filter(|(_, matched)| !**matched)
            .map(|(row, _)| row)
    }

    /// Non-null build keys the coercion rejected.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(column: usize, coercion: Coercion) -> Vec<KeyColumn> {
        vec![KeyColumn { column, coercion }]
    }

    #[test]
    fn duplicate_keys_chain_in_insertion_order() {
        let mut table = JoinTable::new(key(0, Coercion::Identity));
        table.insert(Row::new(vec![Value::Int(1), "a".into()]));
        table.insert(Row::new(vec![Value::Int(2), "b".into()]));
        table.insert(Row::new(vec![Value::Int(1), "c".into()]));

        let hits = table.probe(&[KeyValue::Int(1)]);
        let tags: Vec<_> = hits.iter().map(|&i| table.row(i).get(1).to_string()).collect();
        assert_eq!(tags, vec!["a", "c"]);
        let unmatched: Vec<_> = table.unmatched().map(|r| r.get(1).to_string()).collect();
        assert_eq!(unmatched, vec!["b"]);
    }

    #[test]
    fn null_keys_are_stored_but_never_match() {
        let mut table = JoinTable::new(key(0, Coercion::Identity));
        table.insert(Row::new(vec![Value::Null]));
        assert_eq!(table.len(), 1);

        let mut rejected = 0;
        assert!(extract_key(&Row::new(vec![Value::Null]), &key(0, Coercion::Identity), &mut rejected).is_none());
        assert_eq!(table.unmatched().count(), 1);
    }

    #[test]
    fn coerced_keys_match_across_representations() {
        let mut table = JoinTable::new(key(0, Coercion::ParseNumber));
        table.insert(Row::new(vec!["42.0".into()]));
        table.insert(Row::new(vec!["forty-two".into()]));
        assert_eq!(table.rejected(), 1);

        let mut rejected = 0;
        let probe = extract_key(&Row::new(vec![Value::Int(42)]), &key(0, Coercion::Identity), &mut rejected).unwrap();
        assert_eq!(table.probe(&probe), vec![0]);
    }

    #[test]
    fn empty_key_is_a_cartesian_product() {
        let mut table = JoinTable::new(vec![]);
        table.insert(Row::new(vec![Value::Int(1)]));
        table.insert(Row::new(vec![Value::Int(2)]));
        assert_eq!(table.probe(&[]), vec![0, 1]);
    }

    #[test]
    fn clear_matches_resets_outer_bookkeeping() {
        let mut table = JoinTable::new(key(0, Coercion::Identity));
        table.insert(Row::new(vec![Value::Int(1)]));
        table.probe(&[KeyValue::Int(1)]);
        assert_eq!(table.unmatched().count(), 0);
        table.clear_matches();
        assert_eq!(table.unmatched().count(), 1);
    }
}
