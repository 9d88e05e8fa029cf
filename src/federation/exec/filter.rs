// SPDX-License-Identifier: Apache-2.0

//! Post-fetch predicate evaluation for sources without filter pushdown.

use crate::connector::types::{ColumnFilter, Row, Value};
use crate::federation::reconcile::Coercion;

/// A predicate bound to a column index.
///
/// The column value goes through `coercion` before comparison; values the
/// coercion rejects compare as NULL.
#[derive(Debug, Clone)]
pub struct BoundPredicate {
    pub column: usize,
    pub coercion: Coercion,
    pub filter: ColumnFilter,
}

impl BoundPredicate {
    fn matches(&self, row: &Row) -> bool {
        let raw = row.get(self.column);
        match self.coercion {
            Coercion::Identity => self.filter.matches(raw),
            coercion => self
                .filter
                .matches(&coercion.apply(raw).unwrap_or(Value::Null)),
        }
    }
}

/// Conjunction of predicates.
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    predicates: Vec<BoundPredicate>,
}

impl RowFilter {
    pub fn new(predicates: Vec<BoundPredicate>) -> Self {
        Self { predicates }
    }

    /// Binds filters to the positions of their columns in `columns`.
    ///
    /// Returns the name of the first column that is not present.
    pub fn bind(filters: &[ColumnFilter], columns: &[String]) -> Result<Self, String> {
        let predicates = filters
            .iter()
            .map(|filter| {
                columns
                    .iter()
                    .position(|c| *c == filter.column)
                    .map(|column| BoundPredicate {
                        column,
                        coercion: Coercion::Identity,
                        filter: filter.clone(),
                    })
                    .ok_or_else(|| filter.column.clone())
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { predicates })
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.predicates.iter().all(|p| p.matches(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::types::{FilterOperator, Value};

    #[test]
    fn all_predicates_must_hold() {
        let columns = vec!["id".to_string(), "status".to_string()];
        let filter = RowFilter::bind(
            &[
                ColumnFilter::new("status", FilterOperator::Eq, "paid".into()),
                ColumnFilter::new("id", FilterOperator::Gt, Value::Int(1)),
            ],
            &columns,
        )
        .unwrap();

        assert!(filter.matches(&Row::new(vec![Value::Int(2), "paid".into()])));
        assert!(!filter.matches(&Row::new(vec![Value::Int(1), "paid".into()])));
        assert!(!filter.matches(&Row::new(vec![Value::Int(2), "open".into()])));
    }

    #[test]
    fn coerced_predicates_compare_logical_values() {
        let filter = RowFilter::new(vec![BoundPredicate {
            column: 0,
            coercion: Coercion::ToString,
            filter: ColumnFilter::new("code", FilterOperator::Eq, "7".into()),
        }]);
        assert!(filter.matches(&Row::new(vec![Value::Int(7)])));
        assert!(!filter.matches(&Row::new(vec![Value::Null])));
    }

    #[test]
    fn unknown_column_is_reported() {
        let err = RowFilter::bind(
            &[ColumnFilter::new("nope", FilterOperator::IsNull, Value::Null)],
            &["id".to_string()],
        )
        .unwrap_err();
        assert_eq!(err, "nope");
    }
}
