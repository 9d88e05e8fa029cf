// SPDX-License-Identifier: Apache-2.0

//! In-Memory Driver
//!
//! Implements the Connector trait over an in-process table. Kind and
//! capabilities are configurable, so the same driver can stand in for a
//! relational table with full pushdown or for a scan-only key-value cache.
//! Schema changes made through [`MemoryConnector::drop_column`] are visible to
//! running queries, which makes schema drift reproducible.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::connector::error::{SourceError, SourceResult};
use crate::connector::stream::batch_stream;
use crate::connector::traits::{Connector, RowStream};
use crate::connector::types::{
    ConnectorCapabilities, KeyValue, Row, ScanRequest, StoreKind, TableColumn, TableSchema, Value,
};
use crate::federation::exec::aggregate::{GroupAggregator, ReducerBinding};
use crate::federation::exec::filter::RowFilter;
use crate::federation::exec::sort::{sort_and_limit, SortKey};

/// Values sampled per column when none were declared.
const SAMPLE_SIZE: usize = 20;

#[derive(Debug, Default)]
struct Table {
    columns: Vec<TableColumn>,
    rows: Vec<Row>,
}

/// In-process table connector
pub struct MemoryConnector {
    kind: StoreKind,
    capabilities: ConnectorCapabilities,
    row_count_estimate: Option<Option<u64>>,
    latency: Option<Duration>,
    table: Arc<RwLock<Table>>,
}

impl MemoryConnector {
    /// Empty table with every capability enabled.
    pub fn new(kind: StoreKind) -> Self {
        Self {
            kind,
            capabilities: ConnectorCapabilities::full(),
            row_count_estimate: None,
            latency: None,
            table: Arc::new(RwLock::new(Table::default())),
        }
    }

    pub fn with_capabilities(mut self, capabilities: ConnectorCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_column(self, column: TableColumn) -> Self {
        self.table.write().columns.push(column);
        self
    }

    pub fn with_columns(self, columns: impl IntoIterator<Item = TableColumn>) -> Self {
        self.table.write().columns.extend(columns);
        self
    }

    pub fn with_rows(self, rows: Vec<Row>) -> Self {
        self.table.write().rows.extend(rows);
        self
    }

    /// Overrides the row-count statistic reported by `describe_schema`.
    /// `None` reports no statistic at all.
    pub fn with_row_count_estimate(mut self, estimate: Option<u64>) -> Self {
        self.row_count_estimate = Some(estimate);
        self
    }

    /// Delays every scan and lookup by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert(&self, row: Row) {
        self.table.write().rows.push(row);
    }

    pub fn replace_rows(&self, rows: Vec<Row>) {
        self.table.write().rows = rows;
    }

    /// Removes a column and its values from every row.
    pub fn drop_column(&self, name: &str) -> bool {
        let mut table = self.table.write();
        let Some(idx) = table.columns.iter().position(|c| c.name == name) else {
            return false;
        };
        table.columns.remove(idx);
        for row in table.rows.iter_mut() {
            if idx < row.values.len() {
                row.values.remove(idx);
            }
        }
        true
    }

    pub fn row_count(&self) -> usize {
        self.table.read().rows.len()
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_capabilities(&self, request: &ScanRequest) -> SourceResult<()> {
        let caps = self.capabilities;
        if !request.filters.is_empty() && !caps.supports_filter_pushdown {
            return Err(SourceError::unsupported("filter pushdown"));
        }
        if request.aggregate.is_some() && !caps.supports_agg_pushdown {
            return Err(SourceError::unsupported("aggregate pushdown"));
        }
        if !request.order.is_empty() && !caps.supports_order_pushdown {
            return Err(SourceError::unsupported("order pushdown"));
        }
        Ok(())
    }

    /// Evaluates a scan against the current table contents.
    fn evaluate(&self, request: &ScanRequest) -> SourceResult<Vec<Row>> {
        let table = self.table.read();
        let names: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
        let position = |name: &str| -> SourceResult<usize> {
            names
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| SourceError::schema_drift(name, "column no longer exists"))
        };

        let filter = RowFilter::bind(&request.filters, &names)
            .map_err(|missing| SourceError::schema_drift(missing, "column no longer exists"))?;
        let mut rows: Vec<Row> = table
            .rows
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();

        let output_names = match &request.aggregate {
            Some(aggregate) => {
                let group_columns = aggregate
                    .group_by
                    .iter()
                    .map(|c| position(c))
                    .collect::<SourceResult<Vec<_>>>()?;
                let reducers = aggregate
                    .reducers
                    .iter()
                    .map(|r| {
                        Ok(ReducerBinding {
                            function: r.function,
                            input: r.column.as_deref().map(position).transpose()?,
                        })
                    })
                    .collect::<SourceResult<Vec<_>>>()?;

                let mut aggregator = GroupAggregator::new(group_columns, reducers, usize::MAX);
                for row in &rows {
                    aggregator
                        .push(row)
                        .map_err(|e| SourceError::query(e.to_string()))?;
                }
                rows = aggregator.finish();
                request.output_columns(&TableSchema::default())
            }
            None => names.clone(),
        };

        let keys = request
            .order
            .iter()
            .map(|key| {
                output_names
                    .iter()
                    .position(|c| *c == key.column)
                    .map(|column| SortKey {
                        column,
                        direction: key.direction,
                    })
                    .ok_or_else(|| SourceError::schema_drift(&key.column, "column no longer exists"))
            })
            .collect::<SourceResult<Vec<_>>>()?;
        sort_and_limit(&mut rows, &keys, request.limit);

        if request.aggregate.is_none() {
            if let Some(projection) = &request.projection {
                let indices = projection
                    .iter()
                    .map(|c| position(c))
                    .collect::<SourceResult<Vec<_>>>()?;
                rows = rows
                    .into_iter()
                    .map(|row| Row::new(indices.iter().map(|&i| row.get(i).clone()).collect()))
                    .collect();
            }
        }

        Ok(rows)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn kind(&self) -> StoreKind {
        self.kind
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        self.capabilities
    }

    async fn describe_schema(&self) -> SourceResult<TableSchema> {
        let table = self.table.read();
        let columns = table
            .columns
            .iter()
            .enumerate()
            .map(|(idx, column)| {
                let mut column = column.clone();
                if column.samples.is_empty() {
                    column.samples = table
                        .rows
                        .iter()
                        .map(|row| row.get(idx).clone())
                        .filter(|v| !v.is_null())
                        .take(SAMPLE_SIZE)
                        .collect();
                }
                column
            })
            .collect();
        Ok(TableSchema {
            columns,
            row_count_estimate: self
                .row_count_estimate
                .unwrap_or(Some(table.rows.len() as u64)),
        })
    }

    async fn scan(&self, request: ScanRequest) -> SourceResult<RowStream> {
        self.check_capabilities(&request)?;
        self.simulate_latency().await;
        let rows = self.evaluate(&request)?;
        Ok(batch_stream(rows))
    }

    async fn lookup(&self, key_column: &str, keys: &[Value]) -> SourceResult<Vec<Row>> {
        if !self.capabilities.supports_lookup {
            return Err(SourceError::unsupported("lookup"));
        }
        self.simulate_latency().await;

        let table = self.table.read();
        let idx = table
            .columns
            .iter()
            .position(|c| c.name == key_column)
            .ok_or_else(|| SourceError::schema_drift(key_column, "column no longer exists"))?;
        let wanted: Vec<KeyValue> = keys
            .iter()
            .filter(|k| !k.is_null())
            .map(KeyValue::from)
            .collect();

        Ok(table
            .rows
            .iter()
            .filter(|row| wanted.contains(&KeyValue::from(row.get(idx))))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::types::{
        AggregateFunction, ColumnFilter, FilterOperator, OrderKey, PushedAggregate,
        PushedReducer, SortDirection,
    };
    use futures::TryStreamExt;

    fn orders() -> MemoryConnector {
        MemoryConnector::new(StoreKind::Relational)
            .with_columns([
                TableColumn::new("id", "bigint"),
                TableColumn::new("cat", "text"),
                TableColumn::new("amt", "bigint"),
            ])
            .with_rows(vec![
                Row::new(vec![Value::Int(1), "x".into(), Value::Int(10)]),
                Row::new(vec![Value::Int(2), "y".into(), Value::Int(7)]),
                Row::new(vec![Value::Int(3), "x".into(), Value::Int(5)]),
            ])
    }

    async fn collect(connector: &MemoryConnector, request: ScanRequest) -> SourceResult<Vec<Row>> {
        connector.scan(request).await?.try_collect().await
    }

    #[tokio::test]
    async fn describe_reports_row_count() {
        let schema = orders().describe_schema().await.unwrap();
        assert_eq!(schema.row_count_estimate, Some(3));
        assert_eq!(schema.column_names(), vec!["id", "cat", "amt"]);

        let unknown = orders().with_row_count_estimate(None);
        assert_eq!(unknown.describe_schema().await.unwrap().row_count_estimate, None);
    }

    #[tokio::test]
    async fn scan_applies_filter_order_limit_and_projection() {
        let rows = collect(
            &orders(),
            ScanRequest {
                filters: vec![ColumnFilter::new("cat", FilterOperator::Eq, "x".into())],
                projection: Some(vec!["amt".into(), "id".into()]),
                order: vec![OrderKey {
                    column: "amt".into(),
                    direction: SortDirection::Asc,
                }],
                limit: Some(1),
                aggregate: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(rows, vec![Row::new(vec![Value::Int(5), Value::Int(3)])]);
    }

    #[tokio::test]
    async fn scan_evaluates_pushed_aggregate() {
        let rows = collect(
            &orders(),
            ScanRequest {
                aggregate: Some(PushedAggregate {
                    group_by: vec!["cat".into()],
                    reducers: vec![PushedReducer {
                        function: AggregateFunction::Sum,
                        column: Some("amt".into()),
                        alias: "total".into(),
                    }],
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(
            rows,
            vec![
                Row::new(vec!["x".into(), Value::Int(15)]),
                Row::new(vec!["y".into(), Value::Int(7)]),
            ]
        );
    }

    #[tokio::test]
    async fn scan_only_connector_rejects_pushdown() {
        let connector = orders().with_capabilities(ConnectorCapabilities::scan_only());
        let err = collect(
            &connector,
            ScanRequest {
                filters: vec![ColumnFilter::new("id", FilterOperator::Eq, Value::Int(1))],
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err, SourceError::unsupported("filter pushdown"));
        assert!(connector.lookup("id", &[Value::Int(1)]).await.is_err());
    }

    #[tokio::test]
    async fn dropped_column_surfaces_as_schema_drift() {
        let connector = orders();
        assert!(connector.drop_column("cat"));
        let err = collect(
            &connector,
            ScanRequest {
                projection: Some(vec!["cat".into()]),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SourceError::SchemaDrift { ref field, .. } if field == "cat"));
    }

    #[tokio::test]
    async fn lookup_matches_keys_and_ignores_nulls() {
        let rows = orders()
            .lookup("id", &[Value::Int(3), Value::Null, Value::Int(9)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(0), &Value::Int(3));
    }
}
