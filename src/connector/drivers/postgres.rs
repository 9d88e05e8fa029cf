// SPDX-License-Identifier: Apache-2.0

//! PostgreSQL Driver
//!
//! Exposes one table through the Connector trait using SQLx. Filters,
//! aggregates, ordering and limits are rendered into a single parameterised
//! SELECT; rows are streamed from a background task so the executor's channel
//! back-pressure reaches the database cursor.

use async_trait::async_trait;
use futures::StreamExt;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::query::Query;
use sqlx::{Column, Row as SqlxRow};
use tracing::{debug, instrument};

use crate::connector::error::{SourceError, SourceResult};
use crate::connector::stream::channel_stream;
use crate::connector::traits::{Connector, RowStream};
use crate::connector::types::{
    AggregateFunction, ColumnFilter, ConnectorCapabilities, FilterOperator, Row, ScanRequest,
    SortDirection, StoreKind, TableColumn, TableSchema, Value,
};
use crate::observability::Sensitive;

const SCAN_BUFFER: usize = 256;
const SAMPLE_SIZE: i64 = 20;

/// SQLSTATE codes that mean the table no longer looks like its descriptor.
const UNDEFINED_COLUMN: &str = "42703";
const UNDEFINED_TABLE: &str = "42P01";

/// A PostgreSQL table
pub struct PostgresConnector {
    pool: PgPool,
    schema: String,
    table: String,
}

impl PostgresConnector {
    pub fn new(pool: PgPool, schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Opens a pool for `url` and checks it with a trivial query.
    #[instrument(skip(url), fields(url = %url))]
    pub async fn connect(
        url: &Sensitive<String>,
        schema: &str,
        table: &str,
        max_connections: u32,
    ) -> SourceResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url.expose())
            .await
            .map_err(|e| SourceError::connect(e.to_string()))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| SourceError::connect(e.to_string()))?;

        Ok(Self::new(pool, schema, table))
    }

    fn qualified_table(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    async fn sample_text_column(&self, column: &str) -> SourceResult<Vec<Value>> {
        let sql = format!(
            "SELECT {col}::text FROM {table} WHERE {col} IS NOT NULL LIMIT {SAMPLE_SIZE}",
            col = quote_ident(column),
            table = self.qualified_table(),
        );
        let samples: Vec<(String,)> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(samples.into_iter().map(|(s,)| Value::Text(s)).collect())
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_text_type(data_type: &str) -> bool {
    let t = data_type.to_ascii_lowercase();
    t == "text" || t.starts_with("character") || t.starts_with("varchar")
}

/// Renders `request` as one SELECT. Returns the SQL and its bind parameters.
pub(crate) fn build_select(table: &str, request: &ScanRequest) -> (String, Vec<Value>) {
    let mut params = Vec::new();

    let select_list = if let Some(agg) = &request.aggregate {
        let mut items: Vec<String> = agg.group_by.iter().map(|c| quote_ident(c)).collect();
        items.extend(agg.reducers.iter().map(|r| {
            let input = r
                .column
                .as_deref()
                .map(quote_ident)
                .unwrap_or_else(|| "*".to_string());
            let call = match r.function {
                AggregateFunction::Sum => format!("SUM({input})"),
                AggregateFunction::Avg => format!("AVG({input})"),
                AggregateFunction::Count => format!("COUNT({input})"),
                AggregateFunction::Min => format!("MIN({input})"),
                AggregateFunction::Max => format!("MAX({input})"),
            };
            format!("{call} AS {}", quote_ident(&r.alias))
        }));
        items.join(", ")
    } else {
        match &request.projection {
            Some(cols) => cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
            None => "*".to_string(),
        }
    };

    let mut sql = format!("SELECT {select_list} FROM {table}");

    if !request.filters.is_empty() {
        let predicates: Vec<String> = request
            .filters
            .iter()
            .map(|f| render_filter(f, &mut params))
            .collect();
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }

    if let Some(agg) = &request.aggregate {
        if !agg.group_by.is_empty() {
            let groups: Vec<String> = agg.group_by.iter().map(|c| quote_ident(c)).collect();
            sql.push_str(" GROUP BY ");
            sql.push_str(&groups.join(", "));
        }
    }

    if !request.order.is_empty() {
        // NULLs sort last in both directions, as the engine's own sort does
        let keys: Vec<String> = request
            .order
            .iter()
            .map(|k| {
                let dir = match k.direction {
                    SortDirection::Asc => "ASC",
                    SortDirection::Desc => "DESC",
                };
                format!("{} {dir} NULLS LAST", quote_ident(&k.column))
            })
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&keys.join(", "));
    }

    if let Some(limit) = request.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    (sql, params)
}

fn render_filter(filter: &ColumnFilter, params: &mut Vec<Value>) -> String {
    let col = quote_ident(&filter.column);
    match filter.operator {
        FilterOperator::IsNull => format!("{col} IS NULL"),
        FilterOperator::IsNotNull => format!("{col} IS NOT NULL"),
        op => {
            params.push(filter.value.clone());
            format!("{col} {} ${}", op.as_str(), params.len())
        }
    }
}

fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(b),
        Value::Int(i) => query.bind(i),
        Value::Float(f) => query.bind(f),
        Value::Text(s) => query.bind(s),
        Value::Timestamp(ts) => query.bind(ts),
        Value::Bytes(b) => query.bind(b),
        Value::Json(j) => query.bind(j),
        Value::Array(_) => query.bind(Option::<String>::None),
    }
}

fn map_sqlx_error(error: sqlx::Error) -> SourceError {
    match &error {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(UNDEFINED_COLUMN) | Some(UNDEFINED_TABLE) => {
                SourceError::schema_drift("*", db.message().to_string())
            }
            _ => SourceError::query(error.to_string()),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => SourceError::connect(error.to_string()),
        _ => SourceError::query(error.to_string()),
    }
}

fn convert_row(pg_row: &PgRow) -> Row {
    let values = pg_row
        .columns()
        .iter()
        .map(|col| extract_value(pg_row, col.ordinal()))
        .collect();
    Row::new(values)
}

fn decimal_value(d: Decimal) -> Value {
    if d.fract().is_zero() {
        if let Some(i) = d.to_i64() {
            return Value::Int(i);
        }
    }
    match d.to_f64() {
        Some(f) if f.is_finite() => Value::Float(f),
        _ => Value::Text(d.to_string()),
    }
}

/// Extracts a value, trying the common types from narrowest to widest.
fn extract_value(row: &PgRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::Int).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
        return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(Value::Float).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
        return v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Decimal>, _>(idx) {
        return v.map(decimal_value).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(idx) {
        return v.map(|u| Value::Text(u.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::Text).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map(Value::Bytes).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
        return v.map(Value::Json).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
        return v.map(Value::Timestamp).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return v
            .map(|dt| Value::Timestamp(dt.and_utc()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
        return v
            .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<i64>>, _>(idx) {
        return v
            .map(|vals| Value::Array(vals.into_iter().map(Value::Int).collect()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<String>>, _>(idx) {
        return v
            .map(|vals| Value::Array(vals.into_iter().map(Value::Text).collect()))
            .unwrap_or(Value::Null);
    }
    Value::Null
}

#[async_trait]
impl Connector for PostgresConnector {
    fn kind(&self) -> StoreKind {
        StoreKind::Relational
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities::full()
    }

    #[instrument(skip(self), fields(table = %self.table))]
    async fn describe_schema(&self) -> SourceResult<TableSchema> {
        let column_rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT
                column_name::text,
                data_type::text,
                is_nullable::text
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(&self.schema)
        .bind(&self.table)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if column_rows.is_empty() {
            return Err(SourceError::schema_drift(
                "*",
                format!("table {} not found", self.qualified_table()),
            ));
        }

        let mut columns = Vec::with_capacity(column_rows.len());
        for (name, data_type, is_nullable) in column_rows {
            let mut column = TableColumn::new(&name, &data_type);
            column.nullable = is_nullable == "YES";
            if is_text_type(&data_type) {
                column.samples = self.sample_text_column(&name).await?;
            }
            columns.push(column);
        }

        // reltuples is -1 for tables never analyzed
        let count_row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT reltuples::bigint
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relname = $2
            "#,
        )
        .bind(&self.schema)
        .bind(&self.table)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(TableSchema {
            columns,
            row_count_estimate: count_row.and_then(|(c,)| u64::try_from(c).ok()),
        })
    }

    async fn scan(&self, request: ScanRequest) -> SourceResult<RowStream> {
        let (sql, params) = build_select(&self.qualified_table(), &request);
        debug!(sql = %sql, params = params.len(), "Postgres scan");

        let pool = self.pool.clone();
        let (tx, stream) = channel_stream(SCAN_BUFFER);
        tokio::spawn(async move {
            let mut query = sqlx::query(&sql);
            for param in &params {
                query = bind_param(query, param);
            }
            let mut rows = query.fetch(&pool);
            while let Some(item) = rows.next().await {
                let item = item.map(|r| convert_row(&r)).map_err(map_sqlx_error);
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });
        Ok(stream)
    }

    async fn lookup(&self, key_column: &str, keys: &[Value]) -> SourceResult<Vec<Row>> {
        let keys: Vec<&Value> = keys.iter().filter(|k| !k.is_null()).collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = (1..=keys.len()).map(|i| format!("${i}")).collect();
        let sql = format!(
            "SELECT * FROM {} WHERE {} IN ({})",
            self.qualified_table(),
            quote_ident(key_column),
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql);
        for key in &keys {
            query = bind_param(query, key);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        Ok(rows.iter().map(convert_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::types::{OrderKey, PushedAggregate, PushedReducer};

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("user id"), "\"user id\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn select_with_filters_order_and_limit() {
        let request = ScanRequest {
            filters: vec![
                ColumnFilter::new("status", FilterOperator::Eq, "paid".into()),
                ColumnFilter::new("deleted_at", FilterOperator::IsNull, Value::Null),
                ColumnFilter::new("amount", FilterOperator::Gte, Value::Int(10)),
            ],
            projection: Some(vec!["id".into(), "amount".into()]),
            order: vec![OrderKey {
                column: "amount".into(),
                direction: SortDirection::Desc,
            }],
            limit: Some(5),
            aggregate: None,
        };
        let (sql, params) = build_select("\"public\".\"orders\"", &request);
        assert_eq!(
            sql,
            "SELECT \"id\", \"amount\" FROM \"public\".\"orders\" \
             WHERE \"status\" = $1 AND \"deleted_at\" IS NULL AND \"amount\" >= $2 \
             ORDER BY \"amount\" DESC NULLS LAST LIMIT 5"
        );
        assert_eq!(params, vec![Value::from("paid"), Value::Int(10)]);
    }

    #[test]
    fn aggregate_renders_group_by() {
        let request = ScanRequest {
            aggregate: Some(PushedAggregate {
                group_by: vec!["cat".into()],
                reducers: vec![
                    PushedReducer {
                        function: AggregateFunction::Sum,
                        column: Some("amt".into()),
                        alias: "sum(o.amt)".into(),
                    },
                    PushedReducer {
                        function: AggregateFunction::Count,
                        column: None,
                        alias: "count(*)".into(),
                    },
                ],
            }),
            ..Default::default()
        };
        let (sql, params) = build_select("t", &request);
        assert_eq!(
            sql,
            "SELECT \"cat\", SUM(\"amt\") AS \"sum(o.amt)\", COUNT(*) AS \"count(*)\" FROM t GROUP BY \"cat\""
        );
        assert!(params.is_empty());
    }

    #[test]
    fn integral_decimals_stay_integers() {
        assert_eq!(decimal_value(Decimal::new(4200, 2)), Value::Int(42));
        assert_eq!(decimal_value(Decimal::new(4250, 2)), Value::Float(42.5));
    }
}
