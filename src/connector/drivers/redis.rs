// SPDX-License-Identifier: Apache-2.0

//! Redis Driver
//!
//! Treats every hash under a key prefix as one row. Redis stores bytes only,
//! so field types are declared up front and values are parsed on read; a value
//! that no longer parses as its declared type is reported as schema drift.
//! The store evaluates nothing: filters, aggregates and ordering all run in the
//! engine.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use tracing::{debug, instrument};

use crate::connector::error::{SourceError, SourceResult};
use crate::connector::stream::channel_stream;
use crate::connector::traits::{Connector, RowStream};
use crate::connector::types::{
    ConnectorCapabilities, Row, ScanRequest, StoreKind, TableColumn, TableSchema, Value,
};
use crate::observability::Sensitive;

const SCAN_BUFFER: usize = 256;
const SCAN_PAGE: usize = 100;
const SAMPLE_KEYS: usize = 20;

type Hash = HashMap<String, Vec<u8>>;

/// Hashes stored under `<prefix><key>`
pub struct RedisConnector {
    conn: MultiplexedConnection,
    key_prefix: String,
    key_column: String,
    fields: Vec<TableColumn>,
}

impl RedisConnector {
    pub fn new(
        conn: MultiplexedConnection,
        key_prefix: impl Into<String>,
        key_column: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
            key_column: key_column.into(),
            fields: Vec::new(),
        }
    }

    /// Declares a hash field and its type (`int64`, `float64`, `bool`,
    /// `timestamp`, `bytes` or `string`).
    pub fn with_field(mut self, name: impl Into<String>, data_type: impl Into<String>) -> Self {
        self.fields.push(TableColumn::new(name, data_type));
        self
    }

    /// Opens a multiplexed connection and pings it.
    #[instrument(skip(url), fields(url = %url))]
    pub async fn connect(
        url: &Sensitive<String>,
        key_prefix: &str,
        key_column: &str,
    ) -> SourceResult<Self> {
        let client = redis::Client::open(url.expose().as_str())
            .map_err(|e| SourceError::connect(e.to_string()))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| SourceError::connect(e.to_string()))?;

        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| SourceError::connect(format!("PING failed: {e}")))?;

        Ok(Self::new(conn, key_prefix, key_column))
    }

    fn columns(&self) -> Vec<TableColumn> {
        let mut columns = Vec::with_capacity(self.fields.len() + 1);
        columns.push(TableColumn::new(&self.key_column, "string").not_null());
        columns.extend(self.fields.iter().cloned());
        columns
    }

    fn layout(&self, projection: Option<&[String]>) -> SourceResult<RowLayout> {
        let names: Vec<String> = match projection {
            Some(cols) => cols.to_vec(),
            None => self.columns().iter().map(|c| c.name.clone()).collect(),
        };
        let mut slots = Vec::with_capacity(names.len());
        for name in names {
            if name == self.key_column {
                slots.push(Slot::Key);
                continue;
            }
            let field = self
                .fields
                .iter()
                .find(|f| f.name == name)
                .ok_or_else(|| SourceError::schema_drift(&name, "field is not declared"))?;
            slots.push(Slot::Field {
                name: field.name.clone(),
                data_type: field.data_type.clone(),
            });
        }
        Ok(RowLayout {
            prefix: self.key_prefix.clone(),
            slots,
        })
    }

    async fn scan_keys(&self, max: usize) -> SourceResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", self.key_prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, chunk): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_PAGE)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            keys.extend(chunk);
            cursor = next;
            if cursor == 0 || keys.len() >= max {
                break;
            }
        }
        keys.truncate(max);
        Ok(keys)
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Key,
    Field { name: String, data_type: String },
}

/// How a hash maps onto an output row.
#[derive(Debug, Clone)]
struct RowLayout {
    prefix: String,
    slots: Vec<Slot>,
}

impl RowLayout {
    fn row(&self, key: &str, hash: &Hash) -> SourceResult<Row> {
        let mut values = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let value = match slot {
                Slot::Key => Value::Text(key.strip_prefix(&self.prefix).unwrap_or(key).to_string()),
                Slot::Field { name, data_type } => match hash.get(name) {
                    None => Value::Null,
                    Some(raw) => parse_field(raw, data_type).map_err(|e| {
                        SourceError::schema_drift(name, format!("key {key}: {e}"))
                    })?,
                },
            };
            values.push(value);
        }
        Ok(Row::new(values))
    }
}

/// Parses a raw hash value as its declared type.
pub(crate) fn parse_field(raw: &[u8], data_type: &str) -> Result<Value, String> {
    if data_type.eq_ignore_ascii_case("bytes") {
        return Ok(Value::Bytes(raw.to_vec()));
    }
    let text = std::str::from_utf8(raw).map_err(|_| "value is not valid UTF-8".to_string())?;
    let invalid = || format!("'{text}' is not a valid {data_type}");

    match data_type.to_ascii_lowercase().as_str() {
        "int64" | "int" | "integer" => text.trim().parse().map(Value::Int).map_err(|_| invalid()),
        "float64" | "float" | "double" => {
            text.trim().parse().map(Value::Float).map_err(|_| invalid())
        }
        "bool" | "boolean" => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(invalid()),
        },
        "timestamp" => {
            let trimmed = text.trim();
            if let Ok(millis) = trimmed.parse::<i64>() {
                return DateTime::from_timestamp_millis(millis)
                    .map(Value::Timestamp)
                    .ok_or_else(invalid);
            }
            DateTime::parse_from_rfc3339(trimmed)
                .map(|ts| Value::Timestamp(ts.with_timezone(&Utc)))
                .map_err(|_| invalid())
        }
        _ => Ok(Value::Text(text.to_string())),
    }
}

fn map_redis_error(error: redis::RedisError) -> SourceError {
    if error.is_timeout() {
        return SourceError::timeout(0);
    }
    if error.is_io_error() || error.is_connection_refusal() || error.is_connection_dropped() {
        return SourceError::connect(error.to_string());
    }
    // A key under the prefix that is not a hash
    if error.code() == Some("WRONGTYPE") {
        return SourceError::schema_drift("*", error.to_string());
    }
    SourceError::query(error.to_string())
}

#[async_trait]
impl Connector for RedisConnector {
    fn kind(&self) -> StoreKind {
        StoreKind::KeyValue
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities {
            supports_lookup: true,
            ..ConnectorCapabilities::scan_only()
        }
    }

    #[instrument(skip(self), fields(prefix = %self.key_prefix))]
    async fn describe_schema(&self) -> SourceResult<TableSchema> {
        let mut columns = self.columns();

        // Sample string fields so the reconciler can spot encoded numbers
        let keys = self.scan_keys(SAMPLE_KEYS).await?;
        let mut conn = self.conn.clone();
        for key in &keys {
            let hash: Hash = redis::cmd("HGETALL")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            for column in columns.iter_mut().skip(1) {
                if !column.data_type.eq_ignore_ascii_case("string") {
                    continue;
                }
                if let Some(raw) = hash.get(&column.name) {
                    column
                        .samples
                        .push(Value::Text(String::from_utf8_lossy(raw).into_owned()));
                }
            }
        }

        Ok(TableSchema {
            columns,
            row_count_estimate: None,
        })
    }

    async fn scan(&self, request: ScanRequest) -> SourceResult<RowStream> {
        if !request.filters.is_empty() {
            return Err(SourceError::unsupported("filter pushdown"));
        }
        if request.aggregate.is_some() {
            return Err(SourceError::unsupported("aggregate pushdown"));
        }
        if !request.order.is_empty() {
            return Err(SourceError::unsupported("order pushdown"));
        }

        let layout = self.layout(request.projection.as_deref())?;
        let mut remaining = request.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        let pattern = format!("{}*", self.key_prefix);
        let mut conn = self.conn.clone();
        debug!(pattern = %pattern, "Redis scan");

        let (tx, stream) = channel_stream(SCAN_BUFFER);
        tokio::spawn(async move {
            let mut cursor: u64 = 0;
            loop {
                let page: redis::RedisResult<(u64, Vec<String>)> = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_PAGE)
                    .query_async(&mut conn)
                    .await;
                let (next, keys) = match page {
                    Ok(page) => page,
                    Err(e) => {
                        let _ = tx.send(Err(map_redis_error(e))).await;
                        return;
                    }
                };

                for key in keys {
                    if remaining == 0 {
                        return;
                    }
                    let hash: redis::RedisResult<Hash> =
                        redis::cmd("HGETALL").arg(&key).query_async(&mut conn).await;
                    let item = match hash {
                        // Expired between SCAN and HGETALL
                        Ok(hash) if hash.is_empty() => continue,
                        Ok(hash) => layout.row(&key, &hash),
                        Err(e) => Err(map_redis_error(e)),
                    };
                    let failed = item.is_err();
                    if tx.send(item).await.is_err() || failed {
                        return;
                    }
                    remaining -= 1;
                }

                cursor = next;
                if cursor == 0 {
                    return;
                }
            }
        });
        Ok(stream)
    }

    async fn lookup(&self, key_column: &str, keys: &[Value]) -> SourceResult<Vec<Row>> {
        if key_column != self.key_column {
            return Err(SourceError::unsupported(format!(
                "lookup on non-key field '{key_column}'"
            )));
        }
        let full_keys: Vec<String> = keys
            .iter()
            .filter(|k| !k.is_null())
            .map(|k| format!("{}{}", self.key_prefix, k))
            .collect();
        if full_keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in &full_keys {
            pipe.cmd("HGETALL").arg(key);
        }
        let mut conn = self.conn.clone();
        let hashes: Vec<Hash> = pipe
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let layout = self.layout(None)?;
        full_keys
            .iter()
            .zip(hashes.iter())
            .filter(|(_, hash)| !hash.is_empty())
            .map(|(key, hash)| layout.row(key, hash))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> RowLayout {
        RowLayout {
            prefix: "user:".into(),
            slots: vec![
                Slot::Key,
                Slot::Field {
                    name: "age".into(),
                    data_type: "int64".into(),
                },
                Slot::Field {
                    name: "tier".into(),
                    data_type: "string".into(),
                },
            ],
        }
    }

    #[test]
    fn declared_types_are_parsed() {
        assert_eq!(parse_field(b"42", "int64"), Ok(Value::Int(42)));
        assert_eq!(parse_field(b"2.5", "float64"), Ok(Value::Float(2.5)));
        assert_eq!(parse_field(b"TRUE", "bool"), Ok(Value::Bool(true)));
        assert_eq!(parse_field(b"42", "string"), Ok(Value::from("42")));
        assert_eq!(
            parse_field(b"0", "timestamp"),
            Ok(Value::Timestamp(DateTime::from_timestamp_millis(0).unwrap()))
        );
        assert!(parse_field(b"forty", "int64").is_err());
    }

    #[test]
    fn rows_strip_the_prefix_and_pad_missing_fields() {
        let mut hash = Hash::new();
        hash.insert("age".into(), b"31".to_vec());
        let row = layout().row("user:7", &hash).unwrap();
        assert_eq!(
            row.values,
            vec![Value::from("7"), Value::Int(31), Value::Null]
        );
    }

    #[test]
    fn unparsable_values_are_schema_drift() {
        let mut hash = Hash::new();
        hash.insert("age".into(), b"n/a".to_vec());
        let err = layout().row("user:7", &hash).unwrap_err();
        assert!(matches!(err, SourceError::SchemaDrift { ref field, .. } if field == "age"));
    }
}
