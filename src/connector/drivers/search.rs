// SPDX-License-Identifier: Apache-2.0

//! Search index driver
//!
//! Talks to an Elasticsearch-compatible REST API. Filters become a
//! `bool.filter` clause and ordering a `sort` list; aggregates are evaluated
//! by the engine. Hits are paged with `from`/`size` up to the index's result
//! window, and a scan that would need more is failed rather than truncated.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value as Json};
use tracing::{debug, instrument};

use crate::connector::error::{SourceError, SourceResult};
use crate::connector::stream::channel_stream;
use crate::connector::traits::{Connector, RowStream};
use crate::connector::types::{
    ColumnFilter, ConnectorCapabilities, FilterOperator, Row, ScanRequest, SortDirection,
    StoreKind, TableColumn, TableSchema, Value,
};
use crate::observability::Sensitive;

const SCAN_BUFFER: usize = 256;
const PAGE_SIZE: u64 = 500;
/// Elasticsearch's default `index.max_result_window`.
pub const DEFAULT_RESULT_WINDOW: u64 = 10_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One index of a search cluster
pub struct SearchConnector {
    client: Client,
    base_url: String,
    index: String,
    result_window: u64,
    /// Field name -> mapping type, from the last `_mapping` call.
    mapping: RwLock<Option<Vec<(String, String)>>>,
}

impl SearchConnector {
    /// Connector for `index` at `base_url`, optionally with basic auth.
    pub fn new(
        base_url: &str,
        index: &str,
        credentials: Option<(&str, &Sensitive<String>)>,
    ) -> SourceResult<Self> {
        let mut headers = HeaderMap::new();
        if let Some((username, password)) = credentials {
            let encoded = STANDARD.encode(format!("{}:{}", username, password.expose()));
            let mut value = HeaderValue::from_str(&format!("Basic {encoded}"))
                .map_err(|e| SourceError::connect(e.to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SourceError::connect(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            index: index.to_string(),
            result_window: DEFAULT_RESULT_WINDOW,
            mapping: RwLock::new(None),
        })
    }

    /// Overrides the result window when the index raised `max_result_window`.
    pub fn with_result_window(mut self, window: u64) -> Self {
        self.result_window = window.max(1);
        self
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.index, endpoint)
    }

    async fn mapping(&self) -> SourceResult<Vec<(String, String)>> {
        if let Some(mapping) = self.mapping.read().clone() {
            return Ok(mapping);
        }
        let schema = self.describe_schema().await?;
        Ok(schema
            .columns
            .into_iter()
            .map(|c| (c.name, c.data_type))
            .collect())
    }

    async fn get_json(&self, endpoint: &str) -> SourceResult<Json> {
        let response = self
            .client
            .get(self.url(endpoint))
            .send()
            .await
            .map_err(map_http_error)?;
        read_json(response).await
    }
}

async fn read_json(response: reqwest::Response) -> SourceResult<Json> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(SourceError::schema_drift("*", "index not found"));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(SourceError::query(format!("HTTP {status}: {body}")));
    }
    response.json().await.map_err(map_http_error)
}

fn map_http_error(error: reqwest::Error) -> SourceError {
    if error.is_timeout() {
        SourceError::timeout(REQUEST_TIMEOUT.as_millis() as u64)
    } else if error.is_connect() {
        SourceError::connect(error.to_string())
    } else {
        SourceError::query(error.to_string())
    }
}

/// Flattens a `properties` tree into dotted field names.
pub(crate) fn flatten_properties(
    properties: &Map<String, Json>,
    prefix: &str,
    out: &mut Vec<(String, String)>,
) {
    for (name, property) in properties {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        if let Some(Json::Object(nested)) = property.get("properties") {
            flatten_properties(nested, &path, out);
            continue;
        }
        let data_type = property
            .get("type")
            .and_then(Json::as_str)
            .unwrap_or("object");
        out.push((path, data_type.to_string()));
    }
}

fn literal(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::Text(s) => json!(s),
        Value::Timestamp(ts) => json!(ts.to_rfc3339()),
        Value::Bytes(b) => json!(STANDARD.encode(b)),
        Value::Json(j) => j.clone(),
        Value::Array(items) => Json::Array(items.iter().map(literal).collect()),
    }
}

/// Converts a LIKE pattern to a wildcard query pattern.
pub(crate) fn like_to_wildcard(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '%' => out.push('*'),
            '_' => out.push('?'),
            '*' | '?' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out
}

fn filter_clause(filter: &ColumnFilter) -> Json {
    let field = &filter.column;
    let value = literal(&filter.value);
    match filter.operator {
        FilterOperator::Eq => json!({ "term": { field: value } }),
        FilterOperator::Neq => json!({
            "bool": {
                "must": [{ "exists": { "field": field } }],
                "must_not": [{ "term": { field: value } }],
            }
        }),
        FilterOperator::Gt => json!({ "range": { field: { "gt": value } } }),
        FilterOperator::Gte => json!({ "range": { field: { "gte": value } } }),
        FilterOperator::Lt => json!({ "range": { field: { "lt": value } } }),
        FilterOperator::Lte => json!({ "range": { field: { "lte": value } } }),
        FilterOperator::Like => {
            let pattern = match &filter.value {
                Value::Text(s) => like_to_wildcard(s),
                other => like_to_wildcard(&other.to_string()),
            };
            json!({ "wildcard": { field: { "value": pattern } } })
        }
        FilterOperator::IsNull => {
            json!({ "bool": { "must_not": [{ "exists": { "field": field } }] } })
        }
        FilterOperator::IsNotNull => json!({ "exists": { "field": field } }),
    }
}

/// Builds one `_search` request body.
pub(crate) fn build_search_body(
    request: &ScanRequest,
    fields: &[String],
    from: u64,
    size: u64,
) -> Json {
    let mut body = Map::new();
    let query = if request.filters.is_empty() {
        json!({ "match_all": {} })
    } else {
        let clauses: Vec<Json> = request.filters.iter().map(filter_clause).collect();
        json!({ "bool": { "filter": clauses } })
    };
    body.insert("query".into(), query);

    if !request.order.is_empty() {
        let sort: Vec<Json> = request
            .order
            .iter()
            .map(|key| {
                let order = match key.direction {
                    SortDirection::Asc => "asc",
                    SortDirection::Desc => "desc",
                };
                json!({ key.column.clone(): { "order": order, "missing": "_last" } })
            })
            .collect();
        body.insert("sort".into(), Json::Array(sort));
    }

    body.insert("_source".into(), json!(fields));
    body.insert("from".into(), json!(from));
    body.insert("size".into(), json!(size));
    Json::Object(body)
}

fn source_field<'a>(source: &'a Json, path: &str) -> Option<&'a Json> {
    path.split('.').try_fold(source, |node, part| node.get(part))
}

fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Converts a `_source` value using the field's mapping type.
pub(crate) fn hit_value(value: &Json, data_type: &str) -> Value {
    match (value, data_type) {
        (Json::Null, _) => Value::Null,
        (Json::String(s), "date" | "date_nanos") => {
            parse_date(s).map(Value::Timestamp).unwrap_or_else(|| Value::Text(s.clone()))
        }
        (Json::Number(n), "date" | "date_nanos") => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
        (Json::Bool(b), _) => Value::Bool(*b),
        (Json::Number(n), _) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
        },
        (Json::String(s), _) => Value::Text(s.clone()),
        (Json::Array(items), _) => {
            Value::Array(items.iter().map(|item| hit_value(item, data_type)).collect())
        }
        (Json::Object(_), _) => Value::Json(value.clone()),
    }
}

fn hit_to_row(hit: &Json, columns: &[(String, String)]) -> Row {
    let source = hit.get("_source").unwrap_or(&Json::Null);
    Row::new(
        columns
            .iter()
            .map(|(name, data_type)| {
                source_field(source, name)
                    .map(|v| hit_value(v, data_type))
                    .unwrap_or(Value::Null)
            })
            .collect(),
    )
}

#[async_trait]
impl Connector for SearchConnector {
    fn kind(&self) -> StoreKind {
        StoreKind::Search
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities {
            supports_filter_pushdown: true,
            supports_order_pushdown: true,
            ..ConnectorCapabilities::scan_only()
        }
    }

    #[instrument(skip(self), fields(index = %self.index))]
    async fn describe_schema(&self) -> SourceResult<TableSchema> {
        let response = self.get_json("_mapping").await?;

        // The response is keyed by the concrete index name, which may differ
        // from an alias
        let properties = response
            .as_object()
            .and_then(|indices| indices.values().next())
            .and_then(|index| index.pointer("/mappings/properties"))
            .and_then(Json::as_object)
            .ok_or_else(|| SourceError::schema_drift("*", "index has no mapping"))?;

        let mut fields = Vec::new();
        flatten_properties(properties, "", &mut fields);

        let count = self
            .get_json("_count")
            .await
            .ok()
            .and_then(|body| body.get("count").and_then(Json::as_u64));

        *self.mapping.write() = Some(fields.clone());
        Ok(TableSchema {
            columns: fields
                .into_iter()
                .map(|(name, data_type)| TableColumn::new(name, data_type))
                .collect(),
            row_count_estimate: count,
        })
    }

    async fn scan(&self, request: ScanRequest) -> SourceResult<RowStream> {
        if request.aggregate.is_some() {
            return Err(SourceError::unsupported("aggregate pushdown"));
        }

        let mapping = self.mapping().await?;
        let types: HashMap<&str, &str> = mapping
            .iter()
            .map(|(n, t)| (n.as_str(), t.as_str()))
            .collect();
        let columns: Vec<(String, String)> = match &request.projection {
            Some(cols) => cols
                .iter()
                .map(|c| {
                    let data_type = types.get(c.as_str()).copied().unwrap_or("object");
                    (c.clone(), data_type.to_string())
                })
                .collect(),
            None => mapping.clone(),
        };
        let fields: Vec<String> = columns.iter().map(|(n, _)| n.clone()).collect();

        let client = self.client.clone();
        let url = self.url("_search");
        let window = self.result_window;
        let wanted = request.limit;
        debug!(index = %self.index, filters = request.filters.len(), "Search scan");

        let (tx, stream) = channel_stream(SCAN_BUFFER);
        tokio::spawn(async move {
            let mut from = 0u64;
            loop {
                let remaining = wanted.map(|l| l.saturating_sub(from)).unwrap_or(u64::MAX);
                if remaining == 0 {
                    return;
                }
                if from >= window {
                    let err = SourceError::query(format!(
                        "scan exceeds the result window of {window} hits"
                    ));
                    let _ = tx.send(Err(err)).await;
                    return;
                }
                let size = PAGE_SIZE.min(remaining).min(window - from);
                let body = build_search_body(&request, &fields, from, size);

                let page = match client.post(&url).json(&body).send().await {
                    Ok(response) => read_json(response).await,
                    Err(e) => Err(map_http_error(e)),
                };
                let hits = match page {
                    Ok(page) => page
                        .pointer("/hits/hits")
                        .and_then(Json::as_array)
                        .cloned()
                        .unwrap_or_default(),
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };

                let fetched = hits.len() as u64;
                for hit in &hits {
                    if tx.send(Ok(hit_to_row(hit, &columns))).await.is_err() {
                        return;
                    }
                }
                if fetched < size {
                    return;
                }
                from += fetched;
            }
        });
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::types::OrderKey;

    #[test]
    fn filters_become_a_bool_filter() {
        let request = ScanRequest {
            filters: vec![
                ColumnFilter::new("status", FilterOperator::Eq, "paid".into()),
                ColumnFilter::new("amount", FilterOperator::Gte, Value::Int(10)),
                ColumnFilter::new("email", FilterOperator::IsNull, Value::Null),
            ],
            order: vec![OrderKey {
                column: "amount".into(),
                direction: SortDirection::Desc,
            }],
            ..Default::default()
        };
        let body = build_search_body(&request, &["amount".to_string()], 0, 50);

        assert_eq!(
            body["query"],
            json!({ "bool": { "filter": [
                { "term": { "status": "paid" } },
                { "range": { "amount": { "gte": 10 } } },
                { "bool": { "must_not": [{ "exists": { "field": "email" } }] } },
            ] } })
        );
        assert_eq!(
            body["sort"],
            json!([{ "amount": { "order": "desc", "missing": "_last" } }])
        );
        assert_eq!(body["_source"], json!(["amount"]));
        assert_eq!(body["size"], json!(50));
    }

    #[test]
    fn unfiltered_scans_match_all() {
        let body = build_search_body(&ScanRequest::default(), &[], 500, 500);
        assert_eq!(body["query"], json!({ "match_all": {} }));
        assert_eq!(body["from"], json!(500));
        assert!(body.get("sort").is_none());
    }

    #[test]
    fn like_maps_to_wildcards() {
        assert_eq!(like_to_wildcard("ord_%"), "ord?*");
        assert_eq!(like_to_wildcard("50*%"), "50\\**");
    }

    #[test]
    fn nested_properties_flatten_to_dotted_names() {
        let properties = json!({
            "user": { "properties": { "id": { "type": "keyword" } } },
            "ts": { "type": "date" },
        });
        let mut fields = Vec::new();
        flatten_properties(properties.as_object().unwrap(), "", &mut fields);
        fields.sort();
        assert_eq!(
            fields,
            vec![
                ("ts".to_string(), "date".to_string()),
                ("user.id".to_string(), "keyword".to_string()),
            ]
        );
    }

    #[test]
    fn hits_follow_the_mapping() {
        let hit = json!({ "_source": { "user": { "id": "42" }, "ts": "2026-01-02", "n": 1.5 } });
        let columns = vec![
            ("user.id".to_string(), "keyword".to_string()),
            ("ts".to_string(), "date".to_string()),
            ("n".to_string(), "float".to_string()),
            ("gone".to_string(), "keyword".to_string()),
        ];
        let row = hit_to_row(&hit, &columns);
        assert_eq!(row.values[0], Value::from("42"));
        assert_eq!(
            row.values[1],
            Value::Timestamp(parse_date("2026-01-02T00:00:00Z").unwrap())
        );
        assert_eq!(row.values[2], Value::Float(1.5));
        assert_eq!(row.values[3], Value::Null);
    }
}
