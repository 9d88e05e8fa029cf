// SPDX-License-Identifier: Apache-2.0

//! MongoDB Driver
//!
//! Exposes one collection through the Connector trait. Collections are
//! schemaless, so `describe_schema` infers field types from a sample of
//! documents. Every scan is executed as a single aggregation pipeline:
//! `$match` for filters, `$group` for pushed aggregates, then sort, limit and
//! projection.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::{Client, Collection};
use parking_lot::RwLock;
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
const SCHEMA_SAMPLE_DOCS: i64 = 100;
const TEXT_SAMPLES: usize = 20;

/// Server error code for a collection or database that does not exist.
const NAMESPACE_NOT_FOUND: i32 = 26;

/// A MongoDB collection
pub struct MongoConnector {
    collection: Collection<Document>,
    /// Field order of the last inferred schema.
    fields: RwLock<Option<Vec<String>>>,
}

impl MongoConnector {
    pub fn new(client: &Client, database: &str, collection: &str) -> Self {
        Self {
            collection: client.database(database).collection::<Document>(collection),
            fields: RwLock::new(None),
        }
    }

    /// Connects with `url` and pings the server.
    #[instrument(skip(url), fields(url = %url))]
    pub async fn connect(
        url: &Sensitive<String>,
        database: &str,
        collection: &str,
    ) -> SourceResult<Self> {
        let client = Client::with_uri_str(url.expose())
            .await
            .map_err(|e| SourceError::connect(e.to_string()))?;

        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| SourceError::connect(e.to_string()))?;

        Ok(Self::new(&client, database, collection))
    }

    /// Field names in schema order, inferring the schema on first use.
    async fn field_names(&self) -> SourceResult<Vec<String>> {
        if let Some(fields) = self.fields.read().clone() {
            return Ok(fields);
        }
        Ok(self.describe_schema().await?.column_names())
    }
}

/// Accumulates what a sample says about one field.
#[derive(Debug, Default)]
struct FieldStats {
    type_name: Option<&'static str>,
    seen: usize,
    has_null: bool,
    samples: Vec<Value>,
}

impl FieldStats {
    fn observe(&mut self, value: &Bson) {
        self.seen += 1;
        let Some(observed) = bson_type_name(value) else {
            self.has_null = true;
            return;
        };
        self.type_name = Some(match self.type_name {
            None => observed,
            Some(current) => widen(current, observed),
        });
        if let Bson::String(s) = value {
            if self.samples.len() < TEXT_SAMPLES {
                self.samples.push(Value::Text(s.clone()));
            }
        }
    }
}

fn bson_type_name(value: &Bson) -> Option<&'static str> {
    let name = match value {
        Bson::Null | Bson::Undefined => return None,
        Bson::Boolean(_) => "boolean",
        Bson::Int32(_) => "int32",
        Bson::Int64(_) => "int64",
        Bson::Double(_) => "double",
        Bson::Decimal128(_) => "decimal",
        Bson::String(_) => "string",
        Bson::ObjectId(_) => "objectId",
        Bson::DateTime(_) => "datetime",
        Bson::Array(_) => "array",
        Bson::Document(_) => "document",
        Bson::Binary(_) => "binData",
        _ => "mixed",
    };
    Some(name)
}

/// Joins two observed types into one that reads both losslessly.
fn widen(current: &'static str, observed: &'static str) -> &'static str {
    if current == observed {
        return current;
    }
    match (current, observed) {
        ("int32", "int64") | ("int64", "int32") => "int64",
        ("int32" | "int64" | "double", "int32" | "int64" | "double") => "double",
        _ => "mixed",
    }
}

/// Converts a LIKE pattern to an anchored regular expression.
pub(crate) fn like_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() * 2 + 2);
    regex.push('^');
    for c in pattern.chars() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            '.' | '^' | '$' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|'
            | '\\' => {
                regex.push('\\');
                regex.push(c);
            }
            other => regex.push(other),
        }
    }
    regex.push('$');
    regex
}

fn filter_clause(filter: &ColumnFilter) -> Document {
    let value = value_to_bson(&filter.value);
    let condition = match filter.operator {
        FilterOperator::Eq => doc! { "$eq": value },
        // $ne alone would also match null and missing fields
        FilterOperator::Neq => doc! { "$nin": [value, Bson::Null] },
        FilterOperator::Gt => doc! { "$gt": value },
        FilterOperator::Gte => doc! { "$gte": value },
        FilterOperator::Lt => doc! { "$lt": value },
        FilterOperator::Lte => doc! { "$lte": value },
        FilterOperator::Like => {
            let pattern = match &filter.value {
                Value::Text(s) => like_to_regex(s),
                other => like_to_regex(&other.to_string()),
            };
            doc! { "$regex": pattern, "$options": "s" }
        }
        FilterOperator::IsNull => doc! { "$eq": Bson::Null },
        FilterOperator::IsNotNull => doc! { "$ne": Bson::Null },
    };
    let mut clause = Document::new();
    clause.insert(filter.column.clone(), condition);
    clause
}

/// Builds the `$match` document for a conjunction of filters.
pub(crate) fn build_filter(filters: &[ColumnFilter]) -> Document {
    match filters {
        [] => Document::new(),
        [single] => filter_clause(single),
        many => {
            let clauses: Vec<Bson> = many
                .iter()
                .map(|f| Bson::Document(filter_clause(f)))
                .collect();
            doc! { "$and": clauses }
        }
    }
}

fn reducer_expr(function: AggregateFunction, column: Option<&str>) -> Document {
    let Some(column) = column else {
        return doc! { "$sum": 1 };
    };
    let field = format!("${column}");
    match function {
        AggregateFunction::Sum => doc! { "$sum": field },
        AggregateFunction::Avg => doc! { "$avg": field },
        AggregateFunction::Min => doc! { "$min": field },
        AggregateFunction::Max => doc! { "$max": field },
        // null and missing order below every other value
        AggregateFunction::Count => {
            doc! { "$sum": { "$cond": [{ "$gt": [field, Bson::Null] }, 1, 0] } }
        }
    }
}

/// An aggregation pipeline plus the document fields to read, in row order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Pipeline {
    pub stages: Vec<Document>,
    pub fields: Vec<String>,
}

/// Renders `request` as a pipeline. `schema_fields` is the row layout used
/// when the request has neither a projection nor an aggregate.
pub(crate) fn build_pipeline(request: &ScanRequest, schema_fields: &[String]) -> Pipeline {
    let mut stages = Vec::new();

    if !request.filters.is_empty() {
        stages.push(doc! { "$match": build_filter(&request.filters) });
    }

    // Output column name -> document field holding it
    let mut field_of: BTreeMap<String, String> = BTreeMap::new();
    let fields: Vec<String>;

    if let Some(agg) = &request.aggregate {
        let mut group_id = Document::new();
        let mut group = Document::new();
        let mut flatten = doc! { "_id": 0 };
        let mut names = Vec::new();

        for (i, column) in agg.group_by.iter().enumerate() {
            let key = format!("g{i}");
            group_id.insert(key.clone(), format!("${column}"));
            flatten.insert(key.clone(), format!("$_id.{key}"));
            field_of.insert(column.clone(), key.clone());
            names.push(key);
        }
        group.insert("_id", group_id);
        for (i, reducer) in agg.reducers.iter().enumerate() {
            let key = format!("r{i}");
            group.insert(key.clone(), reducer_expr(reducer.function, reducer.column.as_deref()));
            flatten.insert(key.clone(), 1);
            field_of.insert(reducer.alias.clone(), key.clone());
            names.push(key);
        }
        stages.push(doc! { "$group": group });
        stages.push(doc! { "$project": flatten });
        fields = names;
    } else {
        fields = request
            .projection
            .clone()
            .unwrap_or_else(|| schema_fields.to_vec());
    }

    if !request.order.is_empty() {
        // Sort NULLs last in both directions through a helper flag per key
        let mut flags = Document::new();
        let mut sort = Document::new();
        for (i, key) in request.order.iter().enumerate() {
            let field = field_of
                .get(&key.column)
                .cloned()
                .unwrap_or_else(|| key.column.clone());
            let flag = format!("__null{i}");
            let field_ref = format!("${field}");
            flags.insert(
                flag.clone(),
                doc! { "$cond": [{ "$eq": [{ "$ifNull": [field_ref, Bson::Null] }, Bson::Null] }, 1, 0] },
            );
            let direction = match key.direction {
                SortDirection::Asc => 1,
                SortDirection::Desc => -1,
            };
            sort.insert(flag, 1);
            sort.insert(field, direction);
        }
        stages.push(doc! { "$addFields": flags });
        stages.push(doc! { "$sort": sort });
    }

    if let Some(limit) = request.limit {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        stages.push(doc! { "$limit": limit });
    }

    if request.aggregate.is_none() {
        let mut projection = Document::new();
        if !fields.iter().any(|f| f == "_id") {
            projection.insert("_id", 0);
        }
        for field in &fields {
            projection.insert(field.clone(), 1);
        }
        stages.push(doc! { "$project": projection });
    }

    Pipeline { stages, fields }
}

/// Converts BSON to the universal value.
pub(crate) fn bson_to_value(value: &Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(i) => Value::Int(*i as i64),
        Bson::Int64(i) => Value::Int(*i),
        Bson::Double(f) => Value::Float(*f),
        Bson::String(s) => Value::Text(s.clone()),
        Bson::ObjectId(oid) => Value::Text(oid.to_hex()),
        Bson::DateTime(dt) => chrono::DateTime::from_timestamp_millis(dt.timestamp_millis())
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
        Bson::Decimal128(d) => {
            let text = d.to_string();
            text.parse::<f64>()
                .map(Value::Float)
                .unwrap_or(Value::Text(text))
        }
        Bson::Binary(bin) => Value::Bytes(bin.bytes.clone()),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_value).collect()),
        Bson::Document(_) => Value::Json(value.clone().into_relaxed_extjson()),
        other => Value::Text(other.to_string()),
    }
}

/// Converts a literal or lookup key to BSON.
pub(crate) fn value_to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Int(i) => Bson::Int64(*i),
        Value::Float(f) => Bson::Double(*f),
        Value::Text(s) => Bson::String(s.clone()),
        Value::Timestamp(ts) => {
            Bson::DateTime(mongodb::bson::DateTime::from_millis(ts.timestamp_millis()))
        }
        Value::Bytes(b) => Bson::Binary(mongodb::bson::Binary {
            subtype: mongodb::bson::spec::BinarySubtype::Generic,
            bytes: b.clone(),
        }),
        Value::Json(j) => mongodb::bson::to_bson(j).unwrap_or(Bson::Null),
        Value::Array(items) => Bson::Array(items.iter().map(value_to_bson).collect()),
    }
}

fn document_to_row(doc: &Document, fields: &[String]) -> Row {
    Row::new(
        fields
            .iter()
            .map(|f| doc.get(f).map(bson_to_value).unwrap_or(Value::Null))
            .collect(),
    )
}

fn map_mongo_error(error: mongodb::error::Error) -> SourceError {
    match error.kind.as_ref() {
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::Authentication { .. }
        | ErrorKind::DnsResolve { .. } => SourceError::connect(error.to_string()),
        ErrorKind::Command(cmd) if cmd.code == NAMESPACE_NOT_FOUND => {
            SourceError::schema_drift("*", cmd.message.clone())
        }
        _ => SourceError::query(error.to_string()),
    }
}

#[async_trait]
impl Connector for MongoConnector {
    fn kind(&self) -> StoreKind {
        StoreKind::Document
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        ConnectorCapabilities::full()
    }

    #[instrument(skip(self), fields(collection = %self.collection.name()))]
    async fn describe_schema(&self) -> SourceResult<TableSchema> {
        // Sample documents to infer schema (MongoDB is schemaless)
        let documents: Vec<Document> = self
            .collection
            .find(doc! {})
            .limit(SCHEMA_SAMPLE_DOCS)
            .await
            .map_err(map_mongo_error)?
            .try_collect()
            .await
            .map_err(map_mongo_error)?;

        let mut stats: BTreeMap<String, FieldStats> = BTreeMap::new();
        for document in &documents {
            for (key, value) in document.iter() {
                stats.entry(key.clone()).or_default().observe(value);
            }
        }

        // _id first, then by name
        let mut names: Vec<String> = stats.keys().cloned().collect();
        names.sort_by(|a, b| (a != "_id").cmp(&(b != "_id")).then_with(|| a.cmp(b)));

        let columns: Vec<TableColumn> = names
            .iter()
            .filter_map(|name| stats.remove_entry(name))
            .map(|(name, field)| TableColumn {
                nullable: field.has_null || field.seen < documents.len(),
                data_type: field.type_name.unwrap_or("null").to_string(),
                samples: field.samples,
                name,
            })
            .collect();

        let count = self.collection.estimated_document_count().await.ok();

        *self.fields.write() = Some(names);
        Ok(TableSchema {
            columns,
            row_count_estimate: count,
        })
    }

    async fn scan(&self, request: ScanRequest) -> SourceResult<RowStream> {
        let schema_fields = if request.projection.is_none() && request.aggregate.is_none() {
            self.field_names().await?
        } else {
            Vec::new()
        };
        let pipeline = build_pipeline(&request, &schema_fields);
        debug!(stages = pipeline.stages.len(), "MongoDB scan");

        let mut cursor = self
            .collection
            .aggregate(pipeline.stages)
            .await
            .map_err(map_mongo_error)?;

        let fields = pipeline.fields;
        let (tx, stream) = channel_stream(SCAN_BUFFER);
        tokio::spawn(async move {
            while let Some(item) = cursor.next().await {
                let item = item
                    .map(|d| document_to_row(&d, &fields))
                    .map_err(map_mongo_error);
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });
        Ok(stream)
    }

    async fn lookup(&self, key_column: &str, keys: &[Value]) -> SourceResult<Vec<Row>> {
        let keys: Vec<Bson> = keys
            .iter()
            .filter(|k| !k.is_null())
            .map(value_to_bson)
            .collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let fields = self.field_names().await?;

        let mut filter = Document::new();
        filter.insert(key_column, doc! { "$in": keys });
        let documents: Vec<Document> = self
            .collection
            .find(filter)
            .await
            .map_err(map_mongo_error)?
            .try_collect()
            .await
            .map_err(map_mongo_error)?;

        Ok(documents
            .iter()
            .map(|d| document_to_row(d, &fields))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::types::{OrderKey, PushedAggregate, PushedReducer};

    #[test]
    fn like_patterns_become_anchored_regexes() {
        assert_eq!(like_to_regex("ord_%"), "^ord..*$");
        assert_eq!(like_to_regex("a.b%"), "^a\\.b.*$");
    }

    #[test]
    fn not_equal_excludes_missing_fields() {
        let filter = build_filter(&[ColumnFilter::new("tier", FilterOperator::Neq, "gold".into())]);
        assert_eq!(filter, doc! { "tier": { "$nin": ["gold", Bson::Null] } });
    }

    #[test]
    fn several_filters_are_and_ed() {
        let filter = build_filter(&[
            ColumnFilter::new("amt", FilterOperator::Gte, Value::Int(10)),
            ColumnFilter::new("amt", FilterOperator::Lt, Value::Int(20)),
        ]);
        assert_eq!(
            filter,
            doc! { "$and": [
                { "amt": { "$gte": 10_i64 } },
                { "amt": { "$lt": 20_i64 } },
            ] }
        );
    }

    #[test]
    fn aggregate_pipeline_groups_then_flattens() {
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
            order: vec![OrderKey {
                column: "sum(o.amt)".into(),
                direction: SortDirection::Desc,
            }],
            ..Default::default()
        };
        let pipeline = build_pipeline(&request, &[]);

        assert_eq!(pipeline.fields, vec!["g0", "r0", "r1"]);
        assert_eq!(
            pipeline.stages[0],
            doc! { "$group": {
                "_id": { "g0": "$cat" },
                "r0": { "$sum": "$amt" },
                "r1": { "$sum": 1 },
            } }
        );
        assert_eq!(
            pipeline.stages[1],
            doc! { "$project": { "_id": 0, "g0": "$_id.g0", "r0": 1, "r1": 1 } }
        );
        assert_eq!(pipeline.stages[3], doc! { "$sort": { "__null0": 1, "r0": -1 } });
    }

    #[test]
    fn plain_scans_project_schema_fields() {
        let request = ScanRequest {
            limit: Some(3),
            ..Default::default()
        };
        let fields = vec!["_id".to_string(), "name".to_string()];
        let pipeline = build_pipeline(&request, &fields);

        assert_eq!(pipeline.fields, fields);
        assert_eq!(
            pipeline.stages,
            vec![
                doc! { "$limit": 3_i64 },
                doc! { "$project": { "_id": 1, "name": 1 } },
            ]
        );
    }

    #[test]
    fn bson_values_convert() {
        assert_eq!(bson_to_value(&Bson::Int32(7)), Value::Int(7));
        assert_eq!(bson_to_value(&Bson::Null), Value::Null);
        let oid = mongodb::bson::oid::ObjectId::new();
        assert_eq!(bson_to_value(&Bson::ObjectId(oid)), Value::Text(oid.to_hex()));
        assert_eq!(
            bson_to_value(&Bson::Document(doc! { "a": 1 })),
            Value::Json(serde_json::json!({ "a": 1 }))
        );
    }

    #[test]
    fn numeric_field_types_widen() {
        let mut stats = FieldStats::default();
        stats.observe(&Bson::Int32(1));
        stats.observe(&Bson::Int64(2));
        assert_eq!(stats.type_name, Some("int64"));
        stats.observe(&Bson::Double(2.5));
        assert_eq!(stats.type_name, Some("double"));
        stats.observe(&Bson::String("x".into()));
        assert_eq!(stats.type_name, Some("mixed"));
        stats.observe(&Bson::Null);
        assert!(stats.has_null);
    }
}
