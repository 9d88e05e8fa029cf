// SPDX-License-Identifier: Apache-2.0

//! Connector trait definition
//!
//! This is the sole interface the federation engine requires from a store.
//! Every adapter (relational, document, search, key-value) implements it, and
//! the planner and executor only ever look at the capability flags it reports.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::connector::error::SourceResult;
use crate::connector::types::{ConnectorCapabilities, Row, ScanRequest, StoreKind, TableSchema, Value};

/// Lazy, finite stream of rows produced by a scan.
///
/// An `Err` item ends the scan; nothing is read after it.
pub type RowStream = BoxStream<'static, SourceResult<Row>>;

/// Core trait that all store adapters must implement
#[async_trait]
pub trait Connector: Send + Sync {
    /// Store kind, for diagnostics only.
    fn kind(&self) -> StoreKind;

    /// Pushdown and lookup support flags.
    fn capabilities(&self) -> ConnectorCapabilities;

    /// Introspects field names, physical types and (when cheap) a row count.
    async fn describe_schema(&self) -> SourceResult<TableSchema>;

    /// Starts a scan. Rows are produced lazily in the layout described by
    /// [`ScanRequest::output_columns`].
    async fn scan(&self, request: ScanRequest) -> SourceResult<RowStream>;

    /// Point lookup of every row whose `key_column` equals one of `keys`.
    ///
    /// Rows come back in schema column order.
    async fn lookup(&self, key_column: &str, keys: &[Value]) -> SourceResult<Vec<Row>> {
        let _ = (key_column, keys);
        Err(crate::connector::error::SourceError::unsupported("lookup"))
    }
}
