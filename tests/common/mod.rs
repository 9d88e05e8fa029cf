// SPDX-License-Identifier: Apache-2.0

// Shared fixtures for the federation integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use aishell_federation::connector::drivers::memory::MemoryConnector;
use aishell_federation::connector::{
    ConnectorCapabilities, Row, RowStream, ScanRequest, SourceResult, StoreKind, TableColumn,
    TableSchema, Value,
};
use aishell_federation::{Connector, SourceError};
use async_trait::async_trait;

/// Two-column `(id, tag)` table with full pushdown.
pub fn tagged(kind: StoreKind, rows: &[(i64, &str)]) -> MemoryConnector {
    MemoryConnector::new(kind)
        .with_columns([TableColumn::new("id", "bigint"), TableColumn::new("tag", "text")])
        .with_rows(
            rows.iter()
                .map(|(id, tag)| Row::new(vec![Value::Int(*id), Value::from(*tag)]))
                .collect(),
        )
}

/// `(cat, amt)` rows for aggregation tests.
pub fn sales(rows: &[(&str, i64)]) -> MemoryConnector {
    MemoryConnector::new(StoreKind::Relational)
        .with_columns([TableColumn::new("cat", "text"), TableColumn::new("amt", "bigint")])
        .with_rows(
            rows.iter()
                .map(|(cat, amt)| Row::new(vec![Value::from(*cat), Value::Int(*amt)]))
                .collect(),
        )
}

/// Rows sorted by every column, for order-insensitive comparisons.
pub fn sorted(rows: impl IntoIterator<Item = Row>) -> Vec<Row> {
    let mut rows: Vec<Row> = rows.into_iter().collect();
    rows.sort_by(|a, b| {
        a.values
            .iter()
            .zip(&b.values)
            .map(|(x, y)| x.total_cmp(y))
            .find(|o| o.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    rows
}

pub fn row(values: Vec<Value>) -> Row {
    Row::new(values)
}

/// Counts scans and lookups reaching the wrapped connector.
pub struct CountingConnector {
    inner: Arc<dyn Connector>,
    calls: AtomicUsize,
}

impl CountingConnector {
    pub fn new(inner: impl Connector + 'static) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(inner),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for CountingConnector {
    fn kind(&self) -> StoreKind {
        self.inner.kind()
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        self.inner.capabilities()
    }

    async fn describe_schema(&self) -> SourceResult<TableSchema> {
        self.inner.describe_schema().await
    }

    async fn scan(&self, request: ScanRequest) -> SourceResult<RowStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.scan(request).await
    }

    async fn lookup(&self, key_column: &str, keys: &[Value]) -> SourceResult<Vec<Row>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.lookup(key_column, keys).await
    }
}

/// Fails the first `failures` scans with `error`, then delegates.
pub struct FlakyConnector {
    inner: Arc<dyn Connector>,
    remaining_failures: AtomicU32,
    error: SourceError,
    scans: AtomicUsize,
}

impl FlakyConnector {
    pub fn new(inner: impl Connector + 'static, failures: u32, error: SourceError) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(inner),
            remaining_failures: AtomicU32::new(failures),
            error,
            scans: AtomicUsize::new(0),
        })
    }

    /// Never recovers.
    pub fn broken(inner: impl Connector + 'static, error: SourceError) -> Arc<Self> {
        Self::new(inner, u32::MAX, error)
    }

    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FlakyConnector {
    fn kind(&self) -> StoreKind {
        self.inner.kind()
    }

    fn capabilities(&self) -> ConnectorCapabilities {
        self.inner.capabilities()
    }

    async fn describe_schema(&self) -> SourceResult<TableSchema> {
        self.inner.describe_schema().await
    }

    async fn scan(&self, request: ScanRequest) -> SourceResult<RowStream> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(self.error.clone());
        }
        self.inner.scan(request).await
    }
}
