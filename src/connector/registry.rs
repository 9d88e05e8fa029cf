// SPDX-License-Identifier: Apache-2.0

//! Source Registry
//!
//! Explicit, caller-owned set of connected sources for a query. There is no
//! process-wide registry: each call to the federation engine receives the
//! registry it should plan against, so concurrent queries can target
//! different source subsets.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crate::connector::error::SourceResult;
use crate::connector::traits::Connector;
use crate::connector::types::{ConnectorCapabilities, StoreKind, TableSchema};

/// Identity of one connected store.
///
/// Immutable once built; refreshing a source replaces the descriptor.
pub struct SourceDescriptor {
    name: String,
    kind: StoreKind,
    capabilities: ConnectorCapabilities,
    estimated_cardinality: Option<u64>,
    schema: TableSchema,
    described_at: DateTime<Utc>,
    connector: Arc<dyn Connector>,
}

impl SourceDescriptor {
    /// Builds a descriptor by asking the connector for its schema.
    #[instrument(skip(connector))]
    pub async fn describe(name: &str, connector: Arc<dyn Connector>) -> SourceResult<Self> {
        let schema = connector.describe_schema().await?;
        debug!(
            columns = schema.columns.len(),
            row_count_estimate = ?schema.row_count_estimate,
            "Described source"
        );
        Ok(Self::with_schema(name, connector, schema))
    }

    /// Builds a descriptor from an already known schema.
    pub fn with_schema(name: &str, connector: Arc<dyn Connector>, schema: TableSchema) -> Self {
        Self {
            name: name.to_string(),
            kind: connector.kind(),
            capabilities: connector.capabilities(),
            estimated_cardinality: None,
            schema,
            described_at: Utc::now(),
            connector,
        }
    }

    /// Attaches an explicit cardinality hint, overriding schema statistics.
    pub fn with_cardinality_hint(mut self, rows: u64) -> Self {
        self.estimated_cardinality = Some(rows);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn capabilities(&self) -> ConnectorCapabilities {
        self.capabilities
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn described_at(&self) -> DateTime<Utc> {
        self.described_at
    }

    /// Cardinality hint, falling back to the schema's row-count statistic.
    pub fn cardinality_estimate(&self) -> Option<u64> {
        self.estimated_cardinality.or(self.schema.row_count_estimate)
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.connector)
    }
}

impl fmt::Debug for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("capabilities", &self.capabilities)
            .field("estimated_cardinality", &self.estimated_cardinality)
            .field("columns", &self.schema.columns.len())
            .finish()
    }
}

/// Registry of sources available to one or more federated queries
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<SourceDescriptor>>,
}

impl SourceRegistry {
    /// Creates a new empty registry
    pub fn new() -> Self {
        Self {
            sources: BTreeMap::new(),
        }
    }

    /// Registers a descriptor under its own name, replacing any previous one.
    pub fn register(&mut self, descriptor: SourceDescriptor) -> Option<Arc<SourceDescriptor>> {
        let name = descriptor.name().to_string();
        self.sources.insert(name, Arc::new(descriptor))
    }

    /// Describes `connector` and registers it as `name`.
    pub async fn connect(&mut self, name: &str, connector: Arc<dyn Connector>) -> SourceResult<()> {
        let descriptor = SourceDescriptor::describe(name, connector).await?;
        self.register(descriptor);
        Ok(())
    }

    /// Re-describes a source, e.g. after schema drift or to refresh its
    /// cardinality statistic. An explicit hint survives the refresh.
    ///
    /// Returns `Ok(false)` when the source is unknown.
    #[instrument(skip(self))]
    pub async fn refresh(&mut self, name: &str) -> SourceResult<bool> {
        let Some(current) = self.sources.get(name).cloned() else {
            return Ok(false);
        };
        let mut refreshed = SourceDescriptor::describe(name, current.connector()).await?;
        refreshed.estimated_cardinality = current.estimated_cardinality;
        self.sources.insert(name.to_string(), Arc::new(refreshed));
        Ok(true)
    }

    /// Gets a source by name
    pub fn get(&self, name: &str) -> Option<Arc<SourceDescriptor>> {
        self.sources.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    /// Lists registered source names in sorted order
    pub fn names(&self) -> Vec<&str> {
        self.sources.keys().map(|s| s.as_str()).collect()
    }

    /// Returns the number of registered sources
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns true if no sources are registered
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.sources.values()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::drivers::memory::MemoryConnector;
    use crate::connector::types::{Row, TableColumn, Value};

    fn users() -> Arc<MemoryConnector> {
        Arc::new(
            MemoryConnector::new(StoreKind::Relational)
                .with_column(TableColumn::new("id", "INTEGER"))
                .with_rows(vec![Row::new(vec![Value::Int(1)]), Row::new(vec![Value::Int(2)])]),
        )
    }

    #[tokio::test]
    async fn test_registry_basics() {
        let mut registry = SourceRegistry::new();
        assert!(registry.is_empty());

        registry.connect("users", users()).await.unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("users"));
        assert!(registry.get("missing").is_none());

        let users = registry.get("users").unwrap();
        assert_eq!(users.kind(), StoreKind::Relational);
        assert_eq!(users.cardinality_estimate(), Some(2));
    }

    #[tokio::test]
    async fn hint_overrides_statistics_and_survives_refresh() {
        let mut registry = SourceRegistry::new();
        let connector = users();
        let descriptor = SourceDescriptor::describe("users", connector)
            .await
            .unwrap()
            .with_cardinality_hint(10);
        registry.register(descriptor);

        assert_eq!(registry.get("users").unwrap().cardinality_estimate(), Some(10));
        assert!(registry.refresh("users").await.unwrap());
        assert_eq!(registry.get("users").unwrap().cardinality_estimate(), Some(10));
        assert!(!registry.refresh("nope").await.unwrap());
    }

    #[test]
    fn test_list_names_sorted() {
        let mut registry = SourceRegistry::new();
        let schema = TableSchema::default();
        registry.register(SourceDescriptor::with_schema("b", users(), schema.clone()));
        registry.register(SourceDescriptor::with_schema("a", users(), schema));
        assert_eq!(registry.names(), vec!["a", "b"]);
    }
}
