// SPDX-License-Identifier: Apache-2.0

//! Result cache keyed by plan fingerprint.
//!
//! Entries hold an immutable, shared row batch. The index is the only shared
//! mutable state of the engine and sits behind one mutex; batches are handed
//! out as `Arc`s so readers never copy rows under the lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::connector::types::Row;

/// One cached result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub columns: Vec<String>,
    pub batch: Arc<Vec<Row>>,
    pub captured_at: DateTime<Utc>,
    pub ttl: Duration,
    pub sources: BTreeSet<String>,
    expires_at: Instant,
}

impl CacheEntry {
    pub fn new(
        columns: Vec<String>,
        batch: Arc<Vec<Row>>,
        sources: BTreeSet<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            columns,
            batch,
            captured_at: Utc::now(),
            ttl,
            sources,
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Hit and miss counts of one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
pub struct ResultCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a live entry. Expired entries are dropped on the way.
    pub fn get(&self, fingerprint: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        let found = {
            let mut entries = self.entries.lock();
            match entries.get(fingerprint) {
                Some(entry) if entry.is_expired(now) => {
                    entries.remove(fingerprint);
                    debug!(fingerprint, "Cache entry expired");
                    None
                }
                Some(entry) => Some(entry.clone()),
                None => None,
            }
        };

        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_lookup(found.is_some());
        found
    }

    pub fn insert(&self, fingerprint: impl Into<String>, entry: CacheEntry) {
        let fingerprint = fingerprint.into();
        debug!(
            fingerprint = %fingerprint,
            rows = entry.batch.len(),
            ttl_ms = entry.ttl.as_millis() as u64,
            "Caching federated result"
        );
        self.entries.lock().insert(fingerprint, entry);
    }

    /// Removes every entry whose plan read `source`. Returns how many.
    pub fn invalidate_source(&self, source: &str) -> usize {
        let removed = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|_, entry| !entry.sources.contains(source));
            before - entries.len()
        };
        info!(source, removed, "Invalidated cached results");
        removed
    }

    pub fn invalidate_all(&self) -> usize {
        let removed = {
            let mut entries = self.entries.lock();
            let count = entries.len();
            entries.clear();
            count
        };
        info!(removed, "Cleared result cache");
        removed
    }

    /// Drops expired entries. Returns how many.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::types::Value;

    fn entry(sources: &[&str], ttl_ms: u64) -> CacheEntry {
        CacheEntry::new(
            vec!["A.id".into()],
            Arc::new(vec![Row::new(vec![Value::Int(1)])]),
            sources.iter().map(|s| s.to_string()).collect(),
            Duration::from_millis(ttl_ms),
        )
    }

    #[tokio::test]
    async fn hit_after_insert_and_miss_otherwise() {
        let cache = ResultCache::new();
        assert!(cache.get("f1").is_none());
        cache.insert("f1", entry(&["A"], 60_000));
        let hit = cache.get("f1").unwrap();
        assert_eq!(hit.batch.len(), 1);
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                entries: 1
            }
        );
    }

    #[tokio::test]
    async fn invalidation_is_scoped_to_touched_sources() {
        let cache = ResultCache::new();
        cache.insert("ab", entry(&["A", "B"], 60_000));
        cache.insert("a", entry(&["A"], 60_000));
        cache.insert("c", entry(&["C"], 60_000));

        assert_eq!(cache.invalidate_source("B"), 1);
        assert!(cache.get("ab").is_none());
        assert!(cache.get("a").is_some());
        assert_eq!(cache.invalidate_source("A"), 1);
        assert_eq!(cache.invalidate_all(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_their_ttl() {
        let cache = ResultCache::new();
        cache.insert("short", entry(&["A"], 1_000));
        cache.insert("long", entry(&["A"], 10_000));

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert!(cache.get("short").is_none());
        assert_eq!(cache.purge_expired(), 0);
        assert!(cache.get("long").is_some());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }
}
