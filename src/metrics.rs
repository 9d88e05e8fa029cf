// SPDX-License-Identifier: Apache-2.0

//! Process-wide federation counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

#[derive(Default)]
struct FederationMetrics {
    executions: AtomicU64,
    failed: AtomicU64,
    partial: AtomicU64,
    cancelled: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    source_timeouts: AtomicU64,
    retries: AtomicU64,
    duration_total_ms: AtomicU64,
    duration_max_ms: AtomicU64,
}

static FEDERATION_METRICS: OnceLock<FederationMetrics> = OnceLock::new();

fn metrics() -> &'static FederationMetrics {
    FEDERATION_METRICS.get_or_init(FederationMetrics::default)
}

/// Records a finished execution (cache hits excluded).
pub fn record_execution(duration_ms: u64, success: bool, partial: bool) {
    let metrics = metrics();
    metrics.executions.fetch_add(1, Ordering::Relaxed);
    if !success {
        metrics.failed.fetch_add(1, Ordering::Relaxed);
    }
    if partial {
        metrics.partial.fetch_add(1, Ordering::Relaxed);
    }
    metrics
        .duration_total_ms
        .fetch_add(duration_ms, Ordering::Relaxed);
    metrics
        .duration_max_ms
        .fetch_max(duration_ms, Ordering::Relaxed);
}

pub fn record_cancel() {
    metrics().cancelled.fetch_add(1, Ordering::Relaxed);
}

pub fn record_cache_lookup(hit: bool) {
    let counter = if hit {
        &metrics().cache_hits
    } else {
        &metrics().cache_misses
    };
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn record_source_timeout() {
    metrics().source_timeouts.fetch_add(1, Ordering::Relaxed);
}

pub fn record_retry() {
    metrics().retries.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Serialize)]
pub struct FederationMetricsSnapshot {
    pub executions: u64,
    pub failed: u64,
    pub partial: u64,
    pub cancelled: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub source_timeouts: u64,
    pub retries: u64,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<u64>,
}

pub fn snapshot() -> FederationMetricsSnapshot {
    let metrics = metrics();
    let executions = metrics.executions.load(Ordering::Relaxed);
    let duration_total = metrics.duration_total_ms.load(Ordering::Relaxed);
    let max_ms = metrics.duration_max_ms.load(Ordering::Relaxed);

    let avg_ms = if executions > 0 {
        Some(duration_total as f64 / executions as f64)
    } else {
        None
    };

    FederationMetricsSnapshot {
        executions,
        failed: metrics.failed.load(Ordering::Relaxed),
        partial: metrics.partial.load(Ordering::Relaxed),
        cancelled: metrics.cancelled.load(Ordering::Relaxed),
        cache_hits: metrics.cache_hits.load(Ordering::Relaxed),
        cache_misses: metrics.cache_misses.load(Ordering::Relaxed),
        source_timeouts: metrics.source_timeouts.load(Ordering::Relaxed),
        retries: metrics.retries.load(Ordering::Relaxed),
        avg_ms,
        max_ms: if max_ms > 0 { Some(max_ms) } else { None },
    }
}
