// SPDX-License-Identifier: Apache-2.0

//! Federation facade.
//!
//! Orchestrates the full pipeline:
//! plan → cache lookup → fan-out fetch, join and aggregate → fold source
//! outcomes → cache insert.

use std::time::{Duration, Instant};

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{FederationConfig, JOIN_OVERHEAD_BUDGET};
use crate::connector::registry::SourceRegistry;
use crate::error::{ExecutionError, FederationResult};
use crate::federation::cache::{CacheEntry, CacheStats, ResultCache};
use crate::federation::coordinator::summarize;
use crate::federation::envelope::{ResultEnvelope, SourceStatus};
use crate::federation::exec::{self, fetch::RetryPolicy};
use crate::federation::plan::Plan;
use crate::federation::planner::build_plan;
use crate::federation::types::QueryDescriptor;

/// Entry point of the engine. Holds the configuration and the result cache;
/// sources are passed per call.
#[derive(Debug, Default)]
pub struct Federation {
    config: FederationConfig,
    cache: ResultCache,
}

impl Federation {
    pub fn new(config: FederationConfig) -> Self {
        Self {
            config,
            cache: ResultCache::new(),
        }
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    /// Plans `descriptor` without contacting any source.
    pub fn plan(
        &self,
        descriptor: &QueryDescriptor,
        registry: &SourceRegistry,
    ) -> FederationResult<Plan> {
        Ok(build_plan(descriptor, registry, &self.config)?)
    }

    /// Human-readable plan, one step per line.
    pub fn explain(
        &self,
        descriptor: &QueryDescriptor,
        registry: &SourceRegistry,
    ) -> FederationResult<String> {
        Ok(self.plan(descriptor, registry)?.explain())
    }

    /// Plans and runs `descriptor`.
    #[instrument(skip_all, fields(sources = ?descriptor.sources))]
    pub async fn execute(
        &self,
        descriptor: &QueryDescriptor,
        registry: &SourceRegistry,
        cancel: CancellationToken,
    ) -> FederationResult<ResultEnvelope> {
        let plan = self.plan(descriptor, registry)?;
        self.execute_plan(&plan, registry, cancel).await
    }

    /// Runs an already built plan, answering from the cache when possible.
    pub async fn execute_plan(
        &self,
        plan: &Plan,
        registry: &SourceRegistry,
        cancel: CancellationToken,
    ) -> FederationResult<ResultEnvelope> {
        let started = Instant::now();
        let use_cache = self.config.cache_enabled && !plan.bypass_cache();

        if use_cache {
            if let Some(entry) = self.cache.get(plan.fingerprint()) {
                debug!(fingerprint = %plan.fingerprint(), "Serving federated result from cache");
                let mut envelope =
                    ResultEnvelope::new(entry.columns, entry.batch, plan.fingerprint().to_string());
                envelope.cached = true;
                envelope.status = plan
                    .sources()
                    .into_iter()
                    .map(|source| (source, SourceStatus::Skipped))
                    .collect();
                envelope.total_ms = started.elapsed().as_millis() as u64;
                return Ok(envelope);
            }
        }

        let deadline = self.deadline(plan);
        let result = timeout(
            deadline,
            exec::execute(plan, registry, &self.config, cancel),
        )
        .await;
        let elapsed_ms = || started.elapsed().as_millis() as u64;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                if e == ExecutionError::Cancelled {
                    crate::metrics::record_cancel();
                }
                crate::metrics::record_execution(elapsed_ms(), false, false);
                return Err(e.into());
            }
            Err(_) => {
                let timeout_ms = deadline.as_millis() as u64;
                warn!(timeout_ms, "Federated query exceeded its deadline");
                crate::metrics::record_execution(elapsed_ms(), false, false);
                return Err(ExecutionError::DeadlineExceeded { timeout_ms }.into());
            }
        };

        let mut summary = summarize(&plan.sources(), &output.reports);
        summary.mark_incomplete(&output.incomplete_sources);
        for source in &summary.stale_sources {
            warn!(source = %source, "Source schema drifted; its cached results are dropped");
            self.cache.invalidate_source(source);
        }
        if let Err(e) = summary.ensure_available() {
            crate::metrics::record_execution(elapsed_ms(), false, true);
            return Err(e.into());
        }

        let mut envelope = ResultEnvelope::new(
            output.columns,
            std::sync::Arc::new(output.rows),
            plan.fingerprint().to_string(),
        );
        envelope.warnings = output.warnings;
        summary.apply(&mut envelope);
        envelope.total_ms = elapsed_ms();

        // Partial results are never cached
        if self.config.cache_enabled && !envelope.partial {
            let ttl = plan.cache_ttl().unwrap_or_else(|| self.config.cache_ttl());
            self.cache.insert(
                plan.fingerprint(),
                CacheEntry::new(
                    envelope.columns.clone(),
                    envelope.batch(),
                    plan.source_set(),
                    ttl,
                ),
            );
        }

        crate::metrics::record_execution(envelope.total_ms, true, envelope.partial);
        debug!(
            rows = envelope.row_count(),
            partial = envelope.partial,
            total_ms = envelope.total_ms,
            "Federated query complete"
        );
        Ok(envelope)
    }

    /// Slowest possible fetch, retries included, plus the join budget.
    fn deadline(&self, plan: &Plan) -> Duration {
        let retry = RetryPolicy {
            max_retries: self.config.max_timeout_retries,
            base_delay: self.config.retry_base_delay(),
        };
        retry
            .worst_case(plan.max_fetch_timeout())
            .saturating_add(JOIN_OVERHEAD_BUDGET)
    }

    /// Drops every cached result that read `source`.
    pub fn invalidate_source(&self, source: &str) -> usize {
        self.cache.invalidate_source(source)
    }

    pub fn invalidate_all(&self) -> usize {
        self.cache.invalidate_all()
    }

    pub fn purge_expired(&self) -> usize {
        let purged = self.cache.purge_expired();
        if purged > 0 {
            info!(purged, "Purged expired federated results");
        }
        purged
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
