// SPDX-License-Identifier: Apache-2.0

//! Fetch workers.
//!
//! One task per fetch step. A worker scans its source, forwards rows over a
//! bounded channel and retries timeouts with exponential backoff. A retry
//! restarts the scan from scratch, so the worker first sends
//! [`FetchEvent::Reset`] and the consumer discards what it received so far.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connector::error::SourceError;
use crate::connector::traits::Connector;
use crate::connector::types::{Row, ScanRequest};

/// Message from a fetch worker to its consumer.
#[derive(Debug)]
pub enum FetchEvent {
    Row(Row),
    /// The previous attempt was abandoned; drop its rows.
    Reset,
    Done(FetchReport),
}

/// Final outcome of one source fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchReport {
    pub source: String,
    pub outcome: Result<(), SourceError>,
    pub attempts: u32,
    /// Rows delivered by the last attempt.
    pub rows: u64,
    pub elapsed: Duration,
}

impl FetchReport {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Report for a worker that vanished without a final message.
    pub fn lost(source: &str, error: SourceError) -> Self {
        Self {
            source: source.to_string(),
            outcome: Err(error),
            attempts: 0,
            rows: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Exponential backoff for timed-out attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)` plus
    /// up to a quarter of that as jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let multiplier = 2_u64.saturating_pow(retry.saturating_sub(1));
        let delay = base_ms.saturating_mul(multiplier);
        let jitter_cap = delay / 4;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::random::<u64>() % (jitter_cap + 1)
        };
        Duration::from_millis(delay.saturating_add(jitter))
    }

    /// Longest a fetch can take when every attempt times out, backoff
    /// included.
    pub fn worst_case(&self, per_attempt: Duration) -> Duration {
        let attempts = per_attempt.saturating_mul(self.max_retries.saturating_add(1));
        let backoff = (1..=self.max_retries)
            .map(|retry| {
                let base = self
                    .base_delay
                    .saturating_mul(2_u32.saturating_pow(retry - 1));
                base.saturating_add(base / 4)
            })
            .fold(Duration::ZERO, Duration::saturating_add);
        attempts.saturating_add(backoff)
    }
}

enum AttemptError {
    Source(SourceError),
    /// The consumer dropped its receiver; nobody wants the rows any more.
    ConsumerGone,
}

/// Everything one worker needs; moved into its task.
pub struct FetchWorker {
    pub source: String,
    pub connector: Arc<dyn Connector>,
    pub request: ScanRequest,
    /// Number of columns every row must carry.
    pub width: usize,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
    pub tx: mpsc::Sender<FetchEvent>,
}

impl FetchWorker {
    /// Runs to completion and sends the final [`FetchEvent::Done`].
    ///
    /// `permit` is held for the worker's whole lifetime.
    pub async fn run(self, permit: Option<OwnedSemaphorePermit>) {
        let start = Instant::now();
        let mut attempts = 0u32;
        let mut rows = 0u64;

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AttemptError::Source(SourceError::Cancelled)),
            outcome = self.fetch_with_retries(&mut attempts, &mut rows) => outcome,
        };
        drop(permit);

        let outcome = match outcome {
            Ok(()) => Ok(()),
            Err(AttemptError::Source(e)) => Err(e),
            Err(AttemptError::ConsumerGone) => {
                debug!(source = %self.source, "Fetch consumer went away");
                return;
            }
        };

        let report = FetchReport {
            source: self.source.clone(),
            outcome,
            attempts,
            rows,
            elapsed: start.elapsed(),
        };
        let _ = self.tx.send(FetchEvent::Done(report)).await;
    }

    async fn fetch_with_retries(&self, attempts: &mut u32, rows: &mut u64) -> Result<(), AttemptError> {
        loop {
            *attempts += 1;
            *rows = 0;
            match self.attempt(rows).await {
                Ok(()) => return Ok(()),
                Err(AttemptError::Source(e))
                    if e.is_retryable() && *attempts <= self.retry.max_retries =>
                {
                    let delay = self.retry.delay(*attempts);
                    warn!(
                        source = %self.source,
                        attempt = *attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Source timed out, retrying"
                    );
                    crate::metrics::record_retry();
                    if *rows > 0 && self.tx.send(FetchEvent::Reset).await.is_err() {
                        return Err(AttemptError::ConsumerGone);
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One scan. The timeout budget is spent only while waiting on the
    /// connector, not while the consumer applies back-pressure.
    async fn attempt(&self, rows: &mut u64) -> Result<(), AttemptError> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let mut remaining = self.timeout;
        let timed_out = || AttemptError::Source(SourceError::timeout(timeout_ms));

        let started = Instant::now();
        let mut stream = timeout(remaining, self.connector.scan(self.request.clone()))
            .await
            .map_err(|_| timed_out())?
            .map_err(AttemptError::Source)?;
        remaining = remaining.saturating_sub(started.elapsed());

        loop {
            let started = Instant::now();
            let next = timeout(remaining, stream.next()).await.map_err(|_| timed_out())?;
            remaining = remaining.saturating_sub(started.elapsed());

            match next {
                None => return Ok(()),
                Some(Err(e)) => return Err(AttemptError::Source(e)),
                Some(Ok(row)) => {
                    if row.len() != self.width {
                        return Err(AttemptError::Source(SourceError::schema_drift(
                            "*",
                            format!("expected {} columns, got {}", self.width, row.len()),
                        )));
                    }
                    if self.tx.send(FetchEvent::Row(row)).await.is_err() {
                        return Err(AttemptError::ConsumerGone);
                    }
                    *rows += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::drivers::memory::MemoryConnector;
    use crate::connector::types::{StoreKind, TableColumn, Value};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(200),
        }
    }

    #[test]
    fn backoff_doubles_with_bounded_jitter() {
        let p = policy();
        for (retry, base) in [(1u32, 200u64), (2, 400), (3, 800)] {
            let d = p.delay(retry).as_millis() as u64;
            assert!(d >= base && d <= base + base / 4, "retry {retry}: {d}ms");
        }
    }

    #[test]
    fn worst_case_covers_every_attempt_and_backoff() {
        // 3 x 100ms attempts + (250ms + 500ms) of maximal backoff
        assert_eq!(
            policy().worst_case(Duration::from_millis(100)),
            Duration::from_millis(1_050)
        );
    }

    async fn run_worker(connector: MemoryConnector, timeout: Duration) -> (Vec<FetchEvent>, FetchReport) {
        let (tx, mut rx) = mpsc::channel(16);
        let worker = FetchWorker {
            source: "A".into(),
            connector: Arc::new(connector),
            request: ScanRequest::default(),
            width: 1,
            timeout,
            retry: policy(),
            cancel: CancellationToken::new(),
            tx,
        };
        tokio::spawn(worker.run(None));

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            if let FetchEvent::Done(report) = event {
                return (events, report);
            }
            events.push(event);
        }
        panic!("worker ended without a report");
    }

    #[tokio::test]
    async fn delivers_rows_then_reports() {
        let connector = MemoryConnector::new(StoreKind::Relational)
            .with_column(TableColumn::new("id", "int"))
            .with_rows(vec![Row::new(vec![Value::Int(1)]), Row::new(vec![Value::Int(2)])]);
        let (events, report) = run_worker(connector, Duration::from_secs(5)).await;
        assert_eq!(events.len(), 2);
        assert!(report.is_ok());
        assert_eq!(report.attempts, 1);
        assert_eq!(report.rows, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_exhausts_retries() {
        let connector = MemoryConnector::new(StoreKind::Relational)
            .with_column(TableColumn::new("id", "int"))
            .with_latency(Duration::from_secs(60));
        let (_, report) = run_worker(connector, Duration::from_millis(100)).await;
        assert_eq!(report.outcome, Err(SourceError::timeout(100)));
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test]
    async fn width_mismatch_is_schema_drift() {
        let connector = MemoryConnector::new(StoreKind::Relational)
            .with_column(TableColumn::new("id", "int"))
            .with_rows(vec![Row::new(vec![Value::Int(1), Value::Int(2)])]);
        let (_, report) = run_worker(connector, Duration::from_secs(5)).await;
        assert!(matches!(report.outcome, Err(SourceError::SchemaDrift { .. })));
        assert_eq!(report.attempts, 1);
    }
}
