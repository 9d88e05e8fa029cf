// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::Arc;
use std::time::Duration;

use aishell_federation::connector::StoreKind;
use aishell_federation::connector::Value;
use aishell_federation::federation::{JoinKind, SourceStatus};
use aishell_federation::{
    ExecutionError, Federation, FederationConfig, FederationError, QueryDescriptor, SourceError,
    SourceRegistry,
};
use tokio_util::sync::CancellationToken;

use common::{row, sorted, tagged, FlakyConnector};

fn join(kind: JoinKind) -> QueryDescriptor {
    QueryDescriptor::new(["A", "B"])
        .join("A.id", "B.id", kind)
        .timeout_ms(100)
}

async fn with_flaky_b(failures: u32, error: SourceError) -> (SourceRegistry, Arc<FlakyConnector>) {
    let b = FlakyConnector::new(tagged(StoreKind::Search, &[(1, "x"), (3, "y")]), failures, error);
    let mut registry = SourceRegistry::new();
    registry
        .connect("A", Arc::new(tagged(StoreKind::Relational, &[(1, "a"), (2, "b")])))
        .await
        .unwrap();
    registry.connect("B", b.clone()).await.unwrap();
    (registry, b)
}

#[tokio::test(start_paused = true)]
async fn timed_out_source_yields_a_flagged_partial_result() {
    let (registry, b) = with_flaky_b(u32::MAX, SourceError::timeout(100)).await;
    let federation = Federation::default();

    let envelope = federation
        .execute(&join(JoinKind::Inner), &registry, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(envelope.row_count(), 0);
    assert!(envelope.partial);
    assert_eq!(envelope.status["A"], "ok");
    assert_eq!(envelope.status["B"], "timeout");
    // First attempt plus two retries
    assert_eq!(envelope.fetches["B"].attempts, 3);
    assert_eq!(b.scans(), 3);
}

#[tokio::test(start_paused = true)]
async fn healthy_sources_give_a_complete_result() {
    let (registry, _) = with_flaky_b(0, SourceError::timeout(100)).await;

    let envelope = Federation::default()
        .execute(&join(JoinKind::Inner), &registry, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(envelope.row_count(), 1);
    assert!(!envelope.partial);
    assert!(envelope.status.values().all(SourceStatus::is_ok));
}

#[tokio::test(start_paused = true)]
async fn a_single_timeout_is_retried() {
    let (registry, b) = with_flaky_b(1, SourceError::timeout(100)).await;

    let envelope = Federation::default()
        .execute(&join(JoinKind::Inner), &registry, CancellationToken::new())
        .await
        .unwrap();

    assert!(!envelope.partial);
    assert_eq!(envelope.row_count(), 1);
    assert_eq!(envelope.fetches["B"].attempts, 2);
    assert_eq!(b.scans(), 2);
}

#[tokio::test]
async fn connection_errors_are_not_retried() {
    let (registry, b) = with_flaky_b(u32::MAX, SourceError::connect("refused")).await;

    let envelope = Federation::default()
        .execute(&join(JoinKind::Inner), &registry, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(b.scans(), 1);
    assert_eq!(envelope.status["B"], "error");
    assert!(envelope.partial);
}

#[tokio::test]
async fn left_join_keeps_the_preserved_side_when_the_other_fails() {
    let (registry, _) = with_flaky_b(u32::MAX, SourceError::connect("refused")).await;

    let envelope = Federation::default()
        .execute(&join(JoinKind::Left), &registry, CancellationToken::new())
        .await
        .unwrap();

    assert!(envelope.partial);
    assert_eq!(
        sorted(envelope.rows()),
        vec![
            row(vec![Value::Int(1), "a".into(), Value::Null, Value::Null]),
            row(vec![Value::Int(2), "b".into(), Value::Null, Value::Null]),
        ]
    );
}

#[tokio::test]
async fn no_surviving_source_fails_the_whole_query() {
    let broken = |rows: &[(i64, &str)]| {
        FlakyConnector::broken(
            tagged(StoreKind::Relational, rows),
            SourceError::connect("refused"),
        )
    };
    let mut registry = SourceRegistry::new();
    registry.connect("A", broken(&[(1, "a")])).await.unwrap();
    registry.connect("B", broken(&[(1, "x")])).await.unwrap();

    let err = Federation::default()
        .execute(&join(JoinKind::Inner), &registry, CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        FederationError::Execution(ExecutionError::FederationUnavailable { failures }) => {
            assert_eq!(failures.keys().collect::<Vec<_>>(), vec!["A", "B"]);
        }
        other => panic!("expected FederationUnavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn dropped_column_marks_the_source_stale_and_drops_its_cache() {
    let a = Arc::new(tagged(StoreKind::Relational, &[(1, "a"), (2, "b")]));
    let b = Arc::new(tagged(StoreKind::Document, &[(1, "x"), (3, "y")]));
    let mut registry = SourceRegistry::new();
    registry.connect("A", a.clone()).await.unwrap();
    registry.connect("B", b.clone()).await.unwrap();
    let federation = Federation::default();

    federation
        .execute(&QueryDescriptor::new(["B"]), &registry, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(federation.cache_stats().entries, 1);

    assert!(b.drop_column("tag"));
    let envelope = federation
        .execute(&join(JoinKind::Inner), &registry, CancellationToken::new())
        .await
        .unwrap();

    assert!(envelope.partial);
    assert_eq!(envelope.stale_sources, vec!["B"]);
    assert_eq!(envelope.status["B"], "error");
    assert_eq!(federation.cache_stats().entries, 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_a_running_query() {
    let slow = tagged(StoreKind::Relational, &[(1, "a")]).with_latency(Duration::from_secs(60));
    let mut registry = SourceRegistry::new();
    registry.connect("A", Arc::new(slow)).await.unwrap();
    registry
        .connect("B", Arc::new(tagged(StoreKind::Relational, &[(1, "x")])))
        .await
        .unwrap();

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let descriptor = QueryDescriptor::new(["A", "B"]).join("A.id", "B.id", JoinKind::Inner);
    let err = Federation::default()
        .execute(&descriptor, &registry, token)
        .await
        .unwrap_err();
    assert!(matches!(err, FederationError::Execution(ExecutionError::Cancelled)));
}
