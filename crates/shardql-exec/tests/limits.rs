//! Memory, time and round-trip bounds, and request failures

mod common;

use common::*;
use shardql_exec::{
    BindVariables, ErrorCode, InMemoryExecutor, QueryError, QueryOptions, RequestError,
    RequestErrorKind,
};
use shardql_plan::{DistinctStrategy, Row, ShardId, SortSpec};
use std::sync::Arc;
use std::time::Duration;

/// Rows of roughly 300 bytes each once buffered
fn wide_rows(shard: ShardId, count: usize) -> Vec<Row> {
    let payload = "x".repeat(240);
    (0..count as i64)
        .map(|i| {
            Row::new()
                .with("k", i * 7 % 1000)
                .with("shard", i64::from(shard))
                .with("payload", payload.as_str())
        })
        .collect()
}

fn wide_executor() -> Arc<InMemoryExecutor> {
    Arc::new(InMemoryExecutor::new(500).with_table(
        "wide",
        (0..3).map(|s| (s, wide_rows(s, 2000))),
    ))
}

fn sort_everything() -> Arc<shardql_plan::QueryPlan> {
    plan(materialize_sort(
        receive("wide", &[0, 1, 2], false),
        vec![SortSpec::asc("k")],
    ))
}

#[tokio::test]
async fn test_sort_over_memory_budget_fails_and_releases() {
    let executor = wide_executor();
    let engine = engine(&executor);

    let mut execution = engine
        .start(
            sort_everything(),
            BindVariables::new(),
            &QueryOptions::new().with_max_memory_mb(1),
        )
        .unwrap();
    let err = engine.next_batch(&mut execution).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::MemoryLimitExceeded);
    assert!(matches!(err, QueryError::MemoryLimitExceeded { .. }));
    assert_eq!(execution.memory_used(), 0);
    assert!(execution.is_finished());
}

#[tokio::test]
async fn test_sort_within_memory_budget_succeeds() {
    let executor = wide_executor();
    let rows = engine(&executor)
        .collect_all(
            sort_everything(),
            BindVariables::new(),
            &QueryOptions::new().with_max_memory_mb(16).with_limit(1000),
        )
        .await
        .unwrap();

    assert_eq!(rows.len(), 6000);
    let keys = ints(&rows, "k");
    assert!(keys.windows(2).all(|w| w[0] <= w[1]));
}

/// Rows that are all distinct, each keyed by well over 400 bytes
fn unique_rows(shard: ShardId, count: usize) -> Vec<Row> {
    let payload = "y".repeat(400);
    (0..count as i64)
        .map(|i| {
            Row::new()
                .with("k", i)
                .with("shard", i64::from(shard))
                .with("payload", payload.as_str())
        })
        .collect()
}

fn dedup_everything() -> Arc<shardql_plan::QueryPlan> {
    plan(distinct(receive("unique", &[0, 1, 2], false), &[], DistinctStrategy::Hashed))
}

#[tokio::test]
async fn test_hashed_distinct_over_memory_budget_fails_and_releases() {
    let executor = Arc::new(InMemoryExecutor::new(100).with_table(
        "unique",
        (0..3).map(|s| (s, unique_rows(s, 1000))),
    ));
    let engine = engine(&executor);

    let mut execution = engine
        .start(
            dedup_everything(),
            BindVariables::new(),
            &QueryOptions::new().with_max_memory_mb(1),
        )
        .unwrap();
    let err = engine.next_batch(&mut execution).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::MemoryLimitExceeded);
    assert_eq!(execution.memory_used(), 0);
    assert!(execution.is_finished());

    let rows = engine
        .collect_all(
            dedup_everything(),
            BindVariables::new(),
            &QueryOptions::new().with_max_memory_mb(16),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 3000);
}

#[tokio::test]
async fn test_timeout_releases_memory() {
    let executor = Arc::new(
        InMemoryExecutor::new(2)
            .with_table("t", [(0, shard_rows(0, 0, 1, 10))])
            .with_latency(Duration::from_millis(200)),
    );
    let engine = engine(&executor);

    let mut execution = engine
        .start(
            plan(materialize_sort(receive("t", &[0], false), vec![SortSpec::asc("k")])),
            BindVariables::new(),
            &QueryOptions::new().with_timeout(Duration::from_millis(50)),
        )
        .unwrap();
    let err = engine.next_batch(&mut execution).await.unwrap_err();

    assert!(matches!(err, QueryError::Timeout(_)));
    assert_eq!(err.code(), ErrorCode::RequestTimeout);
    assert_eq!(execution.memory_used(), 0);
}

#[tokio::test]
async fn test_request_error_passes_through_unchanged() {
    let executor = Arc::new(
        InMemoryExecutor::new(2)
            .with_table("t", [(0, shard_rows(0, 0, 1, 6)), (1, shard_rows(1, 10, 1, 6))])
            .with_failure(
                1,
                1,
                RequestError::new(RequestErrorKind::Throttled, "slow down", true),
            ),
    );

    let err = engine(&executor)
        .collect_all(
            plan(receive("t", &[0, 1], false)),
            BindVariables::new(),
            &QueryOptions::new(),
        )
        .await
        .unwrap_err();

    match &err {
        QueryError::Request(request) => {
            assert_eq!(request.kind, RequestErrorKind::Throttled);
            assert_eq!(request.message, "slow down");
        }
        other => panic!("expected a request error, got {other:?}"),
    }
    assert_eq!(err.code(), ErrorCode::RequestFailed);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_round_trip_cap_can_return_an_empty_batch() {
    let executor = Arc::new(InMemoryExecutor::new(2).with_table(
        "t",
        [(0, shard_rows(0, 0, 2, 5)), (1, shard_rows(1, 1, 2, 5))],
    ));
    let engine = engine(&executor);
    let plan = plan(materialize_sort(receive("t", &[0, 1], false), vec![SortSpec::asc("k")]));
    let options = QueryOptions::new().with_max_round_trips(1);

    let first = engine
        .execute_batch(plan.clone(), BindVariables::new(), &options)
        .await
        .unwrap();
    assert!(first.rows.is_empty());
    let token = first.continuation_token.expect("sort has not seen all input");

    let rows = engine
        .collect_all(plan, BindVariables::new(), &options.with_continuation_token(token))
        .await
        .unwrap();
    assert_eq!(ints(&rows, "k"), (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_batch_byte_threshold() {
    let executor =
        Arc::new(InMemoryExecutor::new(10).with_table("t", [(0, shard_rows(0, 0, 1, 10))]));
    let row_bytes = shard_rows(0, 0, 1, 1)[0].size_estimate();
    let options = QueryOptions {
        max_batch_bytes: Some(row_bytes * 3),
        ..QueryOptions::new()
    };

    let batch = engine(&executor)
        .execute_batch(plan(receive("t", &[0], true)), BindVariables::new(), &options)
        .await
        .unwrap();
    assert_eq!(batch.rows.len(), 3);
    assert!(batch.continuation_token.is_some());
}

#[tokio::test]
async fn test_zero_limit_is_illegal() {
    let executor = Arc::new(InMemoryExecutor::new(10));
    let err = engine(&executor)
        .start(
            plan(receive("t", &[0], false)),
            BindVariables::new(),
            &QueryOptions::new().with_limit(0),
        )
        .err()
        .unwrap();
    assert_eq!(err.code(), ErrorCode::IllegalArgument);
}
