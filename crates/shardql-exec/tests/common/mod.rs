#![allow(dead_code)]

use shardql_exec::{InMemoryExecutor, QueryEngine};
use shardql_plan::{
    AggCall, DistinctStrategy, Expr, GroupKey, PlanStep, QueryPlan, Row, ShardId, SortMode,
    SortSpec,
};
use std::sync::Arc;

pub fn receive(table: &str, shards: &[ShardId], ordered: bool) -> PlanStep {
    PlanStep::Receive {
        table: table.to_string(),
        shards: shards.to_vec(),
        ordered,
    }
}

pub fn merge_sort(input: PlanStep, keys: Vec<SortSpec>) -> PlanStep {
    PlanStep::Sort {
        input: Box::new(input),
        keys,
        mode: SortMode::Merge,
    }
}

pub fn materialize_sort(input: PlanStep, keys: Vec<SortSpec>) -> PlanStep {
    PlanStep::Sort {
        input: Box::new(input),
        keys,
        mode: SortMode::Materialize,
    }
}

pub fn group_by(input: PlanStep, keys: &[&str], aggregates: Vec<AggCall>) -> PlanStep {
    PlanStep::GroupBy {
        input: Box::new(input),
        keys: keys.iter().map(|k| GroupKey::asc(*k)).collect(),
        aggregates,
    }
}

pub fn agg(name: &str, func: &str, args: Vec<Expr>) -> AggCall {
    AggCall {
        name: name.to_string(),
        func: func.to_string(),
        args,
    }
}

pub fn distinct(input: PlanStep, keys: &[&str], strategy: DistinctStrategy) -> PlanStep {
    PlanStep::Distinct {
        input: Box::new(input),
        keys: keys.iter().map(|k| k.to_string()).collect(),
        strategy,
    }
}

pub fn plan(root: PlanStep) -> Arc<QueryPlan> {
    Arc::new(QueryPlan::new(root))
}

/// `count` rows `{k, shard}` with `k = start, start + step, ...`
pub fn shard_rows(shard: ShardId, start: i64, step: i64, count: usize) -> Vec<Row> {
    (0..count as i64)
        .map(|i| {
            Row::new()
                .with("k", start + i * step)
                .with("shard", i64::from(shard))
        })
        .collect()
}

pub fn engine(executor: &Arc<InMemoryExecutor>) -> QueryEngine {
    QueryEngine::new(executor.clone())
}

pub fn ints(rows: &[Row], field: &str) -> Vec<i64> {
    rows.iter()
        .map(|r| r.get(field).and_then(|v| v.as_i64()).unwrap_or(-1))
        .collect()
}
