//! Driver loop
//!
//! [`Execution::next_batch`] pulls rows from the root operator until the
//! batch is full or the plan is exhausted. Operators never block: when a
//! receive step needs shard data the whole tree reports `NeedInput`, the
//! driver issues the queued shard requests concurrently, installs the
//! responses and pulls again. Every batch that stops early hands back a
//! continuation token holding the full runtime context.

use futures_util::future::join_all;
use shardql_plan::{QueryPlan, Row};
use shardql_registry::FunctionRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::bind::BindVariables;
use crate::continuation::{self, ContinuationToken, TokenBody};
use crate::context::RuntimeContext;
use crate::error::{QueryError, Result};
use crate::executor::RequestExecutor;
use crate::operator::{self, FetchTask, Operator, OperatorState, Poll};
use crate::options::{EngineConfig, QueryOptions};

/// Rows produced by one batch
#[derive(Debug, Clone, Default)]
pub struct QueryBatch {
    pub rows: Vec<Row>,
    /// `None` once the query has produced every row
    pub continuation_token: Option<ContinuationToken>,
}

impl QueryBatch {
    pub fn is_last(&self) -> bool {
        self.continuation_token.is_none()
    }
}

/// Why a batch stopped pulling
enum Stop {
    Exhausted,
    Full,
}

/// One query execution: the operator tree plus its runtime context
pub struct Execution {
    plan: Arc<QueryPlan>,
    root: Operator,
    ctx: RuntimeContext,
    finished: bool,
}

impl Execution {
    /// Instantiate the plan, check bind variables and restore state from
    /// `options.continuation_token` when present.
    pub fn start(
        plan: Arc<QueryPlan>,
        registry: &FunctionRegistry,
        bindings: BindVariables,
        options: &QueryOptions,
        config: &EngineConfig,
    ) -> Result<Self> {
        let resolved = options.resolve(config)?;
        plan.validate()?;
        let root = Operator::build(&plan, registry)?;

        for var in plan.bind_references() {
            bindings.resolve(var)?;
        }

        let (execution_id, elapsed, states) = match &options.continuation_token {
            Some(token) => {
                let body = continuation::decode(token, &plan, &bindings)?;
                (body.execution_id, Duration::from_millis(body.elapsed_ms), body.states)
            }
            None => (Uuid::new_v4(), Duration::ZERO, OperatorState::initial_states(&plan)),
        };

        let mut ctx = RuntimeContext::new(execution_id, bindings, resolved, states, elapsed);
        if let Err(err) = root.open(&mut ctx) {
            ctx.memory.release_all();
            return Err(err);
        }

        info!(
            execution_id = %execution_id,
            plan = %short_fingerprint(&plan),
            resumed = options.continuation_token.is_some(),
            "execution started"
        );

        Ok(Self {
            plan,
            root,
            ctx,
            finished: false,
        })
    }

    pub fn execution_id(&self) -> Uuid {
        self.ctx.execution_id
    }

    pub fn plan(&self) -> &Arc<QueryPlan> {
        &self.plan
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes currently held against the memory budget
    pub fn memory_used(&self) -> u64 {
        self.ctx.memory.used()
    }

    pub fn context(&self) -> &RuntimeContext {
        &self.ctx
    }

    /// Token for the current state, `None` once finished
    pub fn continuation_token(&self) -> Result<Option<ContinuationToken>> {
        if self.finished {
            return Ok(None);
        }
        let body = TokenBody {
            execution_id: self.ctx.execution_id,
            elapsed_ms: self.ctx.elapsed.as_millis() as u64,
            shape: self.plan.shape(),
            states: self.ctx.states.clone(),
        };
        continuation::encode(&self.plan, &self.ctx.bindings, &body).map(Some)
    }

    pub async fn next_batch(&mut self, executor: &dyn RequestExecutor) -> Result<QueryBatch> {
        if self.finished {
            return Ok(QueryBatch::default());
        }
        let span = info_span!(
            "batch",
            execution_id = %self.ctx.execution_id,
            plan = %short_fingerprint(&self.plan),
        );
        self.run_batch(executor).instrument(span).await
    }

    async fn run_batch(&mut self, executor: &dyn RequestExecutor) -> Result<QueryBatch> {
        let started = Instant::now();
        let mut rows = Vec::new();
        let outcome = self.pull(executor, started, &mut rows).await;

        // Millisecond resolution keeps re-encoded tokens identical.
        let spent = Duration::from_millis(started.elapsed().as_millis() as u64);
        self.ctx.elapsed += spent;

        match outcome {
            Err(err) => {
                self.abort();
                Err(err)
            }
            Ok(Stop::Exhausted) => {
                self.root.close(&mut self.ctx);
                self.finished = true;
                info!(
                    rows = rows.len(),
                    elapsed_ms = self.ctx.elapsed.as_millis() as u64,
                    "execution finished"
                );
                Ok(QueryBatch {
                    rows,
                    continuation_token: None,
                })
            }
            Ok(Stop::Full) => {
                let token = match self.continuation_token() {
                    Ok(token) => token,
                    Err(err) => {
                        self.abort();
                        return Err(err);
                    }
                };
                self.ctx.last_token = token.clone();
                debug!(
                    rows = rows.len(),
                    memory_used = self.ctx.memory.used(),
                    "batch complete"
                );
                Ok(QueryBatch {
                    rows,
                    continuation_token: token,
                })
            }
        }
    }

    async fn pull(
        &mut self,
        executor: &dyn RequestExecutor,
        started: Instant,
        rows: &mut Vec<Row>,
    ) -> Result<Stop> {
        let limit = self.ctx.options.limit;
        let max_batch_bytes = self.ctx.options.max_batch_bytes;
        let max_round_trips = self.ctx.options.max_round_trips;
        let mut batch_bytes = 0u64;
        let mut rounds = 0u32;

        loop {
            if limit.is_some_and(|limit| rows.len() >= limit)
                || max_batch_bytes.is_some_and(|max| batch_bytes >= max)
            {
                return Ok(Stop::Full);
            }

            match self.root.next(&mut self.ctx)? {
                Poll::Row(row) => {
                    batch_bytes += row.size_estimate();
                    rows.push(row);
                }
                Poll::Exhausted => return Ok(Stop::Exhausted),
                Poll::NeedInput => {
                    if max_round_trips.is_some_and(|max| rounds >= max) {
                        return Ok(Stop::Full);
                    }
                    rounds += 1;
                    self.fetch_round(executor, started.elapsed()).await?;
                }
            }
        }
    }

    /// Issue every queued shard request and install the responses
    async fn fetch_round(
        &mut self,
        executor: &dyn RequestExecutor,
        in_batch: Duration,
    ) -> Result<()> {
        let mut tasks: Vec<FetchTask> = Vec::new();
        self.root.take_fetches(&mut self.ctx, &mut tasks)?;
        if tasks.is_empty() {
            return Err(QueryError::IllegalState(
                "operator needs input but queued no shard requests".to_string(),
            ));
        }

        debug!(
            requests = tasks.len(),
            shards = ?tasks.iter().map(|t| t.request.shard).collect::<Vec<_>>(),
            "fetch round"
        );

        let requests = join_all(tasks.iter().map(|task| executor.execute(task.request.clone())));
        let responses = match (self.ctx.remaining(in_batch), self.ctx.options.timeout) {
            (Some(remaining), Some(timeout)) => {
                if remaining.is_zero() {
                    warn!(timeout_ms = timeout.as_millis() as u64, "query timed out");
                    return Err(QueryError::Timeout(timeout));
                }
                match tokio::time::timeout(remaining, requests).await {
                    Ok(responses) => responses,
                    Err(_) => {
                        warn!(timeout_ms = timeout.as_millis() as u64, "query timed out");
                        return Err(QueryError::Timeout(timeout));
                    }
                }
            }
            _ => requests.await,
        };

        for (task, response) in tasks.iter().zip(responses) {
            operator::install_response(&mut self.ctx, task, response?)?;
        }
        Ok(())
    }

    /// Drop every buffer and release all memory; the execution is over
    fn abort(&mut self) {
        self.root.close(&mut self.ctx);
        let leaked = self.ctx.memory.release_all();
        if leaked > 0 {
            warn!(bytes = leaked, "released memory still held after close");
        }
        self.finished = true;
    }
}

fn short_fingerprint(plan: &QueryPlan) -> String {
    plan.fingerprint()[..12].to_string()
}

/// Runs plans against one request executor with shared engine defaults
pub struct QueryEngine {
    executor: Arc<dyn RequestExecutor>,
    config: EngineConfig,
    registry: Arc<FunctionRegistry>,
}

impl QueryEngine {
    pub fn new(executor: Arc<dyn RequestExecutor>) -> Self {
        Self {
            executor,
            config: EngineConfig::default(),
            registry: Arc::new(FunctionRegistry::default()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: Arc<FunctionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn start(
        &self,
        plan: Arc<QueryPlan>,
        bindings: BindVariables,
        options: &QueryOptions,
    ) -> Result<Execution> {
        Execution::start(plan, &self.registry, bindings, options, &self.config)
    }

    pub async fn next_batch(&self, execution: &mut Execution) -> Result<QueryBatch> {
        execution.next_batch(self.executor.as_ref()).await
    }

    /// Run one batch, resuming from `options.continuation_token` when set
    pub async fn execute_batch(
        &self,
        plan: Arc<QueryPlan>,
        bindings: BindVariables,
        options: &QueryOptions,
    ) -> Result<QueryBatch> {
        let mut execution = self.start(plan, bindings, options)?;
        self.next_batch(&mut execution).await
    }

    /// Run batches until the query is exhausted, passing each token back in
    pub async fn collect_all(
        &self,
        plan: Arc<QueryPlan>,
        bindings: BindVariables,
        options: &QueryOptions,
    ) -> Result<Vec<Row>> {
        let mut options = options.clone();
        let mut rows = Vec::new();
        loop {
            let batch = self
                .execute_batch(plan.clone(), bindings.clone(), &options)
                .await?;
            rows.extend(batch.rows);
            match batch.continuation_token {
                Some(token) => options.continuation_token = Some(token),
                None => return Ok(rows),
            }
        }
    }
}
