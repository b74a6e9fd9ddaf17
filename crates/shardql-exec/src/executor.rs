//! Contracts with the rest of the driver
//!
//! The engine never talks to the network itself. Shard reads go through a
//! [`RequestExecutor`], which owns transport, request signing, retries and
//! rate limiting; plans come from a [`PlanSource`].

use async_trait::async_trait;
use shardql_plan::{QueryPlan, Row, ShardId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{QueryError, RequestError, RequestErrorKind, Result};
use crate::options::Consistency;

/// One "get next batch" read against a single shard
#[derive(Debug, Clone, PartialEq)]
pub struct ShardRequest {
    pub table: String,
    pub shard: ShardId,
    /// Server cursor from the previous response for this shard; `None` on the first read
    pub continuation: Option<Vec<u8>>,
    pub limit: Option<usize>,
    pub max_read_kb: Option<u32>,
    pub max_write_kb: Option<u32>,
    pub consistency: Consistency,
}

/// Rows read from one shard
#[derive(Debug, Clone, Default)]
pub struct ShardResponse {
    /// Sorted when the receive step is ordered; may be empty even when more data remains
    pub rows: Vec<Row>,
    /// `None` once the shard has no more rows
    pub continuation: Option<Vec<u8>>,
}

/// Sends a signed shard request and classifies failures
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(
        &self,
        request: ShardRequest,
    ) -> std::result::Result<ShardResponse, RequestError>;
}

/// Supplies the plan for a prepared statement
#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn prepare(&self, statement: &str) -> Result<Arc<QueryPlan>>;
}

/// Plan source backed by a fixed statement → plan map
#[derive(Default)]
pub struct StaticPlanSource {
    plans: HashMap<String, Arc<QueryPlan>>,
}

impl StaticPlanSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, statement: impl Into<String>, plan: QueryPlan) {
        self.plans.insert(statement.into(), Arc::new(plan));
    }
}

#[async_trait]
impl PlanSource for StaticPlanSource {
    async fn prepare(&self, statement: &str) -> Result<Arc<QueryPlan>> {
        self.plans
            .get(statement)
            .cloned()
            .ok_or_else(|| {
                QueryError::IllegalArgument(format!("statement not prepared: {}", statement))
            })
    }
}

struct InjectedFailure {
    successes_before_failure: usize,
    error: RequestError,
}

/// Request executor serving fixed rows from memory.
///
/// Each shard's rows are served in pages of `page_size` rows, with the
/// offset of the next page as the continuation. Used by tests and the CLI.
pub struct InMemoryExecutor {
    tables: HashMap<String, BTreeMap<ShardId, Vec<Row>>>,
    page_size: usize,
    latency: Option<Duration>,
    failures: Mutex<HashMap<ShardId, InjectedFailure>>,
    requests: AtomicUsize,
}

impl InMemoryExecutor {
    pub fn new(page_size: usize) -> Self {
        Self {
            tables: HashMap::new(),
            page_size: page_size.max(1),
            latency: None,
            failures: Mutex::new(HashMap::new()),
            requests: AtomicUsize::new(0),
        }
    }

    pub fn with_table(
        mut self,
        table: impl Into<String>,
        shards: impl IntoIterator<Item = (ShardId, Vec<Row>)>,
    ) -> Self {
        self.tables.insert(table.into(), shards.into_iter().collect());
        self
    }

    pub fn with_tables(mut self, tables: HashMap<String, BTreeMap<ShardId, Vec<Row>>>) -> Self {
        self.tables.extend(tables);
        self
    }

    /// Delay every response
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail requests to `shard` with `error` after `successes` good responses
    pub fn with_failure(self, shard: ShardId, successes: usize, error: RequestError) -> Self {
        self.lock_failures().insert(
            shard,
            InjectedFailure {
                successes_before_failure: successes,
                error,
            },
        );
        self
    }

    /// Number of shard requests served or failed so far
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, HashMap<ShardId, InjectedFailure>> {
        self.failures.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_failure(&self, shard: ShardId) -> std::result::Result<(), RequestError> {
        let mut failures = self.lock_failures();
        match failures.get_mut(&shard) {
            Some(failure) if failure.successes_before_failure == 0 => Err(failure.error.clone()),
            Some(failure) => {
                failure.successes_before_failure -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn page(&self, request: &ShardRequest) -> std::result::Result<ShardResponse, RequestError> {
        let rows = self
            .tables
            .get(&request.table)
            .ok_or_else(|| {
                RequestError::new(
                    RequestErrorKind::Service,
                    format!("table not found: {}", request.table),
                    false,
                )
            })?
            .get(&request.shard)
            .ok_or_else(|| {
                RequestError::new(
                    RequestErrorKind::Service,
                    format!("shard {} not found in table {}", request.shard, request.table),
                    false,
                )
            })?;

        let offset = match &request.continuation {
            None => 0,
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    RequestError::new(
                        RequestErrorKind::Service,
                        "invalid shard continuation",
                        false,
                    )
                })?;
                u64::from_be_bytes(raw) as usize
            }
        };

        let max_rows = request.limit.map_or(self.page_size, |l| l.min(self.page_size));
        let max_bytes = request.max_read_kb.map(|kb| u64::from(kb) * 1024);

        let mut page = Vec::new();
        let mut bytes = 0u64;
        for row in rows.iter().skip(offset).take(max_rows) {
            bytes += row.size_estimate();
            if let Some(max) = max_bytes {
                if bytes > max && !page.is_empty() {
                    break;
                }
            }
            page.push(row.clone());
        }

        let next = offset + page.len();
        let continuation = (next < rows.len()).then(|| (next as u64).to_be_bytes().to_vec());
        Ok(ShardResponse {
            rows: page,
            continuation,
        })
    }
}

#[async_trait]
impl RequestExecutor for InMemoryExecutor {
    async fn execute(
        &self,
        request: ShardRequest,
    ) -> std::result::Result<ShardResponse, RequestError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.check_failure(request.shard)?;
        self.page(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardql_plan::Value;

    fn rows(n: i64) -> Vec<Row> {
        (0..n).map(|i| Row::new().with("k", i)).collect()
    }

    fn request(shard: ShardId, continuation: Option<Vec<u8>>) -> ShardRequest {
        ShardRequest {
            table: "t".to_string(),
            shard,
            continuation,
            limit: None,
            max_read_kb: None,
            max_write_kb: None,
            consistency: Consistency::Eventual,
        }
    }

    #[tokio::test]
    async fn test_pages_through_shard() {
        let executor = InMemoryExecutor::new(2).with_table("t", [(7, rows(5))]);

        let first = executor.execute(request(7, None)).await.unwrap();
        assert_eq!(first.rows.len(), 2);
        let second = executor.execute(request(7, first.continuation)).await.unwrap();
        assert_eq!(second.rows[0].get("k"), Some(&Value::Int(2)));
        let third = executor.execute(request(7, second.continuation)).await.unwrap();
        assert_eq!(third.rows.len(), 1);
        assert!(third.continuation.is_none());
        assert_eq!(executor.request_count(), 3);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let executor = InMemoryExecutor::new(1)
            .with_table("t", [(1, rows(3))])
            .with_failure(1, 1, RequestError::new(RequestErrorKind::Network, "reset", true));

        let first = executor.execute(request(1, None)).await.unwrap();
        let err = executor.execute(request(1, first.continuation)).await.unwrap_err();
        assert_eq!(err.kind, RequestErrorKind::Network);
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_static_plan_source() {
        let mut source = StaticPlanSource::new();
        source.insert(
            "select * from t",
            QueryPlan::new(shardql_plan::PlanStep::Receive {
                table: "t".to_string(),
                shards: vec![1],
                ordered: false,
            }),
        );
        assert!(source.prepare("select * from t").await.is_ok());
        assert!(matches!(
            source.prepare("select 1").await,
            Err(QueryError::IllegalArgument(_))
        ));
    }
}
