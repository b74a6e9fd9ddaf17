//! Client-side distributed query engine
//!
//! Executes a [`QueryPlan`](shardql_plan::QueryPlan) against a sharded
//! table store. Shard reads go through a caller-supplied
//! [`RequestExecutor`]; results come back in bounded batches, each batch
//! after the first resuming from the [`ContinuationToken`] the previous one
//! returned.
//!
//! ```no_run
//! use std::sync::Arc;
//! use shardql_exec::{BindVariables, InMemoryExecutor, QueryEngine, QueryOptions};
//! use shardql_plan::{PlanStep, QueryPlan, Row};
//!
//! # async fn run() -> shardql_exec::Result<()> {
//! let executor = InMemoryExecutor::new(100)
//!     .with_table("users", [(0, vec![Row::new().with("id", 1)])]);
//! let engine = QueryEngine::new(Arc::new(executor));
//! let plan = Arc::new(QueryPlan::new(PlanStep::Receive {
//!     table: "users".to_string(),
//!     shards: vec![0],
//!     ordered: false,
//! }));
//!
//! let options = QueryOptions::new().with_limit(10);
//! let batch = engine
//!     .execute_batch(plan, BindVariables::new(), &options)
//!     .await?;
//! println!("{} rows", batch.rows.len());
//! # Ok(())
//! # }
//! ```

pub mod bind;
pub mod context;
pub mod continuation;
pub mod driver;
pub mod error;
pub mod executor;
mod expr;
pub mod memory;
mod operator;
pub mod options;

pub use bind::BindVariables;
pub use context::RuntimeContext;
pub use continuation::{ContinuationToken, TOKEN_FORMAT_VERSION};
pub use driver::{Execution, QueryBatch, QueryEngine};
pub use error::{ErrorCode, QueryError, RequestError, RequestErrorKind, Result};
pub use executor::{
    InMemoryExecutor, PlanSource, RequestExecutor, ShardRequest, ShardResponse, StaticPlanSource,
};
pub use memory::MemoryTracker;
pub use options::{Consistency, EngineConfig, QueryOptions};
