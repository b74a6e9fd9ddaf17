//! File-backed plan source and shard data

use async_trait::async_trait;
use shardql_exec::{PlanSource, QueryError};
use shardql_plan::{QueryPlan, Row, ShardId, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Plans prepared from files; the statement is the file path
pub struct FilePlanSource;

#[async_trait]
impl PlanSource for FilePlanSource {
    async fn prepare(&self, statement: &str) -> shardql_exec::Result<Arc<QueryPlan>> {
        let json = tokio::fs::read_to_string(statement).await.map_err(|e| {
            QueryError::IllegalArgument(format!("cannot read plan {}: {}", statement, e))
        })?;
        Ok(Arc::new(QueryPlan::from_json(&json)?))
    }
}

pub type ShardData = HashMap<String, BTreeMap<ShardId, Vec<Row>>>;

/// Load `{"table": {"0": [rows...], "1": [...]}}`
pub fn load_shards(path: &Path) -> anyhow::Result<ShardData> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Parse a command-line bind value: JSON when it parses, otherwise a string
pub fn parse_value(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
