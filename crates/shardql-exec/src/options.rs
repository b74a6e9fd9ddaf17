//! Per-query options and engine-wide defaults

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::continuation::ContinuationToken;
use crate::error::{QueryError, Result};

pub const DEFAULT_MAX_MEMORY_MB: u64 = 1024;
pub const DEFAULT_MAX_FAN_OUT: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    #[default]
    Eventual,
    Absolute,
}

/// Engine defaults, normally loaded from the `engine` section of the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local buffering budget when a query does not set `max_memory_mb`
    pub max_memory_mb: u64,

    /// Shard requests issued concurrently by an unordered receive
    pub max_fan_out: usize,

    /// Rows per batch when a query does not set `limit`
    pub default_limit: Option<usize>,

    /// Cumulative timeout when a query does not set one
    pub default_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            max_fan_out: DEFAULT_MAX_FAN_OUT,
            default_limit: None,
            default_timeout_ms: None,
        }
    }
}

/// Options for one query execution
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Maximum rows returned per batch
    pub limit: Option<usize>,
    /// Server-side read cap per shard request, in KB
    pub max_read_kb: Option<u32>,
    /// Server-side write cap per shard request, in KB
    pub max_write_kb: Option<u32>,
    /// Local buffering budget
    pub max_memory_mb: Option<u64>,
    /// Stop a batch once returned rows reach this many bytes
    pub max_batch_bytes: Option<u64>,
    /// Stop a batch after this many fetch rounds
    pub max_round_trips: Option<u32>,
    pub consistency: Consistency,
    /// Cumulative across every batch of the execution
    pub timeout: Option<Duration>,
    /// Resume point from a previous batch
    pub continuation_token: Option<ContinuationToken>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_max_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = Some(mb);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_round_trips(mut self, rounds: u32) -> Self {
        self.max_round_trips = Some(rounds);
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_continuation_token(mut self, token: ContinuationToken) -> Self {
        self.continuation_token = Some(token);
        self
    }

    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, value: Option<u64>) -> Result<()> {
            match value {
                Some(0) => Err(QueryError::IllegalArgument(format!(
                    "{} must be greater than zero",
                    name
                ))),
                _ => Ok(()),
            }
        }

        positive("limit", self.limit.map(|v| v as u64))?;
        positive("max_read_kb", self.max_read_kb.map(u64::from))?;
        positive("max_write_kb", self.max_write_kb.map(u64::from))?;
        positive("max_memory_mb", self.max_memory_mb)?;
        positive("max_batch_bytes", self.max_batch_bytes)?;
        positive("max_round_trips", self.max_round_trips.map(u64::from))?;
        if self.timeout == Some(Duration::ZERO) {
            return Err(QueryError::IllegalArgument(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Fill unset options from the engine defaults.
    pub(crate) fn resolve(&self, config: &EngineConfig) -> Result<ResolvedOptions> {
        self.validate()?;
        if config.max_fan_out == 0 {
            return Err(QueryError::IllegalArgument(
                "max_fan_out must be greater than zero".to_string(),
            ));
        }
        Ok(ResolvedOptions {
            limit: self.limit.or(config.default_limit),
            max_read_kb: self.max_read_kb,
            max_write_kb: self.max_write_kb,
            max_memory_mb: self.max_memory_mb.unwrap_or(config.max_memory_mb),
            max_batch_bytes: self.max_batch_bytes,
            max_round_trips: self.max_round_trips,
            consistency: self.consistency,
            timeout: self
                .timeout
                .or(config.default_timeout_ms.map(Duration::from_millis)),
            max_fan_out: config.max_fan_out,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
    pub limit: Option<usize>,
    pub max_read_kb: Option<u32>,
    pub max_write_kb: Option<u32>,
    pub max_memory_mb: u64,
    pub max_batch_bytes: Option<u64>,
    pub max_round_trips: Option<u32>,
    pub consistency: Consistency,
    pub timeout: Option<Duration>,
    pub max_fan_out: usize,
}
