//! CLI argument definitions using clap
//!
//! Commands:
//! - shardql run --plan <path> --data <path>
//! - shardql fingerprint --plan <path>
//! - shardql functions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// shardql - run distributed query plans against sharded data
#[derive(Parser, Debug)]
#[command(name = "shardql")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute a plan against a JSON shard fixture
    Run {
        /// Plan file (JSON)
        #[arg(long)]
        plan: PathBuf,

        /// Shard data: {"table": {"shard id": [rows...]}}
        #[arg(long)]
        data: PathBuf,

        /// Named bind variable, as name=<json>
        #[arg(long = "bind", value_name = "NAME=JSON")]
        binds: Vec<String>,

        /// Positional bind variable; the first occurrence is position 1
        #[arg(long = "bind-pos", value_name = "JSON")]
        bind_positions: Vec<String>,

        /// Maximum rows per batch
        #[arg(long)]
        limit: Option<usize>,

        /// Resume from a continuation token
        #[arg(long)]
        token: Option<String>,

        /// Keep fetching batches until the query is exhausted
        #[arg(long)]
        all: bool,

        /// Rows per shard response served by the fixture
        #[arg(long, default_value_t = 100)]
        page_size: usize,

        /// Local buffering budget in MB
        #[arg(long)]
        max_memory_mb: Option<u64>,
    },

    /// Print a plan's fingerprint
    Fingerprint {
        /// Plan file (JSON)
        #[arg(long)]
        plan: PathBuf,
    },

    /// List the built-in functions as JSON
    Functions,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
