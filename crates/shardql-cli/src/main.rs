//! shardql command-line front end
//!
//! Runs query plans against shard data held in a JSON fixture, printing
//! result rows as JSON lines on stdout and the continuation token, when
//! there is one, on stderr.

use anyhow::{bail, Context};
use shardql_exec::{
    BindVariables, ContinuationToken, InMemoryExecutor, PlanSource, QueryEngine, QueryOptions,
};
use shardql_plan::{QueryPlan, Row};
use shardql_registry::FunctionRegistry;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

mod args;
mod config;
mod fixture;
mod logging;

use args::{Cli, Command};
use config::Config;
use fixture::{load_shards, parse_value, FilePlanSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse_args();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.apply_logging_env();
    logging::init();

    match cli.command {
        Command::Run {
            plan,
            data,
            binds,
            bind_positions,
            limit,
            token,
            all,
            page_size,
            max_memory_mb,
        } => {
            let plan = FilePlanSource
                .prepare(&plan.to_string_lossy())
                .await
                .context("preparing plan")?;
            let bindings = parse_bindings(&binds, &bind_positions)?;

            let mut options = QueryOptions::new();
            options.limit = limit;
            options.max_memory_mb = max_memory_mb;
            if let Some(token) = token {
                options.continuation_token = Some(ContinuationToken::from_base64(&token)?);
            }

            let executor = InMemoryExecutor::new(page_size).with_tables(load_shards(&data)?);
            let engine = QueryEngine::new(Arc::new(executor)).with_config(config.engine);
            run(&engine, plan, bindings, &options, all).await
        }
        Command::Fingerprint { plan } => {
            let plan = read_plan(&plan)?;
            println!("{}", plan.fingerprint());
            Ok(())
        }
        Command::Functions => {
            let registry = FunctionRegistry::default();
            println!("{}", serde_json::to_string_pretty(&registry.signatures())?);
            Ok(())
        }
    }
}

async fn run(
    engine: &QueryEngine,
    plan: Arc<QueryPlan>,
    bindings: BindVariables,
    options: &QueryOptions,
    all: bool,
) -> anyhow::Result<()> {
    let fingerprint = plan.fingerprint();
    info!(plan = %fingerprint, all, "running plan");

    if all {
        let rows = engine.collect_all(plan, bindings, options).await?;
        print_rows(&rows)?;
        return Ok(());
    }

    let batch = engine.execute_batch(plan, bindings, options).await?;
    print_rows(&batch.rows)?;
    if let Some(token) = batch.continuation_token {
        eprintln!("continuation: {}", token);
    }
    Ok(())
}

fn print_rows(rows: &[Row]) -> anyhow::Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for row in rows {
        serde_json::to_writer(&mut out, row)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

fn read_plan(path: &Path) -> anyhow::Result<QueryPlan> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(QueryPlan::from_json(&json)?)
}

fn parse_bindings(named: &[String], positional: &[String]) -> anyhow::Result<BindVariables> {
    let mut bindings = BindVariables::new();
    for bind in named {
        let Some((name, value)) = bind.split_once('=') else {
            bail!("bind variable {:?} is not NAME=JSON", bind);
        };
        bindings.bind(name.trim(), parse_value(value));
    }
    for (index, value) in positional.iter().enumerate() {
        bindings.bind_position(index as u32 + 1, parse_value(value))?;
    }
    Ok(bindings)
}
