//! CLI command definitions for memo-forge.
//!
//! `run` answers a file of tasks with one memoized LLM call each, writing
//! periodic checkpoints; `cache stats` inspects a cache file.

use crate::config::{ForgeConfig, DEFAULT_CACHE_PATH};
use crate::error::PoolError;
use crate::llm::{
    BackendRouter, CacheSummary, ExtractJson, LiteLlmClient, PersistentCache, RequireFields,
    RetryPolicy, RetryingCaller,
};
use crate::scheduler::{
    load_previous, load_tasks, JsonCheckpoint, LlmTaskWorker, RunSummary, WorkerPool,
    WorkerPoolConfig,
};
use crate::storage::AppendLog;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Memoized, retrying, checkpointed batch runner for LLM calls.
#[derive(Parser)]
#[command(name = "memo-forge")]
#[command(about = "Run batches of LLM calls with a persistent cache and checkpoints")]
#[command(version)]
#[command(
    long_about = "memo-forge answers every task in a JSON/JSONL file with an LLM call.\n\nResults are cached by call identity, so rerunning a batch only pays for calls that never succeeded, and partial results are checkpointed so an interrupted run can resume.\n\nExample usage:\n  memo-forge run --tasks tasks.jsonl --operation gpt-4o --output results.json --extract-json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run every task through the selected backend and write the results.
    Run(RunArgs),

    /// Inspect the response cache.
    Cache(CacheArgs),
}

/// Arguments for `memo-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Task file: JSON Lines, a JSON array, or a JSON object keyed by id.
    #[arg(short = 't', long)]
    pub tasks: PathBuf,

    /// Operation id used to route calls (e.g. gpt-4o, claude-sonnet, gemini).
    #[arg(short = 'p', long)]
    pub operation: String,

    /// Where results (and checkpoints) are written.
    #[arg(short = 'o', long)]
    pub output: PathBuf,

    /// Configuration file (.json, .yaml or .yml).
    #[arg(short = 'c', long, env = "MEMO_FORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of concurrent workers.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Checkpoint after this many completed tasks.
    #[arg(long)]
    pub checkpoint_every: Option<usize>,

    /// Retries after the first attempt of each call.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Delay between attempts, in milliseconds.
    #[arg(long)]
    pub backoff_ms: Option<u64>,

    /// Response cache file.
    #[arg(long)]
    pub cache: Option<PathBuf>,

    /// Append every backend exchange to this JSONL file.
    #[arg(long)]
    pub audit_log: Option<PathBuf>,

    /// Reuse results already present in the output file.
    #[arg(long)]
    pub resume: bool,

    /// Parse a JSON value out of every reply.
    #[arg(long)]
    pub extract_json: bool,

    /// Reject replies missing this field (repeatable; implies --extract-json).
    #[arg(long = "require-field")]
    pub require_fields: Vec<String>,

    /// OpenAI-compatible endpoint serving --operation, in addition to configured backends.
    #[arg(long, env = "LITELLM_API_BASE")]
    pub api_base: Option<String>,

    /// API key for --api-base.
    #[arg(long, env = "LITELLM_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Model sent to --api-base (defaults to the operation id).
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// Print the run summary as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `memo-forge cache`.
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Cache subcommand to run.
    #[command(subcommand)]
    pub command: CacheSubcommand,
}

/// Cache subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum CacheSubcommand {
    /// Count the entries in a cache file.
    Stats(CacheStatsArgs),
}

/// Arguments for `memo-forge cache stats`.
#[derive(Parser, Debug)]
pub struct CacheStatsArgs {
    /// Cache file to inspect.
    #[arg(long, default_value = DEFAULT_CACHE_PATH)]
    pub path: PathBuf,

    /// Print the summary as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and
/// `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_batch_command(args).await,
        Commands::Cache(args) => match args.command {
            CacheSubcommand::Stats(args) => run_cache_stats_command(args),
        },
    }
}

// ============================================================================
// Run Command Implementation
// ============================================================================

/// Load the config file (if any) and apply command-line overrides.
fn resolve_config(args: &RunArgs) -> anyhow::Result<ForgeConfig> {
    let mut config = match &args.config {
        Some(path) => ForgeConfig::load(path)?,
        None => ForgeConfig::default(),
    };

    if let Some(concurrency) = args.concurrency {
        config.pool.concurrency = concurrency;
    }
    if let Some(every) = args.checkpoint_every {
        config.pool.checkpoint_every = every;
    }
    if let Some(retries) = args.max_retries {
        config.retry.max_retries = retries;
    }
    if let Some(backoff) = args.backoff_ms {
        config.retry.backoff_ms = backoff;
    }
    if let Some(cache) = &args.cache {
        config.cache.path = cache.clone();
    }
    if let Some(audit) = &args.audit_log {
        config.audit_log = Some(audit.clone());
    }

    config.validate()?;
    Ok(config)
}

fn build_router(args: &RunArgs, config: &ForgeConfig) -> anyhow::Result<BackendRouter> {
    let mut router = BackendRouter::from_config(config)?;

    if let Some(api_base) = &args.api_base {
        let model = args.model.clone().unwrap_or_else(|| args.operation.clone());
        let client = LiteLlmClient::new(
            api_base.clone(),
            args.api_key.clone(),
            model,
            Duration::from_secs(crate::llm::litellm::DEFAULT_TIMEOUT_SECS),
        )?;
        router.register(args.operation.clone(), Arc::new(client));
    }

    if let Err(e) = router.require(&args.operation) {
        anyhow::bail!("{e}: add it to the config's backends or pass --api-base");
    }
    Ok(router)
}

async fn run_batch_command(args: RunArgs) -> anyhow::Result<()> {
    let config = resolve_config(&args)?;
    let router = build_router(&args, &config)?;
    let tasks = load_tasks(&args.tasks)?;

    let cache = Arc::new(PersistentCache::new(&config.cache.path));
    let mut caller = RetryingCaller::new(Arc::new(router), Arc::clone(&cache))
        .with_policy(RetryPolicy::from(&config.retry));

    let audit = match &config.audit_log {
        Some(path) => {
            let log = Arc::new(AppendLog::open_at(path)?);
            caller = caller.with_audit_log(Arc::clone(&log));
            Some(log)
        }
        None => None,
    };

    let mut worker = LlmTaskWorker::new(Arc::new(caller), args.operation.clone());
    if args.extract_json || !args.require_fields.is_empty() {
        worker = worker.with_processor(Arc::new(ExtractJson));
    }
    if !args.require_fields.is_empty() {
        worker = worker.with_processor(Arc::new(RequireFields::new(args.require_fields.clone())));
    }

    let mut pool = WorkerPool::new(
        WorkerPoolConfig::new(config.pool.concurrency)
            .with_checkpoint_every(config.pool.checkpoint_every),
    )?;

    let mut resumed = 0;
    if args.resume {
        match load_previous(&args.output).map_err(PoolError::Resume)? {
            Some(previous) => {
                resumed = previous
                    .values()
                    .filter(|v| v.as_ref().is_some_and(crate::llm::is_present))
                    .count();
                pool = pool.with_previous(previous);
            }
            None => warn!(output = %args.output.display(), "Nothing to resume from"),
        }
    }

    info!(
        operation = %args.operation,
        tasks = tasks.len(),
        cache = %config.cache.path.display(),
        output = %args.output.display(),
        "Running batch"
    );

    let sink = Arc::new(JsonCheckpoint::new(&args.output));
    let outcome = pool.run(tasks, Arc::new(worker), sink).await;

    if let Some(log) = audit {
        if let Err(e) = log.close() {
            warn!(error = %e, "Failed to close audit log");
        }
    }
    let results = outcome?;

    let stats = cache.stats();
    let summary = RunSummary::from_results(&results, resumed);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("\n=== Batch Results ===");
        println!("Total tasks:    {}", summary.total);
        println!("Succeeded:      {}", summary.succeeded);
        println!("Failed:         {}", summary.failed);
        println!("Resumed:        {}", summary.resumed);
        println!("Success rate:   {:.1}%", summary.success_rate());
        println!(
            "Cache:          {} hits, {} misses ({:.1}% hit rate)",
            stats.hits,
            stats.misses,
            stats.hit_rate() * 100.0
        );
        println!("Output:         {}", args.output.display());
    }

    Ok(())
}

// ============================================================================
// Cache Command Implementation
// ============================================================================

fn run_cache_stats_command(args: CacheStatsArgs) -> anyhow::Result<()> {
    let summary = CacheSummary::from_file(&args.path)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Cache file:     {}", args.path.display());
    println!("Entries:        {}", summary.total);
    println!("Valid:          {}", summary.valid);
    println!("Errored:        {}", summary.errored);
    println!("Not servable:   {}", summary.unusable);
    if !summary.by_operation.is_empty() {
        println!("By operation:");
        for (operation, count) in &summary.by_operation {
            println!("  {operation:<24} {count}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args.iter().copied()).unwrap()
    }

    #[test]
    fn test_parse_run_with_overrides() {
        let cli = parse(&[
            "memo-forge",
            "run",
            "--tasks",
            "tasks.jsonl",
            "--operation",
            "gpt-4o",
            "--output",
            "out.json",
            "--concurrency",
            "8",
            "--require-field",
            "question",
            "--require-field",
            "answer",
            "--resume",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.concurrency, Some(8));
        assert_eq!(args.require_fields, vec!["question", "answer"]);
        assert!(args.resume);
        assert!(!args.extract_json);

        let config = resolve_config(&args).unwrap();
        assert_eq!(config.pool.concurrency, 8);
        assert_eq!(config.pool.checkpoint_every, 10);
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let cli = parse(&[
            "memo-forge", "run", "-t", "t.jsonl", "-p", "gpt", "-o", "o.json", "--concurrency", "0",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert!(resolve_config(&args).is_err());
    }

    #[test]
    fn test_unrouted_operation_is_rejected() {
        let cli = parse(&["memo-forge", "run", "-t", "t.jsonl", "-p", "qwen-max", "-o", "o.json"]);
        let Commands::Run(mut args) = cli.command else {
            panic!("expected run command");
        };
        args.api_base = None;
        let config = ForgeConfig::default();
        assert!(build_router(&args, &config).is_err());

        args.api_base = Some("http://localhost:4000/v1".to_string());
        let router = build_router(&args, &config).unwrap();
        assert!(router.resolve("qwen-max").is_some());
    }

    #[test]
    fn test_parse_cache_stats() {
        let cli = parse(&["memo-forge", "cache", "stats", "--path", "c.json", "--json"]);
        let Commands::Cache(CacheArgs {
            command: CacheSubcommand::Stats(args),
        }) = cli.command
        else {
            panic!("expected cache stats command");
        };
        assert_eq!(args.path, PathBuf::from("c.json"));
        assert!(args.json);
        assert_eq!(cli.log_level, "info");
    }
}
