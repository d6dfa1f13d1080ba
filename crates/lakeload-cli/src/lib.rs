//! Lakeload CLI Library
//!
//! Argument parsing and wiring for the `lakeload` binary: resolve the
//! configuration, build the S3 store, pool, embedder and component chain,
//! then run the orchestrator once. `--check` only tests connectivity.

use clap::Parser;
use lakeload_common::logging::{LogConfig, LogLevel};
use lakeload_pipeline::components::default_chain;
use lakeload_pipeline::config::PipelineConfig;
use lakeload_pipeline::db::{create_lazy_pool, create_pool, Gateway};
use lakeload_pipeline::discovery::StorageDiscovery;
use lakeload_pipeline::embedding::build_embedder;
use lakeload_pipeline::preflight::{self, CheckItem, CheckReport};
use lakeload_pipeline::storage::S3ObjectStore;
use lakeload_pipeline::{Orchestrator, RunContext, RunOptions, RunResult};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
/// Conventional exit status after SIGINT
pub const EXIT_CANCELLED: i32 = 130;

/// Load dated parquet batches from S3 into Postgres with embeddings and search
#[derive(Parser, Debug)]
#[command(name = "lakeload")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Process this date folder (e.g. 2025-04-14-09) instead of the latest
    #[arg(long, env = "LAKELOAD_DATE_FOLDER")]
    pub date_folder: Option<String>,

    /// Only process this entity (table or folder name)
    #[arg(long = "entity", env = "LAKELOAD_ENTITY")]
    pub entity: Option<String>,

    /// Leave out the embedding stage
    #[arg(long)]
    pub skip_embeddings: bool,

    /// Discover and plan, but write nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Write the run report as JSON to this path
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Debug logging
    #[arg(long)]
    pub debug: bool,

    /// TOML configuration file
    #[arg(short, long, env = "LAKELOAD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Recompute embeddings and search vectors even when current
    #[arg(long)]
    pub force: bool,

    /// Bucket holding the batches (overrides S3_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Prefix inside the bucket that holds the date folders
    #[arg(long)]
    pub root_prefix: Option<String>,

    /// Entities processed at once
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Test the bucket, the database and pgvector, then exit without loading
    #[arg(long, conflicts_with_all = ["dry_run", "force", "skip_embeddings"])]
    pub check: bool,
}

impl Cli {
    /// Logging settings: `LOG_*` variables, with `--debug` taking precedence
    pub fn log_config(&self) -> anyhow::Result<LogConfig> {
        let mut config = LogConfig::builder()
            .log_file_prefix("lakeload")
            .build()
            .merge_env()?;
        if self.debug {
            config.level = LogLevel::Debug;
        }
        Ok(config)
    }

    /// Flags win over file and environment settings
    pub fn apply_overrides(&self, config: &mut PipelineConfig) {
        if let Some(bucket) = &self.bucket {
            config.storage.bucket = bucket.clone();
        }
        if let Some(prefix) = &self.root_prefix {
            config.discovery.root_prefix = prefix.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.run.concurrency = concurrency;
        }
    }

    pub fn run_options(&self, config: &PipelineConfig) -> RunOptions {
        RunOptions {
            date_folder: self.date_folder.clone(),
            entity_filter: self.entity.clone(),
            skip_embeddings: self.skip_embeddings,
            dry_run: self.dry_run,
            output_path: self.output.clone(),
            debug: self.debug,
            force: self.force,
            concurrency: config.run.concurrency,
        }
    }
}

pub fn exit_code(result: &RunResult) -> i32 {
    if result.cancelled {
        EXIT_CANCELLED
    } else if result.is_success() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    }
}

pub fn check_exit_code(report: &CheckReport) -> i32 {
    if report.passed() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    }
}

/// Resolve configuration and test every connection a run needs
pub async fn check(cli: &Cli, cancel: CancellationToken) -> anyhow::Result<CheckReport> {
    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    config.validate(false)?;

    let mut report = CheckReport::default();

    let store = Arc::new(S3ObjectStore::new(&config.storage).await);
    let discovery = StorageDiscovery::new(store, config.discovery.clone(), config.retry.clone())?;
    report.push(preflight::check_storage(&discovery, &cancel).await);

    match create_pool(&config.database).await {
        Ok(pool) => {
            let gateway = Gateway::new(pool, config.retry.clone(), config.database.bulk_batch_rows);
            let ctx = RunContext::new(cancel);
            for item in preflight::check_database(&gateway, &ctx).await {
                report.push(item);
            }
        },
        Err(e) => report.push(CheckItem::fail(preflight::DATABASE_CHECK, e.to_string())),
    }

    Ok(report)
}

/// Resolve configuration, wire the pipeline and run it once
pub async fn execute(cli: &Cli, cancel: CancellationToken) -> anyhow::Result<RunResult> {
    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    config.validate(cli.dry_run)?;

    let store = Arc::new(S3ObjectStore::new(&config.storage).await);
    let discovery = Arc::new(StorageDiscovery::new(
        store,
        config.discovery.clone(),
        config.retry.clone(),
    )?);

    let pool = if cli.dry_run {
        create_lazy_pool(&config.database)?
    } else {
        create_pool(&config.database).await?
    };
    let gateway = Arc::new(Gateway::new(
        pool,
        config.retry.clone(),
        config.database.bulk_batch_rows,
    ));
    let embedder = build_embedder(&config.embedding, &config.retry)?;
    info!(
        "Embedding with {} ({} dims)",
        embedder.model(),
        embedder.dimension()
    );

    let chain = default_chain(&config, discovery.clone(), gateway, embedder);
    let options = cli.run_options(&config);

    Ok(Orchestrator::new(discovery, chain).run(&options, cancel).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakeload_pipeline::RunStatus;
    use uuid::Uuid;

    #[test]
    fn test_flags_map_to_run_options() {
        let cli = Cli::try_parse_from([
            "lakeload",
            "--date-folder",
            "2025-04-14-09",
            "--entity",
            "product",
            "--skip-embeddings",
            "--dry-run",
            "--output",
            "out/run.json",
            "--concurrency",
            "4",
            "--bucket",
            "exports",
        ])
        .unwrap();

        let mut config = PipelineConfig::default();
        cli.apply_overrides(&mut config);
        let options = cli.run_options(&config);

        assert_eq!(config.storage.bucket, "exports");
        assert_eq!(options.date_folder.as_deref(), Some("2025-04-14-09"));
        assert_eq!(options.entity_filter.as_deref(), Some("product"));
        assert!(options.skip_embeddings);
        assert!(options.dry_run);
        assert!(!options.force);
        assert_eq!(options.concurrency, 4);
        assert_eq!(options.output_path, Some(PathBuf::from("out/run.json")));
    }

    #[test]
    fn test_check_flag_parses_and_excludes_run_flags() {
        let cli = Cli::try_parse_from(["lakeload", "--check", "--bucket", "exports"]).unwrap();
        assert!(cli.check);
        assert!(!cli.dry_run);

        assert!(Cli::try_parse_from(["lakeload", "--check", "--dry-run"]).is_err());
    }

    #[test]
    fn test_check_exit_codes() {
        let mut report = CheckReport::default();
        report.push(CheckItem::warn(preflight::PGVECTOR_CHECK, "extension not available"));
        assert_eq!(check_exit_code(&report), EXIT_SUCCESS);

        report.push(CheckItem::fail(preflight::DATABASE_CHECK, "connection refused"));
        assert_eq!(check_exit_code(&report), EXIT_FAILURE);
    }

    #[test]
    fn test_debug_raises_log_level() {
        let cli = Cli::try_parse_from(["lakeload", "--debug"]).unwrap();
        assert_eq!(cli.log_config().unwrap().level, LogLevel::Debug);
    }

    #[test]
    fn test_exit_codes() {
        let mut result = RunResult::new(Uuid::new_v4(), false);
        assert_eq!(exit_code(&result), EXIT_FAILURE);

        result.overall_status = RunStatus::Success;
        assert_eq!(exit_code(&result), EXIT_SUCCESS);

        result.cancelled = true;
        assert_eq!(exit_code(&result), EXIT_CANCELLED);
    }
}
