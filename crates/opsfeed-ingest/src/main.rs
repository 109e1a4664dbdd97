//! Opsfeed Ingest - run one ingestion job

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use opsfeed_common::logging::{init_logging, LogConfig, LogLevel};
use opsfeed_ingest::config::IngestConfig;
use opsfeed_ingest::framework::{BatchSink, DedupLedger, JobDriver, LogSink, MemoryLedger, PgLedger, PgSink};
use opsfeed_ingest::jobs::{build_job, JobKind};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "opsfeed-ingest")]
#[command(author, version, about = "Idempotent batch ingestion jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one job to completion
    Run {
        /// Job name (see `list`)
        job: String,

        /// Log rows instead of writing them; the ledger is kept in memory
        #[arg(long)]
        dry_run: bool,
    },

    /// List available jobs
    List,

    /// Create the processed-marks table if it does not exist
    InitLedger,
}

async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .context("Failed to connect to database")
}

async fn run(kind: JobKind, dry_run: bool, config: &IngestConfig) -> Result<()> {
    let job = build_job(kind, config).await?;

    let (ledger, sink): (Arc<dyn DedupLedger>, Arc<dyn BatchSink>) = if dry_run {
        warn!("Dry run: rows are logged and nothing is marked processed");
        (Arc::new(MemoryLedger::new(kind.name())), Arc::new(LogSink::new()))
    } else {
        let pool = connect(config.require_database_url()?, config.db_max_connections).await?;
        let ledger_pool = match &config.ledger_database_url {
            Some(url) if config.database_url.as_ref() != Some(url) => {
                connect(url, config.db_max_connections).await?
            },
            _ => pool.clone(),
        };
        PgLedger::ensure_schema(&ledger_pool).await?;
        (Arc::new(PgLedger::new(ledger_pool, kind.name())), Arc::new(PgSink::new(pool)))
    };

    let mut driver = JobDriver::new(ledger, sink, config.tz()?);
    let summary = driver.run(job.as_ref()).await?;
    info!(summary = %serde_json::to_string(&summary)?, "Job summary");

    if !summary.is_success() {
        bail!("{} failed: {} unit(s) not processed", kind, summary.units_failed);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("opsfeed-ingest")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    match cli.command {
        Command::List => {
            for kind in JobKind::ALL {
                println!("{:<24} {}", kind.name(), kind.description());
            }
        },
        Command::InitLedger => {
            let config = IngestConfig::from_env()?;
            let url = config
                .ledger_database_url
                .as_deref()
                .context("OPSFEED_LEDGER_DATABASE_URL or OPSFEED_DATABASE_URL must be set")?;
            let pool = connect(url, 1).await?;
            PgLedger::ensure_schema(&pool).await?;
            info!("Ledger table ready");
        },
        Command::Run { job, dry_run } => {
            let kind: JobKind = job.parse()?;
            let config = IngestConfig::from_env()?;
            info!(job = %kind, dry_run, "Starting job");
            run(kind, dry_run, &config).await?;
            info!(job = %kind, "Job complete");
        },
    }

    Ok(())
}
