use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use redi_storage::{MemoryRecordStore, RecordStore};
use redi_sync::{BatchProcessor, CacheInvalidator, CacheKeyRegistry, IngestConfig, IngestPipeline};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "redi")]
#[command(about = "Rural employment data ingest")]
struct Cli {
    /// Keep records in memory instead of Postgres (local trial runs).
    #[arg(long, global = true)]
    memory_store: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, upsert, snapshot and invalidate once.
    Run {
        /// Print the full run report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Stay up and run on the cron schedule and/or the work queue.
    Daemon {
        /// Trigger one run immediately after start-up.
        #[arg(long)]
        run_now: bool,
    },
    /// Load a delimited file through the same upsert path.
    Import {
        path: PathBuf,
        #[arg(long, default_value = ",")]
        delimiter: char,
    },
    /// Apply database migrations.
    Migrate,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn record_store(cli: &Cli, config: &IngestConfig) -> Result<Arc<dyn RecordStore>> {
    if cli.memory_store {
        info!("using in-memory record store; nothing will be persisted");
        return Ok(Arc::new(MemoryRecordStore::new()));
    }
    Ok(Arc::new(redi_sync::connect_store(config).await?))
}

async fn pipeline(cli: &Cli, config: &IngestConfig) -> Result<IngestPipeline> {
    let source = Arc::new(redi_sync::build_http_source(config)?);
    let store = record_store(cli, config).await?;
    let cache = redi_sync::connect_cache(config).await;
    redi_sync::assemble_pipeline(config, source, store, cache)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    debug!(
        components = ?[
            redi_core::CRATE_NAME,
            redi_adapters::CRATE_NAME,
            redi_storage::CRATE_NAME,
            redi_sync::CRATE_NAME,
        ],
        "redi starting"
    );
    let config = IngestConfig::from_env().context("loading configuration")?;

    match cli.command.as_ref().unwrap_or(&Commands::Run { json: false }) {
        Commands::Run { json } => {
            let report = pipeline(&cli, &config).await?.run_once().await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let s = &report.summary;
                println!(
                    "run complete: run_id={} records={} processed={} changed={} entities={} skipped={} failed={}",
                    report.run_id,
                    report.total_records,
                    s.total_processed,
                    s.total_changed,
                    s.distinct_entities_changed(),
                    s.skipped,
                    s.failed
                );
            }
        }
        Commands::Daemon { run_now } => {
            let pipeline = Arc::new(pipeline(&cli, &config).await?);
            redi_sync::run_daemon(&config, pipeline, *run_now).await?;
        }
        Commands::Import { path, delimiter } => {
            if !delimiter.is_ascii() {
                bail!("delimiter must be a single ASCII character");
            }
            let store = record_store(&cli, &config).await?;
            let cache = redi_sync::connect_cache(&config).await;
            let processor =
                BatchProcessor::new(Arc::new(redi_sync::build_normalizer(&config)?), store);
            let invalidator = CacheInvalidator::new(
                cache,
                CacheKeyRegistry::new(config.history_windows.clone()),
            );
            let report = redi_sync::import_delimited(
                path,
                *delimiter as u8,
                &processor,
                &invalidator,
                &config.batch_options(),
            )
            .await?;
            let s = &report.summary;
            println!(
                "import complete: path={} rows={} inserted={} updated={} unchanged={} skipped={} failed={}",
                report.path,
                report.total_records,
                s.inserted,
                s.updated,
                s.unchanged,
                s.skipped,
                s.failed
            );
        }
        Commands::Migrate => {
            if cli.memory_store {
                bail!("--memory-store has no schema to migrate");
            }
            let store = redi_sync::connect_store(&config).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
