//! Keeper - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keeper_common::logging::{init_logging, LogConfig, LogLevel};
use std::{path::PathBuf, sync::Arc};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use keeper_server::{
    config::Config,
    ids::ListIdGenerator,
    ingest::{Pipeline, PipelineReport},
    schema::SchemaRegistry,
    storage::{FsStagingStore, PgStorage, Storage},
};

#[derive(Parser, Debug)]
#[command(name = "keeper", version, about = "Component list ingestion service")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Database connection string
    #[arg(long, global = true, env = "KEEPER_DSN")]
    database_url: Option<String>,

    /// Directory for staged upload payloads
    #[arg(short = 'q', long, global = true, env = "KEEPER_STAGING_ROOT")]
    staging_root: Option<PathBuf>,

    /// Seconds without new tuples before a partial batch is written
    #[arg(short = 'w', long, global = true)]
    max_wait: Option<u64>,

    /// Batch length that triggers a write once exceeded
    #[arg(short = 'b', long, global = true)]
    max_buffer_length: Option<usize>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline until Ctrl+C or SIGTERM
    Serve,

    /// Push one local file through the pipeline and wait for it to be stored
    Ingest {
        /// Target list id
        #[arg(short, long)]
        list: String,

        /// Payload format: csv or json
        #[arg(short, long, default_value = "csv")]
        format: String,

        file: PathBuf,
    },
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(ref url) = self.database_url {
            config.storage.database_url = url.clone();
        }
        if let Some(ref root) = self.staging_root {
            config.staging.root = root.clone();
        }
        if let Some(max_wait) = self.max_wait {
            config.writer.max_wait_secs = max_wait;
        }
        if let Some(length) = self.max_buffer_length {
            config.writer.max_buffer_length = length;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .log_file_prefix("keeper")
        .filter_directives("sqlx=warn")
        .build()
        .merge_env()?;
    let _guard = init_logging(&log_config)?;

    let mut config = Config::load()?;
    cli.apply(&mut config);
    config.validate()?;
    info!(staging = %config.staging.root.display(), "Configuration loaded");

    let storage = Arc::new(
        PgStorage::connect(&config.storage)
            .await
            .context("Failed to open component storage")?,
    );
    let schema = Arc::new(SchemaRegistry::new());
    schema
        .init(storage.as_ref())
        .await
        .context("Failed to load list schemas")?;

    let storage: Arc<dyn Storage> = storage;
    let pipeline = Pipeline::start(
        &config,
        storage,
        Arc::new(FsStagingStore::new(&config.staging.root)),
        schema,
        ListIdGenerator::from_entropy(),
        CancellationToken::new(),
    );

    let report = match cli.command {
        Command::Serve => {
            info!("Keeper running");
            shutdown_signal().await;
            pipeline.shutdown().await?
        }
        Command::Ingest { list, format, file } => {
            let payload = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let name = pipeline.upload(&list, &format, &payload).await?;
            info!(list_id = %list, name = %name, bytes = payload.len(), "Upload queued");
            pipeline.drain().await?
        }
    };

    log_report(&report);
    Ok(())
}

fn log_report(report: &PipelineReport) {
    info!(
        tasks_completed = report.dispatch.completed,
        tasks_abandoned = report.dispatch.abandoned,
        records_normalized = report.analyzer.normalized,
        records_failed = report.analyzer.failures.len(),
        rows_written = report.writer.rows_written,
        rows_dropped = report.writer.rows_dropped,
        "Keeper stopped"
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
