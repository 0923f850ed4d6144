//! Quake Ingest - earthquake event ingestion tool

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quake_common::logging::{init_logging, LogConfig, LogLevel};
use quake_ingest::config::IngestConfig;
use quake_ingest::pipeline::Pipeline;
use quake_ingest::source::LocalDirSource;
use quake_ingest::storage::EventStore;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "quake-ingest")]
#[command(author, version, about = "Earthquake event ingestion tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Mount point holding the namespaces
    #[arg(long, global = true, env = "QUAKE_INPUT_ROOT")]
    input_root: Option<PathBuf>,

    /// Namespace whose bronze/earthquake_vol directory is ingested
    #[arg(short, long, global = true, env = "QUAKE_NAMESPACE")]
    namespace: Option<String>,

    /// SQLite database holding the event table and ledger
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll for new files until interrupted
    Run,

    /// Run a single discovery cycle and print its report
    Once,

    /// Show table and ledger totals
    Status,

    /// Print the stored record for an event id
    Show {
        /// Event id
        id: String,
    },
}

impl Cli {
    fn config(&self) -> Result<IngestConfig> {
        let mut config = IngestConfig::from_env();
        if let Some(root) = &self.input_root {
            config.input_root = root.clone();
        }
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(url) = &self.database_url {
            config.database_url = url.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("quake-ingest")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    match &cli.command {
        Command::Run => {
            let pipeline = open_pipeline(&cli).await?;
            let shutdown = CancellationToken::new();
            tokio::spawn(shutdown_signal(shutdown.clone()));

            let summary = pipeline.run(shutdown).await?;
            pipeline.store().close().await;
            info!(
                cycles = summary.cycles,
                files_applied = summary.files_applied,
                documents_rejected = summary.documents_rejected,
                read_failures = summary.read_failures,
                records_emitted = summary.records_emitted,
                records_dropped = summary.records_dropped,
                coercion_warnings = summary.coercion_warnings,
                inserted = summary.merge.inserted,
                updated = summary.merge.updated,
                "Shut down gracefully"
            );
        },
        Command::Once => {
            let pipeline = open_pipeline(&cli).await?;
            let report = pipeline.run_cycle().await?;
            pipeline.store().close().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        },
        Command::Status => {
            let config = cli.config()?;
            let store = EventStore::connect(&config.database_url).await?;
            let ledger = store.ledger();
            let status = json!({
                "input_path": config.input_path(),
                "events": store.count().await?,
                "files_processed": ledger.count().await?,
                "files_rejected": ledger.count_rejected().await?,
                "latest_load_ts": store.latest_load_ts().await?,
                "recent_files": ledger.list(10).await?,
            });
            store.close().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        },
        Command::Show { id } => {
            let config = cli.config()?;
            let store = EventStore::connect(&config.database_url).await?;
            let record = store.get(id).await?;
            store.close().await;
            match record {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => anyhow::bail!("No event with id '{}'", id),
            }
        },
    }

    Ok(())
}

async fn open_pipeline(cli: &Cli) -> Result<Pipeline> {
    let config = cli.config()?;
    let store = EventStore::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    let source = Arc::new(LocalDirSource::new(config.input_path()));

    info!(input = %config.input_path().display(), "Watching landing directory");
    Ok(Pipeline::new(source, store, config).await?)
}

/// Cancel `token` on Ctrl+C or SIGTERM
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown requested; finishing current cycle");
    token.cancel();
}
