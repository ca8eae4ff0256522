use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use evac_sync::{connect_store, SyncConfig, SyncPipeline, SyncRunSummary};
use evac_web::AppState;
use tracing::{error, info};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "evac-cli")]
#[command(about = "Evacuation-space sync against an Orion context broker")]
struct Cli {
    /// Append log lines to this file instead of `EVAC_LOG_FILE`.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the input file once and exit.
    Sync {
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Serve `GET /api/getOrionData`.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Serve, and reconcile the input file once in the background.
    Run {
        #[arg(long)]
        csv: Option<PathBuf>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the whole remote collection as JSON.
    Fetch,
}

fn init_tracing(log_file: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("opening log file {}", log_file.display()))?;
    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_timer(timer.clone())
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_timer(timer)
                .with_writer(Arc::new(file)),
        )
        .init();
    Ok(())
}

fn log_summary(summary: &SyncRunSummary) {
    info!(
        run_id = %summary.run_id,
        rows = summary.rows,
        created = summary.created,
        subscription = summary.subscription_registered,
        source = %summary.source_path,
        "sync complete"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(log_file) = cli.log_file {
        config.log_file = log_file;
    }
    init_tracing(&config.log_file)?;

    match cli.command.unwrap_or(Commands::Run { csv: None, port: None }) {
        Commands::Sync { csv } => {
            if let Some(csv) = csv {
                config.csv_path = csv;
            }
            let summary = SyncPipeline::new(config)?.run_once().await?;
            log_summary(&summary);
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.web_port);
            evac_web::serve(AppState::from_config(&config)?, port).await?;
        }
        Commands::Run { csv, port } => {
            if let Some(csv) = csv {
                config.csv_path = csv;
            }
            let port = port.unwrap_or(config.web_port);
            let state = AppState::from_config(&config)?;
            let pipeline = SyncPipeline::with_store(config, state.store.clone());
            tokio::spawn(async move {
                match pipeline.run_once().await {
                    Ok(summary) => log_summary(&summary),
                    Err(err) => error!(error = %format!("{err:#}"), "error during conversion or send"),
                }
            });
            evac_web::serve(state, port).await?;
        }
        Commands::Fetch => {
            let store = connect_store(&config)?;
            let all = config.fetcher().fetch_all(store.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&all)?);
        }
    }

    Ok(())
}
