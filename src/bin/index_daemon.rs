// src/bin/index_daemon.rs
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use cryptoindex::{
    config::IndexServiceConfig,
    providers::ws::WsTickSource,
    publishing::{LogPublisher, Publisher},
    service::IndexService,
    store::SqliteStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "index_daemon", version, about = "Rebalance, backfill and stream a synthetic crypto index")]
struct Cli {
    /// TOML config; defaults apply when the file is missing
    #[arg(long, default_value = "index.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct IndexArg {
    /// Index identifier, e.g. top20-monthly or top10-weekly-defi
    #[arg(long)]
    index: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every due basket snapshot
    Rebalance(IndexArg),
    /// Backfill missing minute candles for the latest basket
    Synthesize(IndexArg),
    /// Compute funding rewards for snapshots that lack one
    Funding(IndexArg),
    /// Show processing state per job
    Status(IndexArg),
    /// Rebalance, synthesize and funding, once
    Cycle(IndexArg),
    /// Repeat full cycles until Ctrl+C
    Run {
        #[command(flatten)]
        index: IndexArg,
        #[arg(long, default_value_t = 3600)]
        every_secs: u64,
    },
    /// Stream live candles until Ctrl+C
    Live(IndexArg),
}

fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Ctrl+C received");
        let _ = tx.send(true);
    });
    rx
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = IndexServiceConfig::load(&cli.config)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let store = Arc::new(
        SqliteStore::connect(&cfg.database_url, cfg.db_max_connections)
            .await
            .with_context(|| format!("failed to open {}", cfg.database_url))?,
    );
    let sinks: Vec<Arc<dyn Publisher>> = vec![Arc::new(LogPublisher)];
    let live_cfg = cfg.live.clone();
    let service = IndexService::new(cfg, store, sinks);
    service.recover().await?;

    match cli.command {
        Commands::Rebalance(a) => {
            let r = service.rebalance(&a.index).await?;
            tracing::info!(periods = r.periods, written = r.written, skipped = r.skipped, close = r.last_close, "rebalance done");
        }
        Commands::Synthesize(a) => {
            let r = service.synthesize(&a.index).await?;
            tracing::info!(steps = r.steps, persisted = r.persisted, failed = r.failed, close = r.last_close, "synthesis done");
        }
        Commands::Funding(a) => {
            let events = service.funding(&a.index).await?;
            tracing::info!(new = events.len(), "funding done");
        }
        Commands::Status(a) => {
            for (job, state) in service.status(&a.index).await? {
                println!("{:<10} {}", job.as_str(), state);
            }
        }
        Commands::Cycle(a) => {
            let r = service.run_cycle(&a.index).await?;
            tracing::info!(snapshots = r.rebalance.written, candles = r.synthesis.map_or(0, |s| s.persisted), funding = r.funding, "cycle done");
        }
        Commands::Run { index, every_secs } => {
            let mut shutdown = shutdown_on_ctrl_c();
            let mut ticker = tokio::time::interval(Duration::from_secs(every_secs.max(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if let Err(e) = service.run_cycle(&index.index).await {
                    tracing::error!(index_id = %index.index, "cycle failed: {e}");
                }
            }
        }
        Commands::Live(a) => {
            let source = Arc::new(WsTickSource::new(live_cfg.ws_url_template));
            let summary = service.live(&a.index, source, shutdown_on_ctrl_c()).await?;
            tracing::info!(partials = summary.partials, finalized = summary.finalized, abandoned = summary.abandoned, "live done");
        }
    }
    Ok(())
}
