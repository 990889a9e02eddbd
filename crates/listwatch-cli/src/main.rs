use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use listwatch_storage::ListingStore;
use listwatch_sync::{compare_markdown, compare_snapshots, maybe_build_scheduler, SyncConfig};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "listwatch")]
#[command(about = "Daily classifieds snapshot and price-change tracker")]
struct Cli {
    /// Emit JSON log lines instead of human-readable output.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch today's listings, reconcile and write the report.
    Sync,
    /// Compare two stored snapshots without touching the price history.
    Compare {
        #[arg(long)]
        current: NaiveDate,
        #[arg(long)]
        previous: NaiveDate,
    },
    /// Print the recorded price history of one listing.
    History { id: String },
    /// Run the sync on the configured cron schedule until interrupted.
    Schedule,
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = listwatch_sync::run_sync_once(config).await?;
            println!(
                "sync complete: run_id={} date={} ads={} added={} removed={} price_changed={} report={}",
                summary.run_id,
                summary.run_date,
                summary.total_ads,
                summary.added,
                summary.removed,
                summary.price_changed,
                summary.report_path
            );
        }
        Commands::Compare { current, previous } => {
            let store = ListingStore::new(config.data_dir);
            let summary = compare_snapshots(&store, current, previous).await;
            println!("{}", compare_markdown(&summary));
        }
        Commands::History { id } => {
            let store = ListingStore::new(config.data_dir);
            let ledger = store.load_ledger().await;
            let id = id.trim();
            let history = ledger.history(id);
            if history.is_empty() {
                println!("no recorded prices for {id}");
            }
            for obs in history {
                let price = obs
                    .price
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "n/a".to_string());
                println!("{}  {}", obs.date, price);
            }
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let cron = config.sync_cron.clone();
            let Some(mut sched) = maybe_build_scheduler(config).await? else {
                bail!("scheduler could not be built for cron {cron}");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
