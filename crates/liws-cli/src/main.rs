use anyhow::Result;
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use liws_adapters::{builtin_datasets, DatasetShape};
use liws_sync::{SyncConfig, SyncPipeline, SyncRunSummary, SyncWindow};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "liws-cli")]
#[command(about = "Sync LibInsight datasets into the warehouse")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch and reconcile records for a date range (default: current fiscal year to date).
    Sync {
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Dataset key; repeat for several. Defaults to every enabled dataset.
        #[arg(long = "dataset")]
        datasets: Vec<String>,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Create missing warehouse tables.
    Schema {
        #[arg(long = "dataset")]
        datasets: Vec<String>,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
    /// List built-in datasets and whether the registry enables them.
    Datasets,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} window={}..{} datasets={}",
        summary.run_id,
        summary.window.from,
        summary.window.to,
        summary.datasets.len()
    );
    for dataset in &summary.datasets {
        println!(
            "  {}: fetched={} inserted={} updated={} skipped={} failed={}",
            dataset.dataset,
            dataset.fetched,
            dataset.inserted,
            dataset.updated,
            dataset.skipped,
            dataset.failed
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        from: None,
        to: None,
        datasets: Vec::new(),
        json: false,
    }) {
        Commands::Sync {
            from,
            to,
            datasets,
            json,
        } => {
            let window = SyncWindow::resolve(from, to, Local::now().date_naive())?;
            let summary = SyncPipeline::new(config)?.run_once(window, &datasets).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
        }
        Commands::Schema { datasets } => {
            let created = SyncPipeline::new(config)?.ensure_schemas(&datasets).await?;
            for (dataset, tables) in created {
                if tables.is_empty() {
                    println!("{dataset}: up to date");
                } else {
                    println!("{dataset}: created {}", tables.join(", "));
                }
            }
        }
        Commands::Schedule => {
            info!(cron = %config.sync_cron, "starting scheduler");
            liws_sync::run_scheduler_until_shutdown(config).await?;
        }
        Commands::Datasets => {
            let registry = SyncPipeline::new(config)?.load_registry().await?;
            for dataset in builtin_datasets() {
                let shape = match dataset.shape {
                    DatasetShape::Survey(_) => "survey",
                    DatasetShape::Counter(_) => "counter",
                };
                let enabled = registry
                    .entry(dataset.key)
                    .map(|e| e.enabled)
                    .unwrap_or(false);
                println!(
                    "{:<22} {:<8} {:<8} {}",
                    dataset.key,
                    shape,
                    if enabled { "enabled" } else { "disabled" },
                    dataset.display_name
                );
            }
        }
    }

    Ok(())
}
