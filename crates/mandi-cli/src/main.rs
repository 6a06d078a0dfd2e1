use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use mandi_storage::PgWarehouse;
use mandi_sync::{BatchStatus, IngestConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mandi-cli")]
#[command(about = "Mandi price warehouse ETL")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one batch file per calendar date, inclusive on both ends.
    Ingest {
        /// First date (YYYY-MM-DD).
        #[arg(long)]
        from: NaiveDate,
        /// Last date (YYYY-MM-DD); defaults to `from`.
        #[arg(long)]
        to: Option<NaiveDate>,
        #[arg(long)]
        input_dir: Option<PathBuf>,
        /// Run against an in-memory warehouse; nothing is written to the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply warehouse migrations.
    Migrate,
    /// Run the cron scheduler until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = IngestConfig::from_env();

    match cli.command {
        Commands::Ingest {
            from,
            to,
            input_dir,
            dry_run,
        } => {
            let to = to.unwrap_or(from);
            if to < from {
                bail!("--to ({to}) is before --from ({from})");
            }
            if let Some(dir) = input_dir {
                config.input_dir = dir;
            }
            config.dry_run = dry_run;

            let runner = mandi_sync::build_runner(config).await?;
            let summary = runner.run_range(from, to).await?;
            println!(
                "ingest complete: run_id={} ingested={} missing={} failed={} facts={} reports={}",
                summary.run_id,
                summary.count(|s| matches!(s, BatchStatus::Ingested)),
                summary.count(|s| matches!(s, BatchStatus::Missing)),
                summary.count(|s| matches!(s, BatchStatus::Failed { .. })),
                summary.facts_appended,
                summary.reports_dir
            );
        }
        Commands::Migrate => {
            let warehouse = PgWarehouse::connect(&config.database_url, config.db_max_connections)
                .await
                .context("connecting to warehouse")?;
            warehouse.migrate().await.context("migrating warehouse")?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let runner = Arc::new(mandi_sync::build_runner(config).await?);
            let Some(mut sched) = mandi_sync::maybe_build_scheduler(runner).await? else {
                bail!("scheduler disabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
