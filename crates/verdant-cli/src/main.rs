use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use verdant_ingest::{build_orchestrator, IngestConfig, RunOutcome, Scheduler, SyntheticMode};
use verdant_store::MemoryStore;

#[derive(Debug, Parser)]
#[command(name = "verdant")]
#[command(about = "Sustainability metrics ingestion service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass and exit.
    Ingest,
    /// Run the interval scheduler until interrupted.
    Run,
    /// Persist generator output without calling the providers.
    Seed {
        /// Cover the full configured year range instead of the recent trend.
        #[arg(long)]
        backfill: bool,
    },
    /// Refresh one year from the per-indicator provider.
    Refresh {
        #[arg(long)]
        year: i32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();
    // The dashboard deployment provides the real document store; the memory
    // backend keeps the CLI self-contained.
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Arc::new(build_orchestrator(config, store)?);

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let report = orchestrator.run_once().await?;
            let outcome = match &report.outcome {
                RunOutcome::SkippedFresh => "skipped (store fresh)".to_string(),
                RunOutcome::Completed => "completed".to_string(),
                RunOutcome::FellBack { error } => format!("fell back to synthetic ({error})"),
            };
            println!(
                "ingest {}: run_id={} emissions={} energy={} rejected={} failures={}",
                outcome,
                report.run_id,
                report.emissions_written,
                report.energy_written,
                report.emission_rows_rejected,
                report.upsert_failures
            );
        }
        Commands::Run => {
            let interval = orchestrator.config().refresh_interval();
            let scheduler = Scheduler::new(orchestrator, interval);
            scheduler.start();
            tokio::signal::ctrl_c().await?;
            scheduler.shutdown().await;
            let status = scheduler.status();
            println!(
                "scheduler stopped: runs_started={} ticks_skipped={}",
                status.runs_started, status.ticks_skipped
            );
        }
        Commands::Seed { backfill } => {
            let mode = if backfill {
                SyntheticMode::FullBackfill
            } else {
                SyntheticMode::TrendSnapshot
            };
            let report = orchestrator.seed_synthetic(mode).await?;
            println!(
                "seed complete: emissions={} energy={} failures={}",
                report.emissions.written,
                report.energy.written,
                report.emissions.failed + report.energy.failed
            );
        }
        Commands::Refresh { year } => {
            let report = orchestrator.refresh_year_from_world_bank(year).await?;
            println!(
                "refresh {year} complete: emissions={} energy={}",
                report.emissions.written, report.energy.written
            );
        }
    }

    Ok(())
}
