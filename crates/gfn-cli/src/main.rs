use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gfn_sync::{Destination, RunOptions, SyncError};
use tracing::error;

#[derive(Debug, Parser)]
#[command(name = "gfn-cli")]
#[command(about = "Ecological footprint pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract, reconcile and summarize a period range.
    Run {
        #[arg(long)]
        start_period: Option<i32>,
        #[arg(long)]
        end_period: Option<i32>,
        /// Supersede every row previously loaded for the range.
        #[arg(long)]
        full_refresh: bool,
        /// memory or sqlite; defaults to PIPELINE_DESTINATION.
        #[arg(long, value_parser = parse_destination)]
        destination: Option<Destination>,
        /// Exit non-zero when some periods failed extraction.
        #[arg(long)]
        fail_on_partial: bool,
    },
    Migrate,
    /// Print a digest of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn parse_destination(raw: &str) -> Result<Destination, String> {
    Destination::parse(raw).map_err(|err| err.to_string())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        start_period: None,
        end_period: None,
        full_refresh: false,
        destination: None,
        fail_on_partial: false,
    });

    match command {
        Commands::Run {
            start_period,
            end_period,
            full_refresh,
            destination,
            fail_on_partial,
        } => {
            let options = RunOptions {
                start_period,
                end_period,
                full_refresh,
                destination,
            };
            let summary = match gfn_sync::run_from_env(options).await {
                Ok(summary) => summary,
                Err(SyncError::ExtractionFailed { start, end, failures }) => {
                    for failure in &failures {
                        error!(period = failure.period, error = %failure.error, "extraction failed");
                    }
                    eprintln!("extraction failed for every period in {start}..={end}");
                    return Ok(ExitCode::FAILURE);
                }
                Err(SyncError::ValidationFailed(report)) => {
                    for check in &report.failed_checks {
                        eprintln!("quality check failed: {check}");
                    }
                    return Ok(ExitCode::FAILURE);
                }
                Err(other) => return Err(other.into()),
            };

            let backfill = &summary.backfill;
            println!(
                "run complete: run_id={} status={} inserted={} updated={} skipped={} dropped={} summaries={} reports={}",
                summary.run_id,
                summary.status,
                backfill.counts.inserted,
                backfill.counts.updated,
                backfill.counts.skipped,
                backfill.dropped,
                backfill.summaries_written,
                summary.reports_dir
            );
            if backfill.is_partial() {
                for (start, end) in backfill.retry_ranges() {
                    println!("retry: --start-period {start} --end-period {end}");
                }
                if fail_on_partial {
                    return Ok(ExitCode::from(2));
                }
            }
        }
        Commands::Migrate => {
            let path = gfn_sync::migrate_from_env().await?;
            println!("schema applied: {}", path.display());
        }
        Commands::Report { runs } => {
            println!("{}", gfn_sync::report_from_env(runs)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
