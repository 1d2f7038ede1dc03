use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cpls_core::RunStatus;
use cpls_sync::{maybe_build_scheduler, run_director_explode, JobPipeline, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cpls-cli")]
#[command(about = "Care provider lead sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download both exports and reconcile them against the remote store.
    Run,
    /// Download both exports without syncing.
    Fetch,
    /// Explode enriched director names into per-director records.
    ExplodeDirectors,
    /// Serve the trigger + file-download endpoints.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = cpls_sync::run_job_once_from_env().await?;
            println!(
                "run complete: run_id={} status={} parsed={} kept={} created={} updated={}",
                summary.run_id,
                summary.status.as_str(),
                summary.rows_parsed,
                summary.enrichment.kept,
                summary.reconcile.created,
                summary.reconcile.updated,
            );
            if summary.status != RunStatus::Ok {
                std::process::exit(1);
            }
        }
        Commands::Fetch => {
            let pipeline = JobPipeline::new(SyncConfig::from_env())?;
            let reports = pipeline.run_downloads().await?;
            for report in &reports {
                println!(
                    "{}: ok={} bytes={} lines={} file={} error={}",
                    report.source_id,
                    report.ok,
                    report.bytes,
                    report.lines,
                    report.file.as_deref().unwrap_or("-"),
                    report.error.as_deref().unwrap_or("-"),
                );
            }
            if reports.iter().any(|report| !report.ok) {
                std::process::exit(1);
            }
        }
        Commands::ExplodeDirectors => {
            let pipeline = JobPipeline::new(SyncConfig::from_env())?;
            let outcome = run_director_explode(&pipeline.record_store()).await?;
            println!(
                "explode complete: leads={} skipped_no_provider_id={} names={} created={} skipped_existing={}",
                outcome.leads_processed,
                outcome.leads_skipped_no_provider_id,
                outcome.names_parsed,
                outcome.created,
                outcome.skipped_existing,
            );
        }
        Commands::Serve => {
            let config = SyncConfig::from_env();
            if let Some(sched) = maybe_build_scheduler(&config).await? {
                sched.start().await.context("starting scheduler")?;
            }
            cpls_web::serve(config).await?;
        }
    }

    Ok(())
}
