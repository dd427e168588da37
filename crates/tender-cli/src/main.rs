use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tender_reconcile::{maybe_build_dedup_scheduler, report_recent_runs, EngineConfig, Reconciler};
use tender_storage::PgEntityStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tender-cli")]
#[command(about = "Reconcile spreadsheet tender exports into the tender database")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile one export (.csv, .xlsx, .ods or .json) into the store.
    Reconcile {
        input: PathBuf,
        /// Compute and report changes without writing them.
        #[arg(long)]
        dry_run: bool,
        /// Skip the assignment dedup pass after the rows.
        #[arg(long)]
        no_dedup: bool,
        /// Apply the first hit of ambiguous matches.
        #[arg(long)]
        apply_ambiguous: bool,
        /// Worksheet to read; defaults to the first sheet.
        #[arg(long)]
        sheet: Option<String>,
    },
    /// Run the employee-assignment dedup pass over all tenders.
    Dedup {
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Run the dedup pass on DEDUP_CRON until interrupted.
    Schedule,
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

async fn connect(config: &EngineConfig) -> Result<PgEntityStore> {
    PgEntityStore::connect(&config.database_url, config.pseudonyms.clone())
        .await
        .context("connecting to tender database")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = EngineConfig::from_env();

    match cli.command {
        Commands::Reconcile {
            input,
            dry_run,
            no_dedup,
            apply_ambiguous,
            sheet,
        } => {
            config.dry_run |= dry_run;
            config.dedup_after_run &= !no_dedup;
            config.apply_ambiguous_matches |= apply_ambiguous;
            let store = connect(&config).await?;
            let reconciler = Reconciler::new(Arc::new(store), config);
            let run = reconciler.reconcile_input(&input, sheet.as_deref()).await?;
            let c = &run.report.counters;
            println!(
                "reconcile complete: run_id={} rows={} matched={} updated={} unchanged={} unmatched={} ambiguous={} errored={} conflicts={} report={}",
                run.report.run_id,
                c.rows_seen,
                c.matched,
                c.updated,
                c.no_op,
                c.unmatched,
                c.ambiguous,
                c.errored,
                c.conflicts,
                run.written.reports_dir.display()
            );
        }
        Commands::Dedup { dry_run } => {
            config.dry_run |= dry_run;
            let store = connect(&config).await?;
            let summary = Reconciler::new(Arc::new(store), config)
                .run_dedup_pass()
                .await?;
            println!(
                "dedup complete: tenders={} duplicate_groups={} deleted={} relabeled={} failed={}",
                summary.tenders_scanned,
                summary.duplicate_groups,
                summary.assignments_deleted,
                summary.assignments_relabeled,
                summary.failures.len()
            );
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let store = connect(&config).await?;
            let reconciler = Arc::new(Reconciler::new(Arc::new(store), config));
            let Some(mut sched) = maybe_build_dedup_scheduler(reconciler).await? else {
                bail!("scheduler disabled; set TENDER_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("dedup scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_runs(runs, Some(config.workspace_root))?);
        }
    }

    Ok(())
}
