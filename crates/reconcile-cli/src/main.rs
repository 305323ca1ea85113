mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use reconcile_core::config::OrchestratorConfig;
use reconcile_core::dashboard::{Dashboard, DashboardSnapshot, write_run_report};
use reconcile_core::execution::TokioProcessExecutor;
use reconcile_core::models::{
    ConsolidatedRun, CoreError, CoreErrorKind, DateRange, RunExitStatus, SelectedOutcome,
};
use reconcile_core::orchestration::Scheduler;
use reconcile_core::persistence::{ExecutionStore, ReconcileStore};
use reconcile_core::registry::TaskRegistry;
use reconcile_core::sqlite::SqliteStore;

use crate::cli::{Cli, Commands};

const CONTROL_PLANE_FAILURE: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging();

    match run(cli).await {
        Ok(status) => ExitCode::from(status.code()),
        Err(error) => {
            eprintln!("error: {}", error.message);
            ExitCode::from(CONTROL_PLANE_FAILURE)
        }
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reconcile=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<RunExitStatus, CoreError> {
    let config = OrchestratorConfig::load(&cli.config)?;
    let output = Output { json: cli.json };

    match cli.command {
        Commands::List => {
            let tasks = TaskRegistry::from_config(&config).discover();
            if output.json {
                output.print_json(&tasks)?;
            } else {
                for task in &tasks {
                    println!(
                        "{:<32} {:<8} {:<8} {}",
                        task.name,
                        task.category.as_str(),
                        task.criticality.as_str(),
                        task.working_dir.display()
                    );
                }
            }
            Ok(if tasks.is_empty() {
                RunExitStatus::NothingToDo
            } else {
                RunExitStatus::Success
            })
        }
        Commands::RunAll => {
            let scheduler = open_scheduler(&config)?;
            let run = scheduler.run_all(cli.date).await?;
            finish_run(&config, &output, &run)
        }
        Commands::RunCategory { category } => {
            let scheduler = open_scheduler(&config)?;
            let run = scheduler.run_category(category.into(), cli.date).await?;
            finish_run(&config, &output, &run)
        }
        Commands::Run { names } => {
            let scheduler = open_scheduler(&config)?;
            let results = scheduler.run_selected(&names, cli.date).await?;
            output.print_selected(&results)?;
            Ok(if results.iter().all(SelectedOutcome::is_success) {
                RunExitStatus::Success
            } else {
                RunExitStatus::TaskFailures
            })
        }
        Commands::Status => {
            let store = open_store(&config)?;
            let snapshot = Dashboard::new(store, config.staleness_threshold())
                .snapshot(DateRange::all())?;
            output.print_snapshot(&snapshot)?;
            Ok(RunExitStatus::Success)
        }
        Commands::Report => {
            let store = open_store(&config)?;
            let path = Dashboard::new(store, config.staleness_threshold())
                .write_report(&config.report_dir)?;
            println!("{}", path.display());
            Ok(RunExitStatus::Success)
        }
        Commands::History { task, limit } => {
            let store = open_store(&config)?;
            let records = store.list_executions(task.as_deref(), limit)?;
            if output.json {
                output.print_json(&records)?;
            } else {
                for record in &records {
                    println!(
                        "{:>6} {:<32} {:<8} {} {:>8.2}s {}",
                        record.id,
                        record.task,
                        record.outcome.as_str(),
                        record.reference_date,
                        record.elapsed_seconds,
                        record.executed_at
                    );
                }
            }
            Ok(RunExitStatus::Success)
        }
        Commands::Purge { days } => {
            let store = open_store(&config)?;
            let retention = days
                .map(|days| time::Duration::days(i64::from(days)))
                .unwrap_or_else(|| config.retention());
            let cutoff = OffsetDateTime::now_utc() - retention;
            let deleted = store.purge_executions_before(cutoff)?;
            tracing::info!(deleted, cutoff = %cutoff, "purged execution history");
            if output.json {
                output.print_json(&serde_json::json!({ "deleted": deleted }))?;
            } else {
                println!("deleted {deleted} execution records");
            }
            Ok(RunExitStatus::Success)
        }
    }
}

fn open_store(config: &OrchestratorConfig) -> Result<Arc<dyn ReconcileStore>, CoreError> {
    let store = SqliteStore::new(&config.database_path);
    store.migrate_to_latest()?;
    Ok(Arc::new(store))
}

fn open_scheduler(config: &OrchestratorConfig) -> Result<Scheduler, CoreError> {
    let store = open_store(config)?;
    let scheduler = Scheduler::new(config, Arc::new(TokioProcessExecutor), store);

    let cancellation = scheduler.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling running tasks");
            cancellation.cancel();
        }
    });

    Ok(scheduler)
}

fn finish_run(
    config: &OrchestratorConfig,
    output: &Output,
    run: &ConsolidatedRun,
) -> Result<RunExitStatus, CoreError> {
    if !run.is_empty() {
        write_run_report(&config.report_dir, run)?;
    }
    output.print_run(run)?;
    Ok(run.exit_status())
}

struct Output {
    json: bool,
}

impl Output {
    fn print_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), CoreError> {
        let body = serde_json::to_string_pretty(value).map_err(|error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("failed to encode output: {error}"),
            )
        })?;
        println!("{body}");
        Ok(())
    }

    fn print_run(&self, run: &ConsolidatedRun) -> Result<(), CoreError> {
        if self.json {
            return self.print_json(run);
        }

        if let Some(note) = &run.note {
            println!("{note}");
        }
        for outcome in &run.outcomes {
            println!(
                "{:<32} {:<8} {:>8.2}s {}",
                outcome.task,
                outcome.kind.as_str(),
                outcome.elapsed_seconds,
                outcome.error.as_deref().unwrap_or("")
            );
        }
        println!(
            "total {} | success {} | error {} | timeout {} | skipped {} | rate {:.1}% | {:.2}s",
            run.total,
            run.succeeded,
            run.failed,
            run.timed_out,
            run.skipped,
            run.success_rate,
            run.elapsed_seconds
        );
        Ok(())
    }

    fn print_selected(&self, results: &[SelectedOutcome]) -> Result<(), CoreError> {
        if self.json {
            return self.print_json(results);
        }

        for result in results {
            match result {
                SelectedOutcome::Executed(outcome) => println!(
                    "{:<32} {:<8} {:>8.2}s {}",
                    outcome.task,
                    outcome.kind.as_str(),
                    outcome.elapsed_seconds,
                    outcome.error.as_deref().unwrap_or("")
                ),
                SelectedOutcome::NotFound { task } => println!("{task:<32} not found"),
                SelectedOutcome::Skipped { task } => println!("{task:<32} skipped"),
            }
        }
        Ok(())
    }

    fn print_snapshot(&self, snapshot: &DashboardSnapshot) -> Result<(), CoreError> {
        if self.json {
            return self.print_json(snapshot);
        }

        let stats = &snapshot.statistics;
        println!(
            "tasks {} | success {} | error {} | timeout {} | running {} | idle {} | rate {:.1}%",
            stats.total,
            stats.success,
            stats.error,
            stats.timeout,
            stats.running,
            stats.idle,
            stats.success_rate
        );
        for (category, statuses) in &snapshot.by_category {
            println!("[{category}]");
            for status in statuses {
                println!(
                    "  {:<30} {:<8} {:>3}% {}",
                    status.task,
                    status.state.as_str(),
                    status.progress,
                    status.message.as_deref().unwrap_or("")
                );
            }
        }
        for alert in &snapshot.alerts {
            println!("alert [{:?}] {}", alert.kind, alert.message);
        }
        Ok(())
    }
}
