use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use reconcile_core::models::{ReferenceDate, TaskCategory};

#[derive(Parser)]
#[command(name = "reconcile")]
#[command(version, about = "Runs reconciliation tasks and tracks their status", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the JSON config file
    #[arg(long, global = true, default_value = "reconcile.json", env = "RECONCILE_CONFIG")]
    pub config: PathBuf,

    /// Reference date handed to each task (YYYY-MM-DD)
    #[arg(long, global = true, value_parser = parse_reference_date)]
    pub date: Option<ReferenceDate>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run every discovered task
    RunAll,

    /// Run the tasks of one category
    RunCategory {
        #[arg(value_enum)]
        category: CategoryArg,
    },

    /// Run the named tasks
    Run {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Show current task statuses, statistics and alerts
    Status,

    /// Write the consolidated report file
    Report,

    /// List discovered tasks
    List,

    /// Show recent execution history
    History {
        /// Only this task
        #[arg(long)]
        task: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Delete history older than the retention window
    Purge {
        /// Overrides `retention_days` from the config
        #[arg(long)]
        days: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum CategoryArg {
    Revenue,
    Tax,
    Other,
}

impl From<CategoryArg> for TaskCategory {
    fn from(arg: CategoryArg) -> Self {
        match arg {
            CategoryArg::Revenue => TaskCategory::Revenue,
            CategoryArg::Tax => TaskCategory::Tax,
            CategoryArg::Other => TaskCategory::Other,
        }
    }
}

fn parse_reference_date(raw: &str) -> Result<ReferenceDate, String> {
    raw.parse()
        .map_err(|_| format!("'{raw}' is not a date in YYYY-MM-DD form"))
}
