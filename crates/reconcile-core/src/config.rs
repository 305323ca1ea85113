use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{CoreError, CoreErrorKind};

pub const DEFAULT_MAX_PARALLEL: usize = 3;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_RETENTION_DAYS: u32 = 90;
pub const DEFAULT_STALENESS_SECONDS: u64 = 3600;

/// Orchestrator settings. Built once and handed to the scheduler; nothing
/// here is read from process-wide state.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub task_root: PathBuf,
    pub entry_point: String,
    pub metadata_file: String,
    pub interpreter: Option<PathBuf>,
    pub database_path: PathBuf,
    pub report_dir: PathBuf,
    pub max_parallel: usize,
    pub timeout_seconds: u64,
    pub retention_days: u32,
    pub staleness_seconds: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            task_root: PathBuf::from("tasks"),
            entry_point: "run".to_string(),
            metadata_file: "task.json".to_string(),
            interpreter: None,
            database_path: PathBuf::from("reconcile.sqlite3"),
            report_dir: PathBuf::from("reports"),
            max_parallel: DEFAULT_MAX_PARALLEL,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            retention_days: DEFAULT_RETENTION_DAYS,
            staleness_seconds: DEFAULT_STALENESS_SECONDS,
        }
    }
}

impl OrchestratorConfig {
    /// Reads a JSON config file. A missing file falls back to defaults; a file
    /// that exists but does not parse is rejected.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found; using defaults");
                return Ok(Self::default());
            }
            Err(error) => {
                return Err(CoreError::new(
                    CoreErrorKind::InvalidInput,
                    format!("failed to read config '{}': {error}", path.display()),
                ));
            }
        };

        let config: Self = serde_json::from_str(&raw).map_err(|error| {
            CoreError::new(
                CoreErrorKind::InvalidInput,
                format!("failed to parse config '{}': {error}", path.display()),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.timeout_seconds == 0 {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "timeout_seconds must be greater than zero",
            ));
        }

        if self.entry_point.trim().is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "entry_point must not be empty",
            ));
        }

        Ok(())
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel.max(1)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_seconds)
    }

    pub fn retention(&self) -> time::Duration {
        time::Duration::days(i64::from(self.retention_days))
    }
}
