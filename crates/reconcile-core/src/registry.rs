use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::config::OrchestratorConfig;
use crate::models::TaskDescriptor;

/// Finds reconciliation tasks under a task root.
///
/// A direct subdirectory is a task when it contains the entry-point file. The
/// optional metadata file next to it supplies category, criticality and a
/// timeout override.
#[derive(Clone, Debug)]
pub struct TaskRegistry {
    root: PathBuf,
    entry_point: String,
    metadata_file: String,
}

#[derive(Debug, Default, Deserialize)]
struct MetadataFile {
    #[serde(default)]
    task: TaskMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct TaskMetadata {
    category: Option<String>,
    criticality: Option<String>,
    timeout_seconds: Option<u64>,
}

impl TaskRegistry {
    pub fn new(
        root: impl Into<PathBuf>,
        entry_point: impl Into<String>,
        metadata_file: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            entry_point: entry_point.into(),
            metadata_file: metadata_file.into(),
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(
            config.task_root.clone(),
            config.entry_point.clone(),
            config.metadata_file.clone(),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lists every task, sorted by name. A missing or unreadable root yields an
    /// empty list, and a task with bad metadata is still listed with defaults.
    pub fn discover(&self) -> Vec<TaskDescriptor> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(
                    root = %self.root.display(),
                    error = %error,
                    "task root is not readable; no tasks discovered"
                );
                return Vec::new();
            }
        };

        let mut tasks: Vec<TaskDescriptor> = entries
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry.path()),
                Err(error) => {
                    tracing::warn!(
                        root = %self.root.display(),
                        error = %error,
                        "skipping unreadable entry"
                    );
                    None
                }
            })
            .filter_map(|path| self.describe(&path))
            .collect();
        tasks.sort_by(|left, right| left.name.cmp(&right.name));

        tracing::info!(root = %self.root.display(), count = tasks.len(), "discovered tasks");
        tasks
    }

    pub fn find(&self, name: &str) -> Option<TaskDescriptor> {
        self.discover().into_iter().find(|task| task.name == name)
    }

    fn describe(&self, dir: &Path) -> Option<TaskDescriptor> {
        if !dir.is_dir() {
            return None;
        }
        let name = dir.file_name()?.to_str()?.to_string();
        if name.starts_with('.') {
            return None;
        }

        // Absolute paths so spawning does not depend on the child's cwd.
        let dir = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        let dir = dir.as_path();
        let entry_point = dir.join(&self.entry_point);
        if !entry_point.is_file() {
            return None;
        }

        let metadata = self.read_metadata(&name, &dir.join(&self.metadata_file));
        let category = parse_or_default(&name, "category", metadata.category.as_deref());
        let criticality = parse_or_default(&name, "criticality", metadata.criticality.as_deref());

        Some(TaskDescriptor {
            name,
            category,
            criticality,
            entry_point,
            working_dir: dir.to_path_buf(),
            timeout_override: metadata
                .timeout_seconds
                .filter(|seconds| *seconds > 0)
                .map(Duration::from_secs),
        })
    }

    fn read_metadata(&self, task: &str, path: &Path) -> TaskMetadata {
        if !path.exists() {
            return TaskMetadata::default();
        }

        let parsed = fs::read_to_string(path)
            .map_err(|error| error.to_string())
            .and_then(|raw| {
                serde_json::from_str::<MetadataFile>(&raw).map_err(|error| error.to_string())
            });

        match parsed {
            Ok(file) => file.task,
            Err(error) => {
                tracing::warn!(
                    task = %task,
                    path = %path.display(),
                    error = %error,
                    "malformed task metadata; using defaults"
                );
                TaskMetadata::default()
            }
        }
    }
}

fn parse_or_default<T>(task: &str, field: &str, raw: Option<&str>) -> T
where
    T: std::str::FromStr + Default,
{
    let Some(raw) = raw else {
        return T::default();
    };

    raw.trim().to_ascii_lowercase().parse().unwrap_or_else(|_| {
        tracing::warn!(
            task = %task,
            field = %field,
            value = %raw,
            "unknown metadata value; using default"
        );
        T::default()
    })
}
