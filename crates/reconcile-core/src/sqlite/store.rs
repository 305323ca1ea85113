use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, params};
use time::OffsetDateTime;

use crate::models::{
    CategoryMetrics, CoreError, CoreErrorKind, Criticality, DateRange, ExecutionMetrics,
    ExecutionRecord, NewExecutionRecord, OutcomeKind, ReferenceDate, TaskCategory,
    TaskDescriptor, TaskState, TaskStatusRecord,
};
use crate::persistence::{ExecutionStore, MigrationStore, PersistenceResult, StatusStore};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "reconcile_schema_migrations";
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const STATUS_COLUMNS: &str = "
    task_name, category, criticality, state, progress, message,
    started_at_unix, finished_at_unix, updated_at_unix, result_json, error
";

const EXECUTION_COLUMNS: &str = "
    id, task_name, category, criticality, reference_date, outcome, elapsed_seconds,
    records_processed, records_valid, records_invalid, success_rate, result_json,
    executed_at_unix
";

/// SQLite-backed status and history store.
///
/// Every operation opens its own connection, so one store can be shared by any
/// number of concurrently running tasks. Each write is a single statement or a
/// single transaction; SQLite serializes writers and WAL mode keeps readers
/// from observing partially written rows.
pub struct SqliteStore {
    database_path: PathBuf,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl StatusStore for SqliteStore {
    fn register_task(&self, task: &TaskDescriptor) -> PersistenceResult<()> {
        self.with_connection("register_task", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO task_status (
    task_name, category, criticality, state, progress, updated_at_unix
) VALUES (?1, ?2, ?3, 'idle', 0, ?4)
ON CONFLICT(task_name) DO UPDATE SET
    category = excluded.category,
    criticality = excluded.criticality
",
                params![
                    task.name,
                    task.category.as_str(),
                    task.criticality.as_str(),
                    OffsetDateTime::now_utc().unix_timestamp(),
                ],
            )?;
            Ok(())
        })
    }

    fn upsert_status(&self, status: &TaskStatusRecord) -> PersistenceResult<()> {
        self.with_connection("upsert_status", |connection| {
            ensure_schema_ready(connection)?;
            let result_json = status.result.as_ref().map(to_json).transpose()?;
            connection.execute(
                "
INSERT INTO task_status (
    task_name, category, criticality, state, progress, message,
    started_at_unix, finished_at_unix, updated_at_unix, result_json, error
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
ON CONFLICT(task_name) DO UPDATE SET
    category = excluded.category,
    criticality = excluded.criticality,
    state = excluded.state,
    progress = excluded.progress,
    message = excluded.message,
    started_at_unix = excluded.started_at_unix,
    finished_at_unix = excluded.finished_at_unix,
    updated_at_unix = excluded.updated_at_unix,
    result_json = excluded.result_json,
    error = excluded.error
",
                params![
                    status.task,
                    status.category.as_str(),
                    status.criticality.as_str(),
                    status.state.as_str(),
                    i64::from(status.progress.min(100)),
                    status.message.as_deref(),
                    status.started_at.map(OffsetDateTime::unix_timestamp),
                    status.finished_at.map(OffsetDateTime::unix_timestamp),
                    status.updated_at.unix_timestamp(),
                    result_json,
                    status.error.as_deref(),
                ],
            )?;
            Ok(())
        })
    }

    fn status(&self, task: &str) -> PersistenceResult<Option<TaskStatusRecord>> {
        self.with_connection("status", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    &format!("SELECT {STATUS_COLUMNS} FROM task_status WHERE task_name = ?1"),
                    [task],
                    status_from_row,
                )
                .optional()
        })
    }

    fn list_statuses(&self) -> PersistenceResult<Vec<TaskStatusRecord>> {
        self.with_connection("list_statuses", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(&format!(
                "SELECT {STATUS_COLUMNS} FROM task_status ORDER BY category, task_name"
            ))?;
            let rows = statement.query_map([], status_from_row)?;
            rows.collect()
        })
    }
}

impl ExecutionStore for SqliteStore {
    fn insert_execution(&self, record: &NewExecutionRecord) -> PersistenceResult<u64> {
        self.with_connection("insert_execution", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO execution_records (
    task_name, category, criticality, reference_date, outcome, elapsed_seconds,
    records_processed, records_valid, records_invalid, success_rate, result_json,
    executed_at_unix
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
",
                params![
                    record.task,
                    record.category.as_str(),
                    record.criticality.as_str(),
                    record.reference_date.to_string(),
                    record.outcome.as_str(),
                    record.elapsed_seconds,
                    u64_to_i64(record.records_processed)?,
                    u64_to_i64(record.records_valid)?,
                    u64_to_i64(record.records_invalid)?,
                    record.success_rate,
                    to_json(&record.result)?,
                    record.executed_at.unix_timestamp(),
                ],
            )?;
            i64_to_u64(connection.last_insert_rowid())
        })
    }

    fn list_executions(
        &self,
        task: Option<&str>,
        limit: usize,
    ) -> PersistenceResult<Vec<ExecutionRecord>> {
        self.with_connection("list_executions", |connection| {
            ensure_schema_ready(connection)?;
            let limit = i64::try_from(limit)
                .map_err(|_| storage_error_sqlite("limit exceeds i64 range"))?;
            let mut statement = connection.prepare(&format!(
                "
SELECT {EXECUTION_COLUMNS}
FROM execution_records
WHERE (?1 IS NULL OR task_name = ?1)
ORDER BY executed_at_unix DESC, id DESC
LIMIT ?2
"
            ))?;
            let rows = statement.query_map(params![task, limit], execution_from_row)?;
            rows.collect()
        })
    }

    fn execution_metrics(&self, range: DateRange) -> PersistenceResult<ExecutionMetrics> {
        self.with_connection("execution_metrics", |connection| {
            ensure_schema_ready(connection)?;
            let from = range.from.map(|date| date.to_string());
            let to = range.to.map(|date| date.to_string());

            let mut metrics = connection.query_row(
                "
SELECT
    COUNT(*),
    COALESCE(SUM(CASE WHEN outcome = 'success' THEN 1 ELSE 0 END), 0),
    COALESCE(SUM(CASE WHEN outcome = 'error' THEN 1 ELSE 0 END), 0),
    COALESCE(SUM(CASE WHEN outcome = 'timeout' THEN 1 ELSE 0 END), 0),
    AVG(elapsed_seconds),
    AVG(success_rate),
    COALESCE(SUM(records_processed), 0)
FROM execution_records
WHERE (?1 IS NULL OR DATE(executed_at_unix, 'unixepoch') >= ?1)
  AND (?2 IS NULL OR DATE(executed_at_unix, 'unixepoch') <= ?2)
",
                params![from, to],
                |row| {
                    Ok(ExecutionMetrics {
                        range,
                        total_runs: i64_to_u64(row.get(0)?)?,
                        successful_runs: i64_to_u64(row.get(1)?)?,
                        failed_runs: i64_to_u64(row.get(2)?)?,
                        timed_out_runs: i64_to_u64(row.get(3)?)?,
                        average_elapsed_seconds: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
                        average_success_rate: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
                        total_records_processed: i64_to_u64(row.get(6)?)?,
                        by_category: BTreeMap::new(),
                        generated_at: OffsetDateTime::now_utc(),
                    })
                },
            )?;

            // Executions are grouped under the category currently tagged on the
            // task's status row; history rows keep their own tag as a fallback.
            let mut statement = connection.prepare(
                "
SELECT
    COALESCE(ts.category, er.category) AS category_tag,
    COUNT(*),
    COALESCE(SUM(CASE WHEN er.outcome = 'success' THEN 1 ELSE 0 END), 0),
    AVG(er.elapsed_seconds)
FROM execution_records er
LEFT JOIN task_status ts ON ts.task_name = er.task_name
WHERE (?1 IS NULL OR DATE(er.executed_at_unix, 'unixepoch') >= ?1)
  AND (?2 IS NULL OR DATE(er.executed_at_unix, 'unixepoch') <= ?2)
GROUP BY category_tag
ORDER BY category_tag
",
            )?;
            let rows = statement.query_map(params![from, to], |row| {
                let category_raw: String = row.get(0)?;
                Ok((
                    parse_category(&category_raw)?,
                    CategoryMetrics {
                        runs: i64_to_u64(row.get(1)?)?,
                        successful_runs: i64_to_u64(row.get(2)?)?,
                        average_elapsed_seconds: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                    },
                ))
            })?;
            for row in rows {
                let (category, category_metrics) = row?;
                metrics.by_category.insert(category, category_metrics);
            }

            Ok(metrics)
        })
    }

    fn purge_executions_before(&self, cutoff: OffsetDateTime) -> PersistenceResult<usize> {
        self.with_connection("purge_executions_before", |connection| {
            ensure_schema_ready(connection)?;
            let deleted = connection.execute(
                "DELETE FROM execution_records WHERE executed_at_unix < ?1",
                params![cutoff.unix_timestamp()],
            )?;
            Ok(deleted)
        })
    }
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    let _mode: String = connection.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations before status operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn status_from_row(row: &Row<'_>) -> rusqlite::Result<TaskStatusRecord> {
    let task: String = row.get(0)?;
    let category_raw: String = row.get(1)?;
    let criticality_raw: String = row.get(2)?;
    let state_raw: String = row.get(3)?;
    let progress: i64 = row.get(4)?;
    let message: Option<String> = row.get(5)?;
    let started_at: Option<i64> = row.get(6)?;
    let finished_at: Option<i64> = row.get(7)?;
    let updated_at: i64 = row.get(8)?;
    let result_json: Option<String> = row.get(9)?;
    let error: Option<String> = row.get(10)?;

    Ok(TaskStatusRecord {
        task,
        category: parse_category(&category_raw)?,
        criticality: parse_criticality(&criticality_raw)?,
        state: state_raw.parse::<TaskState>().map_err(|_| {
            storage_error_sqlite(&format!("unknown task state '{state_raw}' in sqlite record"))
        })?,
        progress: u8::try_from(progress.clamp(0, 100))
            .map_err(|_| storage_error_sqlite("progress out of range"))?,
        message,
        started_at: started_at.map(from_unix_seconds).transpose()?,
        finished_at: finished_at.map(from_unix_seconds).transpose()?,
        updated_at: from_unix_seconds(updated_at)?,
        result: result_json.as_deref().map(from_json).transpose()?,
        error,
    })
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let id: i64 = row.get(0)?;
    let task: String = row.get(1)?;
    let category_raw: String = row.get(2)?;
    let criticality_raw: String = row.get(3)?;
    let reference_date_raw: String = row.get(4)?;
    let outcome_raw: String = row.get(5)?;
    let result_json: String = row.get(11)?;
    let executed_at: i64 = row.get(12)?;

    Ok(ExecutionRecord {
        id: i64_to_u64(id)?,
        task,
        category: parse_category(&category_raw)?,
        criticality: parse_criticality(&criticality_raw)?,
        reference_date: reference_date_raw.parse::<ReferenceDate>().map_err(|_| {
            storage_error_sqlite(&format!(
                "invalid reference date '{reference_date_raw}' in sqlite record"
            ))
        })?,
        outcome: outcome_raw.parse::<OutcomeKind>().map_err(|_| {
            storage_error_sqlite(&format!("unknown outcome '{outcome_raw}' in sqlite record"))
        })?,
        elapsed_seconds: row.get(6)?,
        records_processed: i64_to_u64(row.get(7)?)?,
        records_valid: i64_to_u64(row.get(8)?)?,
        records_invalid: i64_to_u64(row.get(9)?)?,
        success_rate: row.get(10)?,
        result: from_json(&result_json)?,
        executed_at: from_unix_seconds(executed_at)?,
    })
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}

fn parse_category(raw: &str) -> rusqlite::Result<TaskCategory> {
    raw.parse::<TaskCategory>().map_err(|_| {
        storage_error_sqlite(&format!("unknown task category '{raw}' in sqlite record"))
    })
}

fn parse_criticality(raw: &str) -> rusqlite::Result<Criticality> {
    raw.parse::<Criticality>().map_err(|_| {
        storage_error_sqlite(&format!("unknown criticality '{raw}' in sqlite record"))
    })
}

fn to_json(value: &serde_json::Value) -> rusqlite::Result<String> {
    serde_json::to_string(value).map_err(|error| {
        storage_error_sqlite(&format!("failed to serialize result payload: {error}"))
    })
}

fn from_json(raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|error| {
        storage_error_sqlite(&format!("failed to parse stored result payload: {error}"))
    })
}

fn from_unix_seconds(value: i64) -> rusqlite::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(value).map_err(|error| {
        storage_error_sqlite(&format!("invalid unix timestamp '{value}': {error}"))
    })
}

fn i64_to_u64(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| storage_error_sqlite("negative counter in sqlite record"))
}

fn u64_to_i64(value: u64) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}
