#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_status_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS task_status (
    task_name TEXT PRIMARY KEY,
    category TEXT NOT NULL,
    criticality TEXT NOT NULL,
    state TEXT NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    message TEXT,
    started_at_unix INTEGER,
    finished_at_unix INTEGER,
    updated_at_unix INTEGER NOT NULL,
    result_json TEXT,
    error TEXT
);

CREATE TABLE IF NOT EXISTS execution_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_name TEXT NOT NULL,
    category TEXT NOT NULL,
    criticality TEXT NOT NULL,
    reference_date TEXT NOT NULL,
    outcome TEXT NOT NULL,
    elapsed_seconds REAL NOT NULL,
    records_processed INTEGER NOT NULL DEFAULT 0,
    records_valid INTEGER NOT NULL DEFAULT 0,
    records_invalid INTEGER NOT NULL DEFAULT 0,
    success_rate REAL,
    result_json TEXT NOT NULL,
    executed_at_unix INTEGER NOT NULL
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS execution_records;
DROP TABLE IF EXISTS task_status;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_execution_history_indexes",
    up_sql: r#"
CREATE INDEX IF NOT EXISTS idx_execution_records_executed_at
    ON execution_records (executed_at_unix);

CREATE INDEX IF NOT EXISTS idx_execution_records_task
    ON execution_records (task_name, executed_at_unix DESC);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_execution_records_task;
DROP INDEX IF EXISTS idx_execution_records_executed_at;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
