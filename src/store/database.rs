use crate::store::error::{sql_error, StoreError};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the engine database. Holds only the path; every repository
/// call opens its own connection so no state outlives the call.
#[derive(Debug, Clone)]
pub struct Database {
    db_path: PathBuf,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let database = Self {
            db_path: db_path.to_path_buf(),
        };
        database.ensure_schema()?;
        Ok(database)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflow_runs (
                    id TEXT PRIMARY KEY,
                    pipeline_type TEXT NOT NULL,
                    subject_id TEXT NOT NULL,
                    input_version_id TEXT,
                    output_version_id TEXT,
                    status TEXT NOT NULL,
                    current_agent TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS checkpoints (
                    run_id TEXT PRIMARY KEY REFERENCES workflow_runs(id),
                    pipeline_type TEXT NOT NULL,
                    current_step TEXT NOT NULL,
                    body TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workflow_events (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    run_id TEXT NOT NULL REFERENCES workflow_runs(id),
                    event_type TEXT NOT NULL,
                    actor TEXT,
                    payload TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workflow_artifacts (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    run_id TEXT NOT NULL REFERENCES workflow_runs(id),
                    artifact_type TEXT NOT NULL,
                    artifact_path TEXT NOT NULL,
                    metadata TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS rejections (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    run_id TEXT NOT NULL REFERENCES workflow_runs(id),
                    category TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    retry_count INTEGER NOT NULL,
                    resolved INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS escalations (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    run_id TEXT NOT NULL REFERENCES workflow_runs(id),
                    category TEXT NOT NULL,
                    retry_count INTEGER NOT NULL,
                    target TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    status TEXT NOT NULL,
                    resolution TEXT,
                    created_at INTEGER NOT NULL,
                    acknowledged_at INTEGER,
                    resolved_at INTEGER,
                    UNIQUE (run_id, category)
                );

                CREATE TABLE IF NOT EXISTS workflow_triggers (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    source_type TEXT NOT NULL,
                    target_type TEXT NOT NULL,
                    trigger_condition TEXT NOT NULL,
                    enabled INTEGER NOT NULL,
                    config TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS plans (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES workflow_runs(id),
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS content_versions (
                    version_id TEXT PRIMARY KEY,
                    subject_id TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_workflow_runs_subject
                    ON workflow_runs(subject_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_workflow_events_run
                    ON workflow_events(run_id, seq);
                CREATE INDEX IF NOT EXISTS idx_workflow_artifacts_run
                    ON workflow_artifacts(run_id, seq);
                CREATE INDEX IF NOT EXISTS idx_rejections_run_category
                    ON rejections(run_id, category);
                CREATE INDEX IF NOT EXISTS idx_escalations_status
                    ON escalations(status, seq);
                CREATE INDEX IF NOT EXISTS idx_workflow_triggers_source
                    ON workflow_triggers(source_type, seq);
                CREATE INDEX IF NOT EXISTS idx_plans_run
                    ON plans(run_id);
                ",
            )
            .map_err(sql_error)
    }

    pub fn table_names(&self) -> Result<Vec<String>, StoreError> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(
                "
                SELECT name FROM sqlite_master
                WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                ORDER BY name ASC
                ",
            )
            .map_err(sql_error)?;
        let rows = statement
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(sql_error)?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row.map_err(sql_error)?);
        }
        Ok(names)
    }

    pub(crate) fn connect(&self) -> Result<Connection, StoreError> {
        let connection = Connection::open(&self.db_path).map_err(|source| StoreError::Open {
            path: self.db_path.display().to_string(),
            source,
        })?;
        connection.busy_timeout(BUSY_TIMEOUT).map_err(sql_error)?;
        connection
            .execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(sql_error)?;
        Ok(connection)
    }

    /// Runs `apply` inside one `BEGIN IMMEDIATE` transaction. Any error rolls
    /// the whole unit back.
    pub(crate) fn write<T, F>(&self, apply: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        let mut connection = self.connect()?;
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_error)?;
        let value = apply(&tx)?;
        tx.commit().map_err(sql_error)?;
        Ok(value)
    }
}
