use crate::shared::ids::generate_record_id;
use crate::store::database::Database;
use crate::store::error::{sql_error, StoreError};
use crate::store::run_store::load_run;
use crate::store::status::RunStatus;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentVersion {
    pub id: String,
    pub subject_id: String,
}

/// Read-only queries that step pre/postconditions are evaluated against.
pub trait ConditionSource {
    fn plan_exists(&self, run_id: &str) -> Result<bool, StoreError>;
    fn version_exists(&self, version_id: &str) -> Result<bool, StoreError>;
    fn artifacts_exist(&self, run_id: &str) -> Result<bool, StoreError>;
    fn run_status(&self, run_id: &str) -> Result<Option<RunStatus>, StoreError>;
    fn get_version(&self, version_id: &str) -> Result<Option<ContentVersion>, StoreError>;
}

/// `ConditionSource` backed by the engine database. External tooling writes
/// plans and content versions through the `register_*` calls.
#[derive(Debug, Clone, Copy)]
pub struct StoreConditions<'a> {
    db: &'a Database,
}

impl<'a> StoreConditions<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn register_plan(&self, run_id: &str, now: i64) -> Result<String, StoreError> {
        let plan_id = generate_record_id("plan", now).map_err(StoreError::Id)?;
        let connection = self.db.connect()?;
        connection
            .execute(
                "INSERT INTO plans (id, run_id, created_at) VALUES (?1, ?2, ?3)",
                params![plan_id, run_id, now],
            )
            .map_err(sql_error)?;
        Ok(plan_id)
    }

    pub fn register_version(
        &self,
        version_id: &str,
        subject_id: &str,
        now: i64,
    ) -> Result<ContentVersion, StoreError> {
        let connection = self.db.connect()?;
        connection
            .execute(
                "
                INSERT INTO content_versions (version_id, subject_id, created_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(version_id) DO UPDATE SET subject_id = excluded.subject_id
                ",
                params![version_id, subject_id, now],
            )
            .map_err(sql_error)?;
        Ok(ContentVersion {
            id: version_id.to_string(),
            subject_id: subject_id.to_string(),
        })
    }
}

impl ConditionSource for StoreConditions<'_> {
    fn plan_exists(&self, run_id: &str) -> Result<bool, StoreError> {
        let connection = self.db.connect()?;
        row_exists(
            &connection,
            "SELECT 1 FROM plans WHERE run_id = ?1 LIMIT 1",
            run_id,
        )
    }

    fn version_exists(&self, version_id: &str) -> Result<bool, StoreError> {
        let connection = self.db.connect()?;
        row_exists(
            &connection,
            "SELECT 1 FROM content_versions WHERE version_id = ?1 LIMIT 1",
            version_id,
        )
    }

    fn artifacts_exist(&self, run_id: &str) -> Result<bool, StoreError> {
        let connection = self.db.connect()?;
        row_exists(
            &connection,
            "SELECT 1 FROM workflow_artifacts WHERE run_id = ?1 LIMIT 1",
            run_id,
        )
    }

    fn run_status(&self, run_id: &str) -> Result<Option<RunStatus>, StoreError> {
        let connection = self.db.connect()?;
        Ok(load_run(&connection, run_id)?.map(|run| run.status))
    }

    fn get_version(&self, version_id: &str) -> Result<Option<ContentVersion>, StoreError> {
        let connection = self.db.connect()?;
        connection
            .query_row(
                "SELECT version_id, subject_id FROM content_versions WHERE version_id = ?1",
                params![version_id],
                |row| {
                    Ok(ContentVersion {
                        id: row.get(0)?,
                        subject_id: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(sql_error)
    }
}

fn row_exists(connection: &Connection, sql: &str, key: &str) -> Result<bool, StoreError> {
    Ok(connection
        .query_row(sql, params![key], |row| row.get::<_, i64>(0))
        .optional()
        .map_err(sql_error)?
        .is_some())
}
