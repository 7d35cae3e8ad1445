use crate::shared::ids::generate_record_id;
use crate::store::database::Database;
use crate::store::error::{json_error, sql_error, StoreError};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowArtifact {
    pub id: String,
    pub run_id: String,
    pub artifact_type: String,
    pub artifact_path: String,
    pub metadata: Map<String, Value>,
    pub created_at: i64,
}

const ARTIFACT_COLUMNS: &str = "id, run_id, artifact_type, artifact_path, metadata, created_at";

type RawArtifact = (String, String, String, String, String, i64);

#[derive(Debug, Clone, Copy)]
pub struct ArtifactRegistry<'a> {
    db: &'a Database,
}

impl<'a> ArtifactRegistry<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn register(
        &self,
        run_id: &str,
        artifact_type: &str,
        artifact_path: &str,
        metadata: Map<String, Value>,
        now: i64,
    ) -> Result<WorkflowArtifact, StoreError> {
        if artifact_path.trim().is_empty() {
            return Err(StoreError::InvalidArtifactPath);
        }
        let artifact = WorkflowArtifact {
            id: generate_record_id("art", now).map_err(StoreError::Id)?,
            run_id: run_id.to_string(),
            artifact_type: artifact_type.to_string(),
            artifact_path: artifact_path.to_string(),
            metadata,
            created_at: now,
        };
        let metadata_raw =
            serde_json::to_string(&artifact.metadata).map_err(json_error("metadata"))?;
        let connection = self.db.connect()?;
        connection
            .execute(
                "
                INSERT INTO workflow_artifacts (
                    id, run_id, artifact_type, artifact_path, metadata, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
                params![
                    artifact.id,
                    artifact.run_id,
                    artifact.artifact_type,
                    artifact.artifact_path,
                    metadata_raw,
                    now
                ],
            )
            .map_err(sql_error)?;
        Ok(artifact)
    }

    pub fn get(&self, artifact_id: &str) -> Result<Option<WorkflowArtifact>, StoreError> {
        let connection = self.db.connect()?;
        let raw = connection
            .query_row(
                &format!("SELECT {ARTIFACT_COLUMNS} FROM workflow_artifacts WHERE id = ?1"),
                params![artifact_id],
                raw_artifact,
            )
            .optional()
            .map_err(sql_error)?;
        raw.map(artifact_from_raw).transpose()
    }

    pub fn by_run(&self, run_id: &str) -> Result<Vec<WorkflowArtifact>, StoreError> {
        self.query("WHERE run_id = ?1", &[run_id])
    }

    pub fn by_type(&self, artifact_type: &str) -> Result<Vec<WorkflowArtifact>, StoreError> {
        self.query("WHERE artifact_type = ?1", &[artifact_type])
    }

    pub fn by_run_and_type(
        &self,
        run_id: &str,
        artifact_type: &str,
    ) -> Result<Vec<WorkflowArtifact>, StoreError> {
        self.query(
            "WHERE run_id = ?1 AND artifact_type = ?2",
            &[run_id, artifact_type],
        )
    }

    fn query(
        &self,
        where_clause: &str,
        values: &[&str],
    ) -> Result<Vec<WorkflowArtifact>, StoreError> {
        let connection = self.db.connect()?;
        let mut statement = connection
            .prepare(&format!(
                "SELECT {ARTIFACT_COLUMNS} FROM workflow_artifacts {where_clause} ORDER BY seq ASC"
            ))
            .map_err(sql_error)?;
        let rows = statement
            .query_map(rusqlite::params_from_iter(values.iter()), raw_artifact)
            .map_err(sql_error)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(artifact_from_raw(row.map_err(sql_error)?)?);
        }
        Ok(out)
    }
}

fn raw_artifact(row: &Row<'_>) -> rusqlite::Result<RawArtifact> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn artifact_from_raw(raw: RawArtifact) -> Result<WorkflowArtifact, StoreError> {
    let (id, run_id, artifact_type, artifact_path, metadata_raw, created_at) = raw;
    let metadata = serde_json::from_str(&metadata_raw).map_err(json_error("metadata"))?;
    Ok(WorkflowArtifact {
        id,
        run_id,
        artifact_type,
        artifact_path,
        metadata,
        created_at,
    })
}
