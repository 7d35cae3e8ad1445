use crate::store::status::RunStatus;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create database parent {path}: {source}")]
    CreateParent {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite open failed at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("sqlite statement failed: {source}")]
    Sql {
        #[source]
        source: rusqlite::Error,
    },
    #[error("json column `{column}` could not be encoded or decoded: {source}")]
    Json {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("workflow run `{run_id}` status transition `{from}` -> `{to}` is invalid")]
    InvalidTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },
    #[error("checkpoint for workflow run `{run_id}` already exists")]
    CheckpointExists { run_id: String },
    #[error("workflow run `{run_id}` has no parallel fan-out in progress")]
    ParallelNotInitialized { run_id: String },
    #[error("workflow run `{run_id}` has no parallel item `{item}`")]
    UnknownParallelItem { run_id: String, item: String },
    #[error("escalation `{escalation_id}` cannot move from `{from}` to `{to}`")]
    InvalidEscalationTransition {
        escalation_id: String,
        from: String,
        to: String,
    },
    #[error("artifact path must be non-empty")]
    InvalidArtifactPath,
    #[error("invalid {column} `{value}` in database")]
    InvalidColumn { column: &'static str, value: String },
    #[error("record id generation failed: {0}")]
    Id(String),
}

pub(crate) fn sql_error(source: rusqlite::Error) -> StoreError {
    StoreError::Sql { source }
}

pub(crate) fn json_error(column: &'static str) -> impl FnOnce(serde_json::Error) -> StoreError {
    move |source| StoreError::Json { column, source }
}
