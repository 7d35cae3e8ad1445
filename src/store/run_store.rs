use crate::shared::ids::{generate_record_id, PipelineType};
use crate::store::database::Database;
use crate::store::error::{sql_error, StoreError};
use crate::store::event_log::{append_event, EventType, WorkflowEvent};
use crate::store::status::RunStatus;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub pipeline_type: PipelineType,
    pub subject_id: String,
    pub input_version_id: Option<String>,
    pub output_version_id: Option<String>,
    pub status: RunStatus,
    pub current_agent: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRun {
    pub pipeline_type: PipelineType,
    pub subject_id: String,
    pub input_version_id: Option<String>,
}

impl NewRun {
    pub fn new(pipeline_type: PipelineType, subject_id: impl Into<String>) -> Self {
        Self {
            pipeline_type,
            subject_id: subject_id.into(),
            input_version_id: None,
        }
    }

    pub fn with_input_version(mut self, version_id: impl Into<String>) -> Self {
        self.input_version_id = Some(version_id.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub subject_id: Option<String>,
    pub status: Option<RunStatus>,
    pub pipeline_type: Option<PipelineType>,
}

const RUN_COLUMNS: &str = "id, pipeline_type, subject_id, input_version_id, output_version_id, \
                           status, current_agent, created_at, updated_at";

type RawRun = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    i64,
    i64,
);

#[derive(Debug, Clone, Copy)]
pub struct RunStore<'a> {
    db: &'a Database,
}

impl<'a> RunStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn create(&self, new_run: NewRun, now: i64) -> Result<WorkflowRun, StoreError> {
        let run = WorkflowRun {
            id: generate_record_id("run", now).map_err(StoreError::Id)?,
            pipeline_type: new_run.pipeline_type,
            subject_id: new_run.subject_id,
            input_version_id: new_run.input_version_id,
            output_version_id: None,
            status: RunStatus::Pending,
            current_agent: None,
            created_at: now,
            updated_at: now,
        };
        let connection = self.db.connect()?;
        connection
            .execute(
                "
                INSERT INTO workflow_runs (
                    id, pipeline_type, subject_id, input_version_id, output_version_id,
                    status, current_agent, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, NULL, ?5, NULL, ?6, ?6)
                ",
                params![
                    run.id,
                    run.pipeline_type.as_str(),
                    run.subject_id,
                    run.input_version_id,
                    run.status.as_str(),
                    now
                ],
            )
            .map_err(sql_error)?;
        Ok(run)
    }

    pub fn get(&self, run_id: &str) -> Result<Option<WorkflowRun>, StoreError> {
        let connection = self.db.connect()?;
        load_run(&connection, run_id)
    }

    pub fn require(&self, run_id: &str) -> Result<WorkflowRun, StoreError> {
        self.get(run_id)?.ok_or_else(|| StoreError::NotFound {
            entity: "workflow run",
            id: run_id.to_string(),
        })
    }

    pub fn list(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, StoreError> {
        let mut clauses = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(subject_id) = &filter.subject_id {
            values.push(SqlValue::Text(subject_id.clone()));
            clauses.push(format!("subject_id = ?{}", values.len()));
        }
        if let Some(status) = filter.status {
            values.push(SqlValue::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(pipeline_type) = &filter.pipeline_type {
            values.push(SqlValue::Text(pipeline_type.as_str().to_string()));
            clauses.push(format!("pipeline_type = ?{}", values.len()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs {where_clause} ORDER BY created_at ASC, rowid ASC"
        );

        let connection = self.db.connect()?;
        let mut statement = connection.prepare(&sql).map_err(sql_error)?;
        let rows = statement
            .query_map(params_from_iter(values), raw_run)
            .map_err(sql_error)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(run_from_raw(row.map_err(sql_error)?)?);
        }
        Ok(out)
    }

    /// Moves the run to `next` when the status table allows it. The read and
    /// the write share one immediate transaction.
    pub fn update_status(
        &self,
        run_id: &str,
        next: RunStatus,
        now: i64,
    ) -> Result<WorkflowRun, StoreError> {
        self.db.write(|tx| transition_status(tx, run_id, next, now))
    }

    /// Applies the transition and appends its lifecycle event in the same
    /// transaction: either both are committed or neither is.
    pub fn update_status_with_event(
        &self,
        run_id: &str,
        next: RunStatus,
        event_type: EventType,
        payload: Map<String, Value>,
        now: i64,
    ) -> Result<(WorkflowRun, WorkflowEvent), StoreError> {
        self.db.write(|tx| {
            let run = transition_status(tx, run_id, next, now)?;
            let event = append_event(tx, run_id, event_type, None, payload, now)?;
            Ok((run, event))
        })
    }

    pub fn set_current_agent(
        &self,
        run_id: &str,
        agent: Option<&str>,
        now: i64,
    ) -> Result<(), StoreError> {
        self.update_column(run_id, "current_agent", agent, now)
    }

    pub fn link_output_version(
        &self,
        run_id: &str,
        version_id: &str,
        now: i64,
    ) -> Result<(), StoreError> {
        self.update_column(run_id, "output_version_id", Some(version_id), now)
    }

    fn update_column(
        &self,
        run_id: &str,
        column: &'static str,
        value: Option<&str>,
        now: i64,
    ) -> Result<(), StoreError> {
        let connection = self.db.connect()?;
        let sql = format!("UPDATE workflow_runs SET {column} = ?2, updated_at = ?3 WHERE id = ?1");
        let changed = connection
            .execute(&sql, params![run_id, value, now])
            .map_err(sql_error)?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "workflow run",
                id: run_id.to_string(),
            });
        }
        Ok(())
    }
}

fn transition_status(
    connection: &Connection,
    run_id: &str,
    next: RunStatus,
    now: i64,
) -> Result<WorkflowRun, StoreError> {
    let mut run = load_run(connection, run_id)?.ok_or_else(|| StoreError::NotFound {
        entity: "workflow run",
        id: run_id.to_string(),
    })?;
    if !run.status.can_transition_to(next) {
        return Err(StoreError::InvalidTransition {
            run_id: run_id.to_string(),
            from: run.status,
            to: next,
        });
    }
    connection
        .execute(
            "UPDATE workflow_runs SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![run_id, next.as_str(), now],
        )
        .map_err(sql_error)?;
    run.status = next;
    run.updated_at = now;
    Ok(run)
}

pub(crate) fn load_run(
    connection: &Connection,
    run_id: &str,
) -> Result<Option<WorkflowRun>, StoreError> {
    let raw = connection
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = ?1"),
            params![run_id],
            raw_run,
        )
        .optional()
        .map_err(sql_error)?;
    raw.map(run_from_raw).transpose()
}

fn raw_run(row: &Row<'_>) -> rusqlite::Result<RawRun> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn run_from_raw(raw: RawRun) -> Result<WorkflowRun, StoreError> {
    let (
        id,
        pipeline_type_raw,
        subject_id,
        input_version_id,
        output_version_id,
        status_raw,
        current_agent,
        created_at,
        updated_at,
    ) = raw;
    let pipeline_type =
        PipelineType::parse(&pipeline_type_raw).map_err(|_| StoreError::InvalidColumn {
            column: "pipeline_type",
            value: pipeline_type_raw.clone(),
        })?;
    let status = RunStatus::parse(&status_raw).map_err(|_| StoreError::InvalidColumn {
        column: "status",
        value: status_raw.clone(),
    })?;
    Ok(WorkflowRun {
        id,
        pipeline_type,
        subject_id,
        input_version_id,
        output_version_id,
        status,
        current_agent,
        created_at,
        updated_at,
    })
}
