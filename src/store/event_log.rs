use crate::shared::ids::generate_record_id;
use crate::store::database::Database;
use crate::store::error::{json_error, sql_error, StoreError};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Started,
    Paused,
    Resumed,
    Completed,
    Failed,
    Rejected,
    Escalated,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Started => "started",
            EventType::Paused => "paused",
            EventType::Resumed => "resumed",
            EventType::Completed => "completed",
            EventType::Failed => "failed",
            EventType::Rejected => "rejected",
            EventType::Escalated => "escalated",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "started" => Ok(EventType::Started),
            "paused" => Ok(EventType::Paused),
            "resumed" => Ok(EventType::Resumed),
            "completed" => Ok(EventType::Completed),
            "failed" => Ok(EventType::Failed),
            "rejected" => Ok(EventType::Rejected),
            "escalated" => Ok(EventType::Escalated),
            other => Err(format!("unknown event type `{other}`")),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    pub seq: i64,
    pub id: String,
    pub run_id: String,
    pub event_type: EventType,
    pub actor: Option<String>,
    pub payload: Map<String, Value>,
    pub created_at: i64,
}

impl WorkflowEvent {
    /// True when the payload carries `"approved": true`.
    pub fn is_approval(&self) -> bool {
        self.payload.get("approved").and_then(Value::as_bool) == Some(true)
    }
}

const EVENT_COLUMNS: &str = "seq, id, run_id, event_type, actor, payload, created_at";

type RawEvent = (i64, String, String, String, Option<String>, String, i64);

/// Append-only lifecycle log. There is no update or delete path.
#[derive(Debug, Clone, Copy)]
pub struct EventLog<'a> {
    db: &'a Database,
}

impl<'a> EventLog<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn append(
        &self,
        run_id: &str,
        event_type: EventType,
        actor: Option<&str>,
        payload: Map<String, Value>,
        now: i64,
    ) -> Result<WorkflowEvent, StoreError> {
        let connection = self.db.connect()?;
        append_event(&connection, run_id, event_type, actor, payload, now)
    }

    pub fn events_for_run(&self, run_id: &str) -> Result<Vec<WorkflowEvent>, StoreError> {
        let connection = self.db.connect()?;
        let mut statement = connection
            .prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM workflow_events WHERE run_id = ?1 ORDER BY seq ASC"
            ))
            .map_err(sql_error)?;
        let rows = statement
            .query_map(params![run_id], raw_event)
            .map_err(sql_error)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(event_from_raw(row.map_err(sql_error)?)?);
        }
        Ok(out)
    }

    pub fn events_of_type(
        &self,
        run_id: &str,
        event_type: EventType,
    ) -> Result<Vec<WorkflowEvent>, StoreError> {
        Ok(self
            .events_for_run(run_id)?
            .into_iter()
            .filter(|event| event.event_type == event_type)
            .collect())
    }

    pub fn latest_event(
        &self,
        run_id: &str,
        event_type: EventType,
    ) -> Result<Option<WorkflowEvent>, StoreError> {
        let connection = self.db.connect()?;
        let raw = connection
            .query_row(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM workflow_events
                     WHERE run_id = ?1 AND event_type = ?2
                     ORDER BY seq DESC LIMIT 1"
                ),
                params![run_id, event_type.as_str()],
                raw_event,
            )
            .optional()
            .map_err(sql_error)?;
        raw.map(event_from_raw).transpose()
    }
}

pub(crate) fn append_event(
    connection: &Connection,
    run_id: &str,
    event_type: EventType,
    actor: Option<&str>,
    payload: Map<String, Value>,
    now: i64,
) -> Result<WorkflowEvent, StoreError> {
    let id = generate_record_id("evt", now).map_err(StoreError::Id)?;
    let encoded = serde_json::to_string(&payload).map_err(json_error("payload"))?;
    connection
        .execute(
            "
            INSERT INTO workflow_events (id, run_id, event_type, actor, payload, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![id, run_id, event_type.as_str(), actor, encoded, now],
        )
        .map_err(sql_error)?;
    Ok(WorkflowEvent {
        seq: connection.last_insert_rowid(),
        id,
        run_id: run_id.to_string(),
        event_type,
        actor: actor.map(str::to_string),
        payload,
        created_at: now,
    })
}

fn raw_event(row: &Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn event_from_raw(raw: RawEvent) -> Result<WorkflowEvent, StoreError> {
    let (seq, id, run_id, event_type_raw, actor, payload_raw, created_at) = raw;
    let event_type = EventType::parse(&event_type_raw).map_err(|_| StoreError::InvalidColumn {
        column: "event_type",
        value: event_type_raw.clone(),
    })?;
    let payload = serde_json::from_str(&payload_raw).map_err(json_error("payload"))?;
    Ok(WorkflowEvent {
        seq,
        id,
        run_id,
        event_type,
        actor,
        payload,
        created_at,
    })
}
