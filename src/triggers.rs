use crate::shared::ids::{generate_record_id, PipelineType};
use crate::store::error::{json_error, sql_error, StoreError};
use crate::store::event_log::{EventLog, EventType, WorkflowEvent};
use crate::store::run_store::{NewRun, RunStore, WorkflowRun};
use crate::store::{Database, RunStatus};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCondition {
    OnComplete,
    OnApprove,
    Manual,
}

impl TriggerCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerCondition::OnComplete => "on_complete",
            TriggerCondition::OnApprove => "on_approve",
            TriggerCondition::Manual => "manual",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "on_complete" => Ok(TriggerCondition::OnComplete),
            "on_approve" => Ok(TriggerCondition::OnApprove),
            "manual" => Ok(TriggerCondition::Manual),
            other => Err(format!("unknown trigger condition `{other}`")),
        }
    }
}

impl std::fmt::Display for TriggerCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTrigger {
    pub id: String,
    pub name: String,
    pub source_type: PipelineType,
    pub target_type: PipelineType,
    pub condition: TriggerCondition,
    pub enabled: bool,
    pub config: Map<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTrigger {
    pub name: String,
    pub source_type: PipelineType,
    pub target_type: PipelineType,
    pub condition: TriggerCondition,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub config: Map<String, Value>,
}

fn default_enabled() -> bool {
    true
}

impl NewTrigger {
    pub fn new(
        name: &str,
        source_type: PipelineType,
        target_type: PipelineType,
        condition: TriggerCondition,
    ) -> Self {
        Self {
            name: name.to_string(),
            source_type,
            target_type,
            condition,
            enabled: true,
            config: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResult {
    pub triggered: bool,
    pub trigger_id: String,
    pub new_run_id: Option<String>,
    pub reason: String,
}

/// What counts as approval for `on_approve`: an event whose payload carries
/// `"approved": true`, recorded no earlier than the run's latest `completed`
/// event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalEvidence;

impl ApprovalEvidence {
    pub fn is_present(events: &[WorkflowEvent]) -> bool {
        let floor = events
            .iter()
            .filter(|event| event.event_type == EventType::Completed)
            .map(|event| event.seq)
            .max()
            .unwrap_or(i64::MIN);
        events
            .iter()
            .any(|event| event.seq >= floor && event.is_approval())
    }
}

const TRIGGER_COLUMNS: &str = "id, name, source_type, target_type, trigger_condition, enabled, \
                               config, created_at, updated_at";

type RawTrigger = (String, String, String, String, String, bool, String, i64, i64);

#[derive(Debug, Clone, Copy)]
pub struct TriggerEngine<'a> {
    db: &'a Database,
}

impl<'a> TriggerEngine<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn register_trigger(&self, input: NewTrigger, now: i64) -> Result<String, StoreError> {
        let id = generate_record_id("trig", now).map_err(StoreError::Id)?;
        let config = serde_json::to_string(&input.config).map_err(json_error("config"))?;
        let connection = self.db.connect()?;
        connection
            .execute(
                "
                INSERT INTO workflow_triggers (
                    id, name, source_type, target_type, trigger_condition,
                    enabled, config, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                ",
                params![
                    id,
                    input.name,
                    input.source_type.as_str(),
                    input.target_type.as_str(),
                    input.condition.as_str(),
                    input.enabled,
                    config,
                    now
                ],
            )
            .map_err(sql_error)?;
        Ok(id)
    }

    pub fn get_trigger(&self, trigger_id: &str) -> Result<Option<WorkflowTrigger>, StoreError> {
        let connection = self.db.connect()?;
        let raw = connection
            .query_row(
                &format!("SELECT {TRIGGER_COLUMNS} FROM workflow_triggers WHERE id = ?1"),
                params![trigger_id],
                raw_trigger,
            )
            .optional()
            .map_err(sql_error)?;
        raw.map(trigger_from_raw).transpose()
    }

    pub fn list_triggers(&self) -> Result<Vec<WorkflowTrigger>, StoreError> {
        self.query("", None)
    }

    pub fn triggers_for_source(
        &self,
        source_type: &PipelineType,
    ) -> Result<Vec<WorkflowTrigger>, StoreError> {
        self.query("WHERE source_type = ?1", Some(source_type.as_str()))
    }

    pub fn set_trigger_enabled(
        &self,
        trigger_id: &str,
        enabled: bool,
        now: i64,
    ) -> Result<(), StoreError> {
        let connection = self.db.connect()?;
        let changed = connection
            .execute(
                "UPDATE workflow_triggers SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
                params![trigger_id, enabled, now],
            )
            .map_err(sql_error)?;
        if changed == 0 {
            return Err(trigger_not_found(trigger_id));
        }
        Ok(())
    }

    pub fn delete_trigger(&self, trigger_id: &str) -> Result<(), StoreError> {
        let connection = self.db.connect()?;
        let changed = connection
            .execute(
                "DELETE FROM workflow_triggers WHERE id = ?1",
                params![trigger_id],
            )
            .map_err(sql_error)?;
        if changed == 0 {
            return Err(trigger_not_found(trigger_id));
        }
        Ok(())
    }

    /// Evaluates enabled triggers whose source is the run's pipeline type.
    /// Runs that are not `completed` produce no results.
    pub fn check_triggers(&self, run_id: &str, now: i64) -> Result<Vec<TriggerResult>, StoreError> {
        let run = RunStore::new(self.db).require(run_id)?;
        if run.status != RunStatus::Completed {
            return Ok(Vec::new());
        }

        let triggers = self.triggers_for_source(&run.pipeline_type)?;
        let mut results = Vec::new();
        for trigger in triggers.into_iter().filter(|trigger| trigger.enabled) {
            let result = match trigger.condition {
                TriggerCondition::Manual => TriggerResult {
                    triggered: false,
                    trigger_id: trigger.id,
                    new_run_id: None,
                    reason: "Manual trigger requires explicit invocation".to_string(),
                },
                TriggerCondition::OnComplete => self.fire(&trigger, &run.subject_id, now)?,
                TriggerCondition::OnApprove => {
                    if self.has_approval(&run)? {
                        self.fire(&trigger, &run.subject_id, now)?
                    } else {
                        TriggerResult {
                            triggered: false,
                            trigger_id: trigger.id,
                            new_run_id: None,
                            reason: format!("Condition \"{}\" not met", trigger.condition),
                        }
                    }
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    /// Fires regardless of condition; only the enabled flag is honored.
    pub fn fire_trigger(
        &self,
        trigger_id: &str,
        subject_id: &str,
        now: i64,
    ) -> Result<TriggerResult, StoreError> {
        let trigger = self
            .get_trigger(trigger_id)?
            .ok_or_else(|| trigger_not_found(trigger_id))?;
        if !trigger.enabled {
            return Ok(TriggerResult {
                triggered: false,
                trigger_id: trigger.id,
                new_run_id: None,
                reason: "Trigger is disabled".to_string(),
            });
        }
        self.fire(&trigger, subject_id, now)
    }

    fn fire(
        &self,
        trigger: &WorkflowTrigger,
        subject_id: &str,
        now: i64,
    ) -> Result<TriggerResult, StoreError> {
        let new_run = RunStore::new(self.db)
            .create(NewRun::new(trigger.target_type.clone(), subject_id), now)?;
        Ok(TriggerResult {
            triggered: true,
            trigger_id: trigger.id.clone(),
            new_run_id: Some(new_run.id),
            reason: format!("Trigger \"{}\" fired successfully", trigger.name),
        })
    }

    fn has_approval(&self, run: &WorkflowRun) -> Result<bool, StoreError> {
        let events = EventLog::new(self.db).events_for_run(&run.id)?;
        Ok(ApprovalEvidence::is_present(&events))
    }

    fn query(
        &self,
        where_clause: &str,
        key: Option<&str>,
    ) -> Result<Vec<WorkflowTrigger>, StoreError> {
        let connection = self.db.connect()?;
        let mut statement = connection
            .prepare(&format!(
                "SELECT {TRIGGER_COLUMNS} FROM workflow_triggers {where_clause} ORDER BY seq ASC"
            ))
            .map_err(sql_error)?;
        let rows = match key {
            Some(key) => statement.query_map(params![key], raw_trigger),
            None => statement.query_map([], raw_trigger),
        }
        .map_err(sql_error)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(trigger_from_raw(row.map_err(sql_error)?)?);
        }
        Ok(out)
    }
}

fn trigger_not_found(trigger_id: &str) -> StoreError {
    StoreError::NotFound {
        entity: "trigger",
        id: trigger_id.to_string(),
    }
}

fn raw_trigger(row: &Row<'_>) -> rusqlite::Result<RawTrigger> {
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

fn trigger_from_raw(raw: RawTrigger) -> Result<WorkflowTrigger, StoreError> {
    let (
        id,
        name,
        source_raw,
        target_raw,
        condition_raw,
        enabled,
        config_raw,
        created_at,
        updated_at,
    ) = raw;
    let source_type = PipelineType::parse(&source_raw).map_err(|_| StoreError::InvalidColumn {
        column: "source_type",
        value: source_raw.clone(),
    })?;
    let target_type = PipelineType::parse(&target_raw).map_err(|_| StoreError::InvalidColumn {
        column: "target_type",
        value: target_raw.clone(),
    })?;
    let condition =
        TriggerCondition::parse(&condition_raw).map_err(|_| StoreError::InvalidColumn {
            column: "trigger_condition",
            value: condition_raw.clone(),
        })?;
    let config = serde_json::from_str(&config_raw).map_err(json_error("config"))?;
    Ok(WorkflowTrigger {
        id,
        name,
        source_type,
        target_type,
        condition,
        enabled,
        config,
        created_at,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: i64, event_type: EventType, approved: Option<bool>) -> WorkflowEvent {
        let mut payload = Map::new();
        if let Some(approved) = approved {
            payload.insert("approved".to_string(), Value::Bool(approved));
        }
        WorkflowEvent {
            seq,
            id: format!("evt-{seq}"),
            run_id: "run-1".to_string(),
            event_type,
            actor: None,
            payload,
            created_at: seq,
        }
    }

    #[test]
    fn approval_must_follow_latest_completion() {
        let stale = vec![
            event(1, EventType::Started, Some(true)),
            event(2, EventType::Completed, None),
        ];
        assert!(!ApprovalEvidence::is_present(&stale));

        let fresh = vec![
            event(1, EventType::Started, None),
            event(2, EventType::Completed, Some(true)),
        ];
        assert!(ApprovalEvidence::is_present(&fresh));
    }

    #[test]
    fn approval_without_completion_counts_any_event() {
        let events = vec![event(1, EventType::Resumed, Some(true))];
        assert!(ApprovalEvidence::is_present(&events));
        let denied = vec![event(1, EventType::Resumed, Some(false))];
        assert!(!ApprovalEvidence::is_present(&denied));
    }
}
