use crate::shared::ids::PipelineType;
use crate::store::error::{json_error, sql_error, StoreError};
use crate::store::Database;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedStep {
    pub step: String,
    pub result: Value,
    pub completed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRetry {
    pub step: String,
    pub error: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelItemState {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelItem {
    pub key: String,
    pub state: ParallelItemState,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDecision {
    pub step: String,
    pub option: String,
    #[serde(default)]
    pub input: Option<String>,
    pub decided_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelStatus {
    pub total: usize,
    pub completed: usize,
    pub failed: Vec<String>,
    pub pending: Vec<String>,
}

impl ParallelStatus {
    pub fn is_resolved(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Durable execution cursor for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub run_id: String,
    pub pipeline_type: PipelineType,
    pub current_step: String,
    #[serde(default)]
    pub completed_steps: Vec<CompletedStep>,
    #[serde(default)]
    pub pending_retry: Option<PendingRetry>,
    #[serde(default)]
    pub parallel: Option<Vec<ParallelItem>>,
    #[serde(default)]
    pub gate_decision: Option<GateDecision>,
    #[serde(default)]
    pub iteration_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub updated_at: i64,
}

impl Checkpoint {
    pub fn new(run_id: &str, pipeline_type: PipelineType, initial_step: &str, now: i64) -> Self {
        Self {
            run_id: run_id.to_string(),
            pipeline_type,
            current_step: initial_step.to_string(),
            completed_steps: Vec::new(),
            pending_retry: None,
            parallel: None,
            gate_decision: None,
            iteration_counts: BTreeMap::new(),
            data: Map::new(),
            updated_at: now,
        }
    }

    pub fn iteration_count(&self, step: &str) -> u32 {
        self.iteration_counts.get(step).copied().unwrap_or(0)
    }

    pub fn completed_step_names(&self) -> Vec<String> {
        self.completed_steps
            .iter()
            .map(|completed| completed.step.clone())
            .collect()
    }

    pub fn last_result(&self) -> Option<&Value> {
        self.completed_steps.last().map(|completed| &completed.result)
    }

    pub fn parallel_status(&self) -> Option<ParallelStatus> {
        let items = self.parallel.as_ref()?;
        let mut status = ParallelStatus {
            total: items.len(),
            completed: 0,
            failed: Vec::new(),
            pending: Vec::new(),
        };
        for item in items {
            match item.state {
                ParallelItemState::Completed => status.completed += 1,
                ParallelItemState::Failed => status.failed.push(item.key.clone()),
                ParallelItemState::Pending => status.pending.push(item.key.clone()),
            }
        }
        Some(status)
    }

    /// Per-item results keyed by item, in fan-out order.
    pub fn parallel_results(&self) -> Map<String, Value> {
        let mut folded = Map::new();
        for item in self.parallel.iter().flatten() {
            folded.insert(
                item.key.clone(),
                item.result.clone().unwrap_or(Value::Null),
            );
        }
        folded
    }

    pub fn parallel_item(&self, key: &str) -> Option<&ParallelItem> {
        self.parallel.as_ref()?.iter().find(|item| item.key == key)
    }

    pub fn set_current_step(&mut self, step: &str) {
        self.current_step = step.to_string();
    }

    /// Appends the step, or replaces its earlier entry in place so names
    /// stay unique. Clears any pending retry.
    pub fn record_step_completion(&mut self, step: &str, result: Value, now: i64) {
        let entry = CompletedStep {
            step: step.to_string(),
            result,
            completed_at: now,
        };
        match self
            .completed_steps
            .iter_mut()
            .find(|completed| completed.step == step)
        {
            Some(existing) => *existing = entry,
            None => self.completed_steps.push(entry),
        }
        self.pending_retry = None;
    }

    pub fn record_pending_retry(&mut self, step: &str, error: &str, attempt: u32) {
        self.pending_retry = Some(PendingRetry {
            step: step.to_string(),
            error: error.to_string(),
            attempt,
        });
    }

    pub fn clear_pending_retry(&mut self) {
        self.pending_retry = None;
    }

    pub fn initialize_parallel_results(&mut self, keys: &[String]) {
        self.parallel = Some(
            keys.iter()
                .map(|key| ParallelItem {
                    key: key.clone(),
                    state: ParallelItemState::Pending,
                    result: None,
                    error: None,
                    retry_count: 0,
                })
                .collect(),
        );
    }

    pub fn record_parallel_item_completion(
        &mut self,
        key: &str,
        result: Value,
    ) -> Result<(), StoreError> {
        let item = self.parallel_item_mut(key)?;
        if item.state == ParallelItemState::Completed {
            return Ok(());
        }
        item.state = ParallelItemState::Completed;
        item.result = Some(result);
        item.error = None;
        Ok(())
    }

    pub fn record_parallel_item_failure(&mut self, key: &str, error: &str) -> Result<(), StoreError> {
        let item = self.parallel_item_mut(key)?;
        // Only a pending item can fail; a repeat delivery must not spend budget.
        if item.state != ParallelItemState::Pending {
            return Ok(());
        }
        item.state = ParallelItemState::Failed;
        item.error = Some(error.to_string());
        item.retry_count += 1;
        Ok(())
    }

    /// Marks failed items pending again; retry counts are kept.
    pub fn requeue_parallel_items(&mut self, keys: &[String]) -> Result<(), StoreError> {
        for key in keys {
            let item = self.parallel_item_mut(key)?;
            if item.state == ParallelItemState::Failed {
                item.state = ParallelItemState::Pending;
            }
        }
        Ok(())
    }

    pub fn clear_parallel_results(&mut self) {
        self.parallel = None;
    }

    pub fn record_gate_decision(&mut self, step: &str, option: &str, input: Option<&str>, now: i64) {
        self.gate_decision = Some(GateDecision {
            step: step.to_string(),
            option: option.to_string(),
            input: input.map(str::to_string),
            decided_at: now,
        });
    }

    pub fn clear_gate_decision(&mut self) {
        self.gate_decision = None;
    }

    pub fn increment_iteration(&mut self, step: &str) -> u32 {
        let count = self.iteration_counts.entry(step.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn set_data(&mut self, key: &str, value: Value) {
        self.data.insert(key.to_string(), value);
    }

    fn parallel_item_mut(&mut self, key: &str) -> Result<&mut ParallelItem, StoreError> {
        let run_id = self.run_id.clone();
        let items = self
            .parallel
            .as_mut()
            .ok_or_else(|| StoreError::ParallelNotInitialized {
                run_id: run_id.clone(),
            })?;
        items
            .iter_mut()
            .find(|item| item.key == key)
            .ok_or_else(|| StoreError::UnknownParallelItem {
                run_id,
                item: key.to_string(),
            })
    }
}

/// Persists checkpoints. Every mutation is read, apply, write and commit in
/// one immediate transaction, and the committed value is returned.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointManager<'a> {
    db: &'a Database,
}

impl<'a> CheckpointManager<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn create(
        &self,
        run_id: &str,
        pipeline_type: &PipelineType,
        initial_step: &str,
        now: i64,
    ) -> Result<Checkpoint, StoreError> {
        self.create_with_data(run_id, pipeline_type, initial_step, Map::new(), now)
    }

    pub fn create_with_data(
        &self,
        run_id: &str,
        pipeline_type: &PipelineType,
        initial_step: &str,
        data: Map<String, Value>,
        now: i64,
    ) -> Result<Checkpoint, StoreError> {
        let mut checkpoint = Checkpoint::new(run_id, pipeline_type.clone(), initial_step, now);
        checkpoint.data = data;
        self.db.write(|tx| {
            if read_checkpoint(tx, run_id)?.is_some() {
                return Err(StoreError::CheckpointExists {
                    run_id: run_id.to_string(),
                });
            }
            let body = serde_json::to_string(&checkpoint).map_err(json_error("body"))?;
            tx.execute(
                "
                INSERT INTO checkpoints (run_id, pipeline_type, current_step, body, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ",
                params![
                    run_id,
                    checkpoint.pipeline_type.as_str(),
                    checkpoint.current_step,
                    body,
                    now
                ],
            )
            .map_err(sql_error)?;
            Ok(checkpoint.clone())
        })
    }

    pub fn load(&self, run_id: &str) -> Result<Checkpoint, StoreError> {
        self.try_load(run_id)?.ok_or_else(|| StoreError::NotFound {
            entity: "checkpoint",
            id: run_id.to_string(),
        })
    }

    pub fn try_load(&self, run_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let connection = self.db.connect()?;
        read_checkpoint(&connection, run_id)
    }

    /// Applies `apply` to the stored checkpoint atomically. Errors from
    /// `apply` roll the transaction back and nothing is written.
    pub fn update<F>(&self, run_id: &str, now: i64, apply: F) -> Result<Checkpoint, StoreError>
    where
        F: FnOnce(&mut Checkpoint) -> Result<(), StoreError>,
    {
        self.db.write(|tx| {
            let mut checkpoint =
                read_checkpoint(tx, run_id)?.ok_or_else(|| StoreError::NotFound {
                    entity: "checkpoint",
                    id: run_id.to_string(),
                })?;
            apply(&mut checkpoint)?;
            checkpoint.updated_at = now;
            let body = serde_json::to_string(&checkpoint).map_err(json_error("body"))?;
            tx.execute(
                "
                UPDATE checkpoints SET current_step = ?2, body = ?3, updated_at = ?4
                WHERE run_id = ?1
                ",
                params![run_id, checkpoint.current_step, body, now],
            )
            .map_err(sql_error)?;
            Ok(checkpoint)
        })
    }

    pub fn set_current_step(
        &self,
        run_id: &str,
        step: &str,
        now: i64,
    ) -> Result<Checkpoint, StoreError> {
        self.update(run_id, now, |checkpoint| {
            checkpoint.set_current_step(step);
            Ok(())
        })
    }

    pub fn record_step_completion(
        &self,
        run_id: &str,
        step: &str,
        result: Value,
        now: i64,
    ) -> Result<Checkpoint, StoreError> {
        self.update(run_id, now, |checkpoint| {
            checkpoint.record_step_completion(step, result, now);
            Ok(())
        })
    }

    pub fn record_pending_retry(
        &self,
        run_id: &str,
        step: &str,
        error: &str,
        attempt: u32,
        now: i64,
    ) -> Result<Checkpoint, StoreError> {
        self.update(run_id, now, |checkpoint| {
            checkpoint.record_pending_retry(step, error, attempt);
            Ok(())
        })
    }

    pub fn clear_pending_retry(&self, run_id: &str, now: i64) -> Result<Checkpoint, StoreError> {
        self.update(run_id, now, |checkpoint| {
            checkpoint.clear_pending_retry();
            Ok(())
        })
    }

    pub fn initialize_parallel_results(
        &self,
        run_id: &str,
        keys: &[String],
        now: i64,
    ) -> Result<Checkpoint, StoreError> {
        self.update(run_id, now, |checkpoint| {
            checkpoint.initialize_parallel_results(keys);
            Ok(())
        })
    }

    pub fn record_parallel_item_completion(
        &self,
        run_id: &str,
        key: &str,
        result: Value,
        now: i64,
    ) -> Result<Checkpoint, StoreError> {
        self.update(run_id, now, |checkpoint| {
            checkpoint.record_parallel_item_completion(key, result)
        })
    }

    pub fn record_parallel_item_failure(
        &self,
        run_id: &str,
        key: &str,
        error: &str,
        now: i64,
    ) -> Result<Checkpoint, StoreError> {
        self.update(run_id, now, |checkpoint| {
            checkpoint.record_parallel_item_failure(key, error)
        })
    }

    pub fn requeue_parallel_items(
        &self,
        run_id: &str,
        keys: &[String],
        now: i64,
    ) -> Result<Checkpoint, StoreError> {
        self.update(run_id, now, |checkpoint| {
            checkpoint.requeue_parallel_items(keys)
        })
    }

    pub fn clear_parallel_results(&self, run_id: &str, now: i64) -> Result<Checkpoint, StoreError> {
        self.update(run_id, now, |checkpoint| {
            checkpoint.clear_parallel_results();
            Ok(())
        })
    }

    pub fn get_parallel_status(&self, run_id: &str) -> Result<Option<ParallelStatus>, StoreError> {
        Ok(self.load(run_id)?.parallel_status())
    }

    pub fn record_gate_decision(
        &self,
        run_id: &str,
        step: &str,
        option: &str,
        input: Option<&str>,
        now: i64,
    ) -> Result<Checkpoint, StoreError> {
        self.update(run_id, now, |checkpoint| {
            checkpoint.record_gate_decision(step, option, input, now);
            Ok(())
        })
    }

    pub fn clear_gate_decision(&self, run_id: &str, now: i64) -> Result<Checkpoint, StoreError> {
        self.update(run_id, now, |checkpoint| {
            checkpoint.clear_gate_decision();
            Ok(())
        })
    }

    pub fn increment_iteration(
        &self,
        run_id: &str,
        step: &str,
        now: i64,
    ) -> Result<Checkpoint, StoreError> {
        self.update(run_id, now, |checkpoint| {
            checkpoint.increment_iteration(step);
            Ok(())
        })
    }

    pub fn get_iteration_count(&self, run_id: &str, step: &str) -> Result<u32, StoreError> {
        Ok(self.load(run_id)?.iteration_count(step))
    }

    pub fn set_data(
        &self,
        run_id: &str,
        key: &str,
        value: Value,
        now: i64,
    ) -> Result<Checkpoint, StoreError> {
        self.update(run_id, now, |checkpoint| {
            checkpoint.set_data(key, value);
            Ok(())
        })
    }

    /// Run ids whose checkpoint holds a pending retry, oldest update first.
    pub fn runs_with_pending_retries(&self) -> Result<Vec<String>, StoreError> {
        let connection = self.db.connect()?;
        let mut statement = connection
            .prepare("SELECT run_id, body FROM checkpoints ORDER BY updated_at ASC, run_id ASC")
            .map_err(sql_error)?;
        let rows = statement
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(sql_error)?;
        let mut out = Vec::new();
        for row in rows {
            let (run_id, body) = row.map_err(sql_error)?;
            let checkpoint: Checkpoint =
                serde_json::from_str(&body).map_err(json_error("body"))?;
            if checkpoint.pending_retry.is_some() {
                out.push(run_id);
            }
        }
        Ok(out)
    }
}

fn read_checkpoint(connection: &Connection, run_id: &str) -> Result<Option<Checkpoint>, StoreError> {
    let body = connection
        .query_row(
            "SELECT body FROM checkpoints WHERE run_id = ?1",
            params![run_id],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(sql_error)?;
    body.map(|raw| serde_json::from_str(&raw).map_err(json_error("body")))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn checkpoint() -> Checkpoint {
        Checkpoint::new(
            "run-1",
            PipelineType::parse("editing").expect("pipeline type"),
            "draft",
            10,
        )
    }

    #[test]
    fn completing_a_step_twice_replaces_the_entry() {
        let mut cp = checkpoint();
        cp.record_pending_retry("draft", "missing output", 1);
        cp.record_step_completion("draft", json!({"v": 1}), 11);
        cp.record_step_completion("review", json!({}), 12);
        cp.record_step_completion("draft", json!({"v": 2}), 13);

        assert_eq!(cp.completed_step_names(), vec!["draft", "review"]);
        assert_eq!(cp.completed_steps[0].result, json!({"v": 2}));
        assert!(cp.pending_retry.is_none());
    }

    #[test]
    fn parallel_outcomes_track_retries_and_ignore_late_duplicates() {
        let mut cp = checkpoint();
        cp.initialize_parallel_results(&["a".to_string(), "b".to_string()]);
        cp.record_parallel_item_failure("a", "timeout").expect("fail a");
        cp.record_parallel_item_completion("b", json!(2)).expect("b");
        cp.record_parallel_item_failure("b", "late").expect("late b");

        let status = cp.parallel_status().expect("status");
        assert_eq!(status.total, 2);
        assert_eq!(status.completed, 1);
        assert_eq!(status.failed, vec!["a"]);
        assert!(status.is_resolved());
        assert_eq!(cp.parallel_item("a").expect("a").retry_count, 1);
        assert_eq!(cp.parallel_item("b").expect("b").retry_count, 0);

        cp.requeue_parallel_items(&["a".to_string()]).expect("requeue");
        let status = cp.parallel_status().expect("status");
        assert_eq!(status.pending, vec!["a"]);
        assert_eq!(cp.parallel_item("a").expect("a").retry_count, 1);
    }

    #[test]
    fn repeated_failure_for_a_failed_item_keeps_its_retry_count() {
        let mut cp = checkpoint();
        cp.initialize_parallel_results(&["a".to_string()]);
        cp.record_parallel_item_failure("a", "timeout").expect("fail a");
        cp.record_parallel_item_failure("a", "timeout").expect("redelivered");
        assert_eq!(cp.parallel_item("a").expect("a").retry_count, 1);

        cp.requeue_parallel_items(&["a".to_string()]).expect("requeue");
        cp.record_parallel_item_failure("a", "timeout again").expect("fail again");
        let item = cp.parallel_item("a").expect("a");
        assert_eq!(item.retry_count, 2);
        assert_eq!(item.error.as_deref(), Some("timeout again"));
    }

    #[test]
    fn parallel_outcomes_require_initialized_known_items() {
        let mut cp = checkpoint();
        assert!(matches!(
            cp.record_parallel_item_completion("a", json!(1)),
            Err(StoreError::ParallelNotInitialized { .. })
        ));
        cp.initialize_parallel_results(&["a".to_string()]);
        assert!(matches!(
            cp.record_parallel_item_failure("z", "boom"),
            Err(StoreError::UnknownParallelItem { .. })
        ));
    }
}
