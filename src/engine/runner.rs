use crate::config::{EngineSettings, PipelineRegistry};
use crate::engine::checkpoint::{Checkpoint, CheckpointManager, ParallelItemState, PendingRetry};
use crate::engine::definition::{
    ConditionContext, GateOption, HumanGate, NextRule, PipelineDefinition, StepDefinition,
    StepKind,
};
use crate::engine::error::EngineError;
use crate::engine::predicate::{lookup_map_path, lookup_path};
use crate::shared::ids::PipelineType;
use crate::shared::logging::append_engine_event;
use crate::store::{
    ConditionSource, Database, EventType, NewRun, RunStatus, RunStore, StoreConditions,
    StoreError, WorkflowRun,
};
use crate::triggers::{TriggerEngine, TriggerResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryLimits {
    pub step_max_retries: u32,
    pub parallel_max_retries: u32,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            step_max_retries: 1,
            parallel_max_retries: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    AwaitingHuman,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryContext {
    pub error: String,
    pub attempt: u32,
}

/// Work handed to an external executor for a command step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepInput {
    pub run_id: String,
    pub step: String,
    pub command: String,
    pub checkpoint: Checkpoint,
    #[serde(default)]
    pub retry_context: Option<RetryContext>,
}

/// What an executor reports back through `process_step_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutput {
    #[serde(default)]
    pub result: Value,
    pub postconditions_passed: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub next_step_hint: Option<String>,
    /// Merged into the run's data bag on success.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl StepOutput {
    pub fn passed(result: Value) -> Self {
        Self {
            result,
            postconditions_passed: true,
            error: None,
            next_step_hint: None,
            data: Map::new(),
        }
    }

    pub fn failed(error: &str) -> Self {
        Self {
            result: Value::Null,
            postconditions_passed: false,
            error: Some(error.to_string()),
            next_step_hint: None,
            data: Map::new(),
        }
    }

    pub fn with_hint(mut self, step: &str) -> Self {
        self.next_step_hint = Some(step.to_string());
        self
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatePrompt {
    pub step: String,
    pub prompt: String,
    pub context: Map<String, Value>,
    pub options: Vec<GateOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeContext {
    pub pipeline_type: PipelineType,
    pub run_id: String,
    pub current_step: String,
    pub completed_steps: Vec<String>,
    pub last_step_output: Option<Value>,
    pub pending_retry: Option<PendingRetry>,
    pub parallel_status: Option<ParallelProgress>,
}

impl ResumeContext {
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            pipeline_type: checkpoint.pipeline_type.clone(),
            run_id: checkpoint.run_id.clone(),
            current_step: checkpoint.current_step.clone(),
            completed_steps: checkpoint.completed_step_names(),
            last_step_output: checkpoint.last_result().cloned(),
            pending_retry: checkpoint.pending_retry.clone(),
            parallel_status: checkpoint.parallel_status().map(|status| ParallelProgress {
                total: status.total,
                completed: status.completed,
                failed: status.failed,
            }),
        }
    }
}

/// Result of every runner call that moves a run forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: String,
    pub status: ExecutionStatus,
    pub current_step: String,
    #[serde(default)]
    pub step_input: Option<StepInput>,
    #[serde(default)]
    pub gate: Option<GatePrompt>,
    #[serde(default)]
    pub parallel_items: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub chained: Vec<TriggerResult>,
    pub resume_context: ResumeContext,
}

impl RunOutcome {
    fn at(checkpoint: &Checkpoint, status: ExecutionStatus) -> Self {
        Self {
            run_id: checkpoint.run_id.clone(),
            status,
            current_step: checkpoint.current_step.clone(),
            step_input: None,
            gate: None,
            parallel_items: Vec::new(),
            error: None,
            chained: Vec::new(),
            resume_context: ResumeContext::from_checkpoint(checkpoint),
        }
    }

    fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "payload", rename_all = "snake_case")]
pub enum ItemOutcome {
    Succeeded(Value),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelRecord {
    pub all_resolved: bool,
    pub next: Option<RunOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSnapshot {
    pub run: WorkflowRun,
    pub resume_context: Option<ResumeContext>,
}

/// Walks pipeline definitions one step at a time. Holds no run state of its
/// own: every call reloads the run and its checkpoint from the database.
pub struct WorkflowRunner<'a> {
    db: &'a Database,
    pipelines: &'a PipelineRegistry,
    conditions: Box<dyn ConditionSource + 'a>,
    limits: RetryLimits,
    auto_chain_triggers: bool,
    log_path: PathBuf,
}

impl<'a> WorkflowRunner<'a> {
    pub fn new(db: &'a Database, pipelines: &'a PipelineRegistry, log_path: &Path) -> Self {
        Self {
            db,
            pipelines,
            conditions: Box::new(StoreConditions::new(db)),
            limits: RetryLimits::default(),
            auto_chain_triggers: true,
            log_path: log_path.to_path_buf(),
        }
    }

    pub fn from_settings(
        db: &'a Database,
        pipelines: &'a PipelineRegistry,
        settings: &EngineSettings,
    ) -> Self {
        Self::new(db, pipelines, &settings.paths().log_file)
            .with_limits(settings.retry_limits())
            .with_auto_chain_triggers(settings.auto_chain_triggers)
    }

    pub fn with_limits(mut self, limits: RetryLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_auto_chain_triggers(mut self, enabled: bool) -> Self {
        self.auto_chain_triggers = enabled;
        self
    }

    pub fn with_conditions(mut self, conditions: Box<dyn ConditionSource + 'a>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn limits(&self) -> RetryLimits {
        self.limits
    }

    pub fn start(
        &self,
        pipeline_type: &PipelineType,
        subject_id: &str,
        input_version_id: Option<&str>,
        now: i64,
    ) -> Result<RunOutcome, EngineError> {
        self.start_with_data(pipeline_type, subject_id, input_version_id, Map::new(), now)
    }

    pub fn start_with_data(
        &self,
        pipeline_type: &PipelineType,
        subject_id: &str,
        input_version_id: Option<&str>,
        data: Map<String, Value>,
        now: i64,
    ) -> Result<RunOutcome, EngineError> {
        let definition = self.definition(pipeline_type.as_str())?;
        let mut new_run = NewRun::new(pipeline_type.clone(), subject_id);
        if let Some(version_id) = input_version_id {
            new_run = new_run.with_input_version(version_id);
        }
        let run = self.runs().create(new_run, now)?;
        self.launch(definition, &run.id, data, now)
    }

    /// Continues a run from its checkpoint. A `pending` run without a
    /// checkpoint (one created by a trigger) is launched at its initial step.
    /// Failed parallel items are requeued whatever their retry count, so every
    /// resume allows one more dispatch past `parallel_max_retries`.
    pub fn resume(&self, run_id: &str, now: i64) -> Result<RunOutcome, EngineError> {
        let run = self.runs().require(run_id)?;
        if run.status.is_terminal() {
            return Err(EngineError::RunTerminal {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }
        let definition = self.definition(run.pipeline_type.as_str())?;
        let Some(checkpoint) = self.checkpoints().try_load(run_id)? else {
            if run.status == RunStatus::Pending {
                return self.launch(definition, run_id, Map::new(), now);
            }
            return Err(EngineError::MissingCheckpoint {
                run_id: run_id.to_string(),
            });
        };
        let step = step_of(definition, &checkpoint.current_step)?;

        match run.status {
            RunStatus::Paused => {
                if let (Some(gate), None) = (&step.human_gate, &checkpoint.pending_retry) {
                    let mut outcome = RunOutcome::at(&checkpoint, ExecutionStatus::AwaitingHuman);
                    outcome.gate = Some(gate_prompt(step, gate, &checkpoint));
                    return Ok(outcome);
                }
                self.reopen_run(&run, step.name.as_str(), Map::new(), now)?;
            }
            RunStatus::Pending => {
                self.runs().update_status(run_id, RunStatus::Running, now)?;
            }
            _ => {}
        }

        if checkpoint.pending_retry.is_some() {
            let checkpoint = self.checkpoints().clear_pending_retry(run_id, now)?;
            self.log(
                "retry_cleared",
                &[
                    ("run_id", json!(run_id)),
                    ("step", json!(checkpoint.current_step)),
                ],
            )?;
            return self.execute_step(definition, checkpoint, now);
        }

        if let Some(status) = checkpoint.parallel_status() {
            if status.pending.is_empty() && status.failed.is_empty() {
                return self.finish_parallel(definition, step, &checkpoint, now);
            }
            let checkpoint = if status.failed.is_empty() {
                checkpoint
            } else {
                self.checkpoints()
                    .requeue_parallel_items(run_id, &status.failed, now)?
            };
            let items = checkpoint
                .parallel_status()
                .map(|status| status.pending)
                .unwrap_or_default();
            self.log(
                "parallel_redispatched",
                &[("run_id", json!(run_id)), ("items", json!(items))],
            )?;
            let mut outcome = RunOutcome::at(&checkpoint, ExecutionStatus::Running);
            outcome.parallel_items = items;
            return Ok(outcome);
        }

        self.execute_step(definition, checkpoint, now)
    }

    pub fn handle_gate_decision(
        &self,
        run_id: &str,
        option: &str,
        input: Option<&str>,
        now: i64,
    ) -> Result<RunOutcome, EngineError> {
        let run = self.runs().require(run_id)?;
        if run.status.is_terminal() {
            return Err(EngineError::RunTerminal {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }
        let definition = self.definition(run.pipeline_type.as_str())?;
        let checkpoint = self.load_checkpoint(run_id)?;
        let step = step_of(definition, &checkpoint.current_step)?;
        let gate = step
            .human_gate
            .as_ref()
            .ok_or_else(|| EngineError::NoHumanGate {
                step: checkpoint.current_step.clone(),
            })?;
        let selected = gate
            .option(option)
            .ok_or_else(|| EngineError::InvalidGateOption {
                option: option.to_string(),
                valid: gate.labels(),
            })?;
        let input = input.map(str::trim).filter(|text| !text.is_empty());
        if selected.requires_input && input.is_none() {
            return Err(EngineError::GateInputRequired {
                option: option.to_string(),
            });
        }

        let step_name = step.name.as_str();
        self.checkpoints()
            .record_gate_decision(run_id, step_name, option, input, now)?;
        if run.status == RunStatus::Paused {
            let mut payload = Map::new();
            payload.insert("gateOption".to_string(), json!(option));
            self.reopen_run(&run, step_name, payload, now)?;
        }
        self.log(
            "gate_decision",
            &[
                ("run_id", json!(run_id)),
                ("step", json!(step_name)),
                ("option", json!(option)),
                ("next_step", json!(selected.next_step)),
            ],
        )?;

        let result = json!({ "option": option, "input": input });
        match &selected.next_step {
            None => {
                let checkpoint = self
                    .checkpoints()
                    .record_step_completion(run_id, step_name, result, now)?;
                self.complete_run(&checkpoint, selected.approves, now)
            }
            Some(next) => {
                let checkpoint = self.checkpoints().update(run_id, now, |cp| {
                    cp.record_step_completion(step_name, result, now);
                    cp.set_current_step(next.as_str());
                    cp.clear_gate_decision();
                    Ok(())
                })?;
                self.execute_step(definition, checkpoint, now)
            }
        }
    }

    pub fn record_parallel_item_result(
        &self,
        run_id: &str,
        item_key: &str,
        outcome: ItemOutcome,
        now: i64,
    ) -> Result<ParallelRecord, EngineError> {
        let run = self.require_running(run_id)?;
        let definition = self.definition(run.pipeline_type.as_str())?;
        let checkpoint = self.load_checkpoint(run_id)?;
        let step = step_of(definition, &checkpoint.current_step)?;
        if step.kind() != StepKind::Parallel {
            return Err(EngineError::NotParallelStep {
                step: checkpoint.current_step.clone(),
            });
        }

        let succeeded = matches!(outcome, ItemOutcome::Succeeded(_));
        let mut duplicate = false;
        let checkpoint = self.checkpoints().update(run_id, now, |cp| {
            duplicate = cp.parallel_item(item_key).is_some_and(|item| match outcome {
                ItemOutcome::Succeeded(_) => item.state == ParallelItemState::Completed,
                ItemOutcome::Failed(_) => item.state != ParallelItemState::Pending,
            });
            match outcome {
                ItemOutcome::Succeeded(result) => {
                    cp.record_parallel_item_completion(item_key, result)
                }
                ItemOutcome::Failed(error) => cp.record_parallel_item_failure(item_key, &error),
            }
        })?;
        self.log(
            "parallel_item_recorded",
            &[
                ("run_id", json!(run_id)),
                ("item", json!(item_key)),
                ("succeeded", json!(succeeded)),
                ("duplicate", json!(duplicate)),
            ],
        )?;

        let status = checkpoint
            .parallel_status()
            .ok_or_else(|| StoreError::ParallelNotInitialized {
                run_id: run_id.to_string(),
            })?;
        if duplicate || !status.is_resolved() {
            return Ok(ParallelRecord {
                all_resolved: status.is_resolved(),
                next: None,
            });
        }

        if !status.failed.is_empty() {
            let retryable: Vec<String> = status
                .failed
                .iter()
                .filter(|key| {
                    checkpoint
                        .parallel_item(key)
                        .is_some_and(|item| item.retry_count <= self.limits.parallel_max_retries)
                })
                .cloned()
                .collect();
            if !retryable.is_empty() {
                let checkpoint = self
                    .checkpoints()
                    .requeue_parallel_items(run_id, &retryable, now)?;
                self.log(
                    "parallel_retry",
                    &[("run_id", json!(run_id)), ("items", json!(retryable))],
                )?;
                let mut next = RunOutcome::at(&checkpoint, ExecutionStatus::Running);
                next.parallel_items = retryable;
                return Ok(ParallelRecord {
                    all_resolved: false,
                    next: Some(next),
                });
            }

            let message = format!(
                "Parallel execution failed for items: {}",
                status.failed.join(", ")
            );
            self.pause_run(&run, &checkpoint.current_step, &message, now)?;
            return Ok(ParallelRecord {
                all_resolved: true,
                next: Some(RunOutcome::at(&checkpoint, ExecutionStatus::Paused).with_error(message)),
            });
        }

        let next = self.finish_parallel(definition, step, &checkpoint, now)?;
        Ok(ParallelRecord {
            all_resolved: true,
            next: Some(next),
        })
    }

    /// Executor callback for command steps.
    pub fn process_step_result(
        &self,
        run_id: &str,
        output: StepOutput,
        now: i64,
    ) -> Result<RunOutcome, EngineError> {
        let run = self.require_running(run_id)?;
        let definition = self.definition(run.pipeline_type.as_str())?;
        let checkpoint = self.load_checkpoint(run_id)?;
        let step = step_of(definition, &checkpoint.current_step)?;
        if step.kind() != StepKind::Command {
            return Err(EngineError::NotCommandStep {
                step: checkpoint.current_step.clone(),
            });
        }
        if let Some(hint) = &output.next_step_hint {
            step_of(definition, hint)?;
        }
        let step_name = step.name.as_str();

        if !output.postconditions_passed {
            let attempt = checkpoint
                .pending_retry
                .as_ref()
                .filter(|retry| retry.step == step_name)
                .map_or(0, |retry| retry.attempt)
                + 1;
            let error = output
                .error
                .clone()
                .unwrap_or_else(|| "Postcondition failed".to_string());
            let checkpoint = self
                .checkpoints()
                .record_pending_retry(run_id, step_name, &error, attempt, now)?;

            if attempt > self.limits.step_max_retries {
                let message = format!(
                    "Step \"{step_name}\" failed after {} retries: {error}. Escalated to human.",
                    self.limits.step_max_retries
                );
                self.pause_run(&run, step_name, &message, now)?;
                return Ok(RunOutcome::at(&checkpoint, ExecutionStatus::Paused).with_error(message));
            }

            self.log(
                "step_retry",
                &[
                    ("run_id", json!(run_id)),
                    ("step", json!(step_name)),
                    ("attempt", json!(attempt)),
                    ("error", json!(error)),
                ],
            )?;
            return self.execute_step(definition, checkpoint, now);
        }

        let counts_iterations = step.max_iterations().is_some();
        let checkpoint = self.checkpoints().update(run_id, now, |cp| {
            for (key, value) in &output.data {
                cp.set_data(key, value.clone());
            }
            cp.record_step_completion(step_name, output.result.clone(), now);
            if counts_iterations {
                cp.increment_iteration(step_name);
            }
            Ok(())
        })?;
        self.log(
            "step_completed",
            &[("run_id", json!(run_id)), ("step", json!(step_name))],
        )?;
        self.advance(
            definition,
            step,
            checkpoint,
            &output.result,
            output.next_step_hint.as_deref(),
            now,
        )
    }

    pub fn get_state(&self, run_id: &str) -> Result<RunSnapshot, EngineError> {
        let run = self.runs().require(run_id)?;
        let resume_context = self
            .checkpoints()
            .try_load(run_id)?
            .map(|checkpoint| ResumeContext::from_checkpoint(&checkpoint));
        Ok(RunSnapshot {
            run,
            resume_context,
        })
    }

    /// Failure messages for the current step's postconditions; empty when
    /// all of them hold.
    pub fn check_postconditions(&self, run_id: &str) -> Result<Vec<String>, EngineError> {
        let run = self.runs().require(run_id)?;
        let definition = self.definition(run.pipeline_type.as_str())?;
        let checkpoint = self.load_checkpoint(run_id)?;
        let step = step_of(definition, &checkpoint.current_step)?;
        let ctx = ConditionContext {
            run: &run,
            checkpoint: &checkpoint,
            source: self.conditions.as_ref(),
        };
        let mut failures = Vec::new();
        for condition in &step.postconditions {
            if !condition.evaluate(&ctx)? {
                failures.push(condition.failure_message("Postcondition"));
            }
        }
        Ok(failures)
    }

    pub fn set_run_data(
        &self,
        run_id: &str,
        key: &str,
        value: Value,
        now: i64,
    ) -> Result<Checkpoint, EngineError> {
        self.checkpoints()
            .set_data(run_id, key, value, now)
            .map_err(|err| EngineError::from_checkpoint_load(run_id, err))
    }

    fn launch(
        &self,
        definition: &PipelineDefinition,
        run_id: &str,
        data: Map<String, Value>,
        now: i64,
    ) -> Result<RunOutcome, EngineError> {
        let initial_step = definition.initial_step.as_str();
        let checkpoint = self.checkpoints().create_with_data(
            run_id,
            &definition.pipeline_type,
            initial_step,
            data,
            now,
        )?;
        let mut payload = Map::new();
        payload.insert(
            "pipelineType".to_string(),
            json!(definition.pipeline_type.as_str()),
        );
        payload.insert("initialStep".to_string(), json!(initial_step));
        self.runs().update_status_with_event(
            run_id,
            RunStatus::Running,
            EventType::Started,
            payload,
            now,
        )?;
        self.log(
            "run_started",
            &[
                ("run_id", json!(run_id)),
                ("pipeline_type", json!(definition.pipeline_type.as_str())),
                ("step", json!(initial_step)),
            ],
        )?;
        self.execute_step(definition, checkpoint, now)
    }

    fn execute_step(
        &self,
        definition: &PipelineDefinition,
        checkpoint: Checkpoint,
        now: i64,
    ) -> Result<RunOutcome, EngineError> {
        let step = step_of(definition, &checkpoint.current_step)?;
        let run = self.runs().require(&checkpoint.run_id)?;
        let ctx = ConditionContext {
            run: &run,
            checkpoint: &checkpoint,
            source: self.conditions.as_ref(),
        };
        for condition in &step.preconditions {
            if !condition.evaluate(&ctx)? {
                let message = condition.failure_message("Precondition");
                self.fail_run(&run, step.name.as_str(), &message, now)?;
                return Ok(RunOutcome::at(&checkpoint, ExecutionStatus::Failed).with_error(message));
            }
        }

        if let Some(gate) = &step.human_gate {
            let reason = format!("awaiting human decision at step `{}`", step.name);
            self.pause_run(&run, step.name.as_str(), &reason, now)?;
            let mut outcome = RunOutcome::at(&checkpoint, ExecutionStatus::AwaitingHuman);
            outcome.gate = Some(gate_prompt(step, gate, &checkpoint));
            return Ok(outcome);
        }

        if let Some(key) = &step.parallel_key {
            let items = parallel_items(&checkpoint, step.name.as_str(), key)?;
            let checkpoint = self
                .checkpoints()
                .initialize_parallel_results(&checkpoint.run_id, &items, now)?;
            self.log(
                "parallel_dispatched",
                &[
                    ("run_id", json!(checkpoint.run_id)),
                    ("step", json!(step.name.as_str())),
                    ("items", json!(items)),
                ],
            )?;
            let mut outcome = RunOutcome::at(&checkpoint, ExecutionStatus::Running);
            outcome.parallel_items = items;
            return Ok(outcome);
        }

        let retry_context = checkpoint
            .pending_retry
            .as_ref()
            .filter(|retry| retry.step == checkpoint.current_step)
            .map(|retry| RetryContext {
                error: retry.error.clone(),
                attempt: retry.attempt,
            });
        self.log(
            "step_dispatched",
            &[
                ("run_id", json!(checkpoint.run_id)),
                ("step", json!(step.name.as_str())),
                (
                    "attempt",
                    json!(retry_context.as_ref().map_or(0, |retry| retry.attempt)),
                ),
            ],
        )?;
        let mut outcome = RunOutcome::at(&checkpoint, ExecutionStatus::Running);
        outcome.step_input = Some(StepInput {
            run_id: checkpoint.run_id.clone(),
            step: checkpoint.current_step.clone(),
            command: step.command.clone(),
            checkpoint,
            retry_context,
        });
        Ok(outcome)
    }

    fn finish_parallel(
        &self,
        definition: &PipelineDefinition,
        step: &StepDefinition,
        checkpoint: &Checkpoint,
        now: i64,
    ) -> Result<RunOutcome, EngineError> {
        let step_name = step.name.as_str();
        let counts_iterations = step.max_iterations().is_some();
        let mut folded = Value::Null;
        let checkpoint = self.checkpoints().update(&checkpoint.run_id, now, |cp| {
            if cp.parallel.is_none() {
                return Err(StoreError::ParallelNotInitialized {
                    run_id: cp.run_id.clone(),
                });
            }
            let result = Value::Object(cp.parallel_results());
            cp.record_step_completion(step_name, result.clone(), now);
            cp.clear_parallel_results();
            if counts_iterations {
                cp.increment_iteration(step_name);
            }
            folded = result;
            Ok(())
        })?;
        self.log(
            "parallel_folded",
            &[
                ("run_id", json!(checkpoint.run_id)),
                ("step", json!(step_name)),
            ],
        )?;
        self.advance(definition, step, checkpoint, &folded, None, now)
    }

    fn advance(
        &self,
        definition: &PipelineDefinition,
        step: &StepDefinition,
        checkpoint: Checkpoint,
        result: &Value,
        hint: Option<&str>,
        now: i64,
    ) -> Result<RunOutcome, EngineError> {
        match evaluate_next_step(step, &checkpoint, result, hint) {
            None => self.complete_run(&checkpoint, false, now),
            Some(next) => {
                let checkpoint =
                    self.checkpoints()
                        .set_current_step(&checkpoint.run_id, &next, now)?;
                self.execute_step(definition, checkpoint, now)
            }
        }
    }

    fn complete_run(
        &self,
        checkpoint: &Checkpoint,
        approved: bool,
        now: i64,
    ) -> Result<RunOutcome, EngineError> {
        let run_id = checkpoint.run_id.as_str();
        let mut payload = Map::new();
        payload.insert("step".to_string(), json!(checkpoint.current_step));
        if approved {
            payload.insert("approved".to_string(), Value::Bool(true));
        }
        self.runs().update_status_with_event(
            run_id,
            RunStatus::Completed,
            EventType::Completed,
            payload,
            now,
        )?;
        self.log(
            "run_completed",
            &[
                ("run_id", json!(run_id)),
                ("step", json!(checkpoint.current_step)),
                ("approved", json!(approved)),
            ],
        )?;

        let mut outcome = RunOutcome::at(checkpoint, ExecutionStatus::Completed);
        if self.auto_chain_triggers {
            let chained = TriggerEngine::new(self.db).check_triggers(run_id, now)?;
            let fired: Vec<&str> = chained
                .iter()
                .filter_map(|result| result.new_run_id.as_deref())
                .collect();
            self.log(
                "triggers_checked",
                &[
                    ("run_id", json!(run_id)),
                    ("evaluated", json!(chained.len())),
                    ("new_runs", json!(fired)),
                ],
            )?;
            outcome.chained = chained;
        }
        Ok(outcome)
    }

    fn pause_run(
        &self,
        run: &WorkflowRun,
        step: &str,
        reason: &str,
        now: i64,
    ) -> Result<(), EngineError> {
        if run.status == RunStatus::Paused {
            return Ok(());
        }
        let mut payload = Map::new();
        payload.insert("step".to_string(), json!(step));
        payload.insert("reason".to_string(), json!(reason));
        self.runs().update_status_with_event(
            &run.id,
            RunStatus::Paused,
            EventType::Paused,
            payload,
            now,
        )?;
        self.log(
            "run_paused",
            &[
                ("run_id", json!(run.id)),
                ("step", json!(step)),
                ("reason", json!(reason)),
            ],
        )
    }

    fn reopen_run(
        &self,
        run: &WorkflowRun,
        step: &str,
        mut payload: Map<String, Value>,
        now: i64,
    ) -> Result<(), EngineError> {
        payload.insert("step".to_string(), json!(step));
        self.runs().update_status_with_event(
            &run.id,
            RunStatus::Running,
            EventType::Resumed,
            payload,
            now,
        )?;
        self.log(
            "run_resumed",
            &[("run_id", json!(run.id)), ("step", json!(step))],
        )
    }

    fn fail_run(
        &self,
        run: &WorkflowRun,
        step: &str,
        reason: &str,
        now: i64,
    ) -> Result<(), EngineError> {
        let mut payload = Map::new();
        payload.insert("step".to_string(), json!(step));
        payload.insert("reason".to_string(), json!(reason));
        self.runs().update_status_with_event(
            &run.id,
            RunStatus::Failed,
            EventType::Failed,
            payload,
            now,
        )?;
        self.log(
            "run_failed",
            &[
                ("run_id", json!(run.id)),
                ("step", json!(step)),
                ("reason", json!(reason)),
            ],
        )
    }

    fn require_running(&self, run_id: &str) -> Result<WorkflowRun, EngineError> {
        let run = self.runs().require(run_id)?;
        if run.status != RunStatus::Running {
            return Err(EngineError::RunNotRunning {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }
        Ok(run)
    }

    fn definition(&self, pipeline_type: &str) -> Result<&'a PipelineDefinition, EngineError> {
        self.pipelines
            .get(pipeline_type)
            .ok_or_else(|| EngineError::UnknownPipeline {
                pipeline_type: pipeline_type.to_string(),
            })
    }

    fn load_checkpoint(&self, run_id: &str) -> Result<Checkpoint, EngineError> {
        self.checkpoints()
            .load(run_id)
            .map_err(|err| EngineError::from_checkpoint_load(run_id, err))
    }

    fn runs(&self) -> RunStore<'a> {
        RunStore::new(self.db)
    }

    fn checkpoints(&self) -> CheckpointManager<'a> {
        CheckpointManager::new(self.db)
    }

    fn log(&self, event: &str, fields: &[(&str, Value)]) -> Result<(), EngineError> {
        append_engine_event(&self.log_path, event, fields).map_err(|source| EngineError::Log {
            path: self.log_path.display().to_string(),
            source,
        })
    }
}

/// Picks the step after `step`. Order for branch rules: an exhausted
/// iteration budget takes `on_false`, then an explicit hint, then the
/// predicate, and `on_false` when the predicate cannot be answered.
pub fn evaluate_next_step(
    step: &StepDefinition,
    checkpoint: &Checkpoint,
    result: &Value,
    hint: Option<&str>,
) -> Option<String> {
    match &step.next {
        None => None,
        Some(NextRule::Step(target)) => Some(target.to_string()),
        Some(NextRule::Branch(branch)) => {
            if let Some(max) = branch.max_iterations {
                if checkpoint.iteration_count(step.name.as_str()) >= max {
                    return Some(branch.on_false.to_string());
                }
            }
            if let Some(hint) = hint {
                return Some(hint.to_string());
            }
            match branch.when.evaluate(result) {
                Some(true) => Some(branch.on_true.to_string()),
                _ => Some(branch.on_false.to_string()),
            }
        }
    }
}

/// Resolves each dotted context path in the data bag first, then in
/// completed step results in completion order. Unresolved paths map to null.
pub fn extract_gate_context(checkpoint: &Checkpoint, paths: &[String]) -> Map<String, Value> {
    let mut context = Map::new();
    for path in paths {
        let value = lookup_map_path(&checkpoint.data, path)
            .or_else(|| {
                checkpoint
                    .completed_steps
                    .iter()
                    .find_map(|completed| lookup_path(&completed.result, path))
            })
            .cloned()
            .unwrap_or(Value::Null);
        context.insert(path.clone(), value);
    }
    context
}

fn gate_prompt(step: &StepDefinition, gate: &HumanGate, checkpoint: &Checkpoint) -> GatePrompt {
    GatePrompt {
        step: step.name.to_string(),
        prompt: gate.prompt.clone(),
        context: extract_gate_context(checkpoint, &gate.context),
        options: gate.options.clone(),
    }
}

fn parallel_items(checkpoint: &Checkpoint, step: &str, key: &str) -> Result<Vec<String>, EngineError> {
    let data_error = |reason: String| EngineError::PipelineData {
        step: step.to_string(),
        reason,
    };
    let value = checkpoint
        .data
        .get(key)
        .ok_or_else(|| data_error(format!("parallel step requires data at key `{key}`")))?;
    let array = value
        .as_array()
        .ok_or_else(|| data_error(format!("data key `{key}` must hold an array")))?;
    if array.is_empty() {
        return Err(data_error(format!("data key `{key}` holds no items")));
    }
    let mut seen = BTreeSet::new();
    let mut items = Vec::with_capacity(array.len());
    for value in array {
        let item = value
            .as_str()
            .ok_or_else(|| data_error(format!("data key `{key}` items must be strings")))?;
        if !seen.insert(item) {
            return Err(data_error(format!("data key `{key}` repeats item `{item}`")));
        }
        items.push(item.to_string());
    }
    Ok(items)
}

fn step_of<'d>(
    definition: &'d PipelineDefinition,
    name: &str,
) -> Result<&'d StepDefinition, EngineError> {
    definition.step(name).ok_or_else(|| EngineError::UnknownStep {
        pipeline_type: definition.pipeline_type.to_string(),
        step: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::definition::ConditionalNext;
    use crate::engine::predicate::BranchPredicate;
    use crate::shared::ids::StepName;

    fn step(name: &str) -> StepName {
        StepName::parse(name).expect("step name")
    }

    fn looping_step(max_iterations: Option<u32>) -> StepDefinition {
        StepDefinition {
            name: step("review"),
            command: "review-draft".to_string(),
            preconditions: Vec::new(),
            postconditions: Vec::new(),
            parallel_key: None,
            human_gate: None,
            next: Some(NextRule::Branch(ConditionalNext {
                when: BranchPredicate::Flag {
                    field: "approved".to_string(),
                    expected: true,
                },
                on_true: step("publish"),
                on_false: step("revise"),
                max_iterations,
            })),
        }
    }

    fn checkpoint() -> Checkpoint {
        Checkpoint::new(
            "run-1",
            PipelineType::parse("editing").expect("pipeline type"),
            "review",
            1,
        )
    }

    #[test]
    fn branch_prefers_hint_then_predicate_then_false() {
        let step = looping_step(None);
        let cp = checkpoint();
        assert_eq!(
            evaluate_next_step(&step, &cp, &json!({"approved": false}), Some("publish")),
            Some("publish".to_string())
        );
        assert_eq!(
            evaluate_next_step(&step, &cp, &json!({"approved": true}), None),
            Some("publish".to_string())
        );
        assert_eq!(
            evaluate_next_step(&step, &cp, &json!("approved"), None),
            Some("revise".to_string())
        );
    }

    #[test]
    fn exhausted_iterations_override_hint_and_predicate() {
        let step = looping_step(Some(2));
        let mut cp = checkpoint();
        cp.increment_iteration("review");
        assert_eq!(
            evaluate_next_step(&step, &cp, &json!({"approved": true}), None),
            Some("publish".to_string())
        );
        cp.increment_iteration("review");
        assert_eq!(
            evaluate_next_step(&step, &cp, &json!({"approved": true}), Some("publish")),
            Some("revise".to_string())
        );
    }

    #[test]
    fn gate_context_reads_data_before_step_results() {
        let mut cp = checkpoint();
        cp.set_data("summary", json!("from data"));
        cp.record_step_completion("draft", json!({"summary": "from step", "stats": {"words": 900}}), 2);
        let context = extract_gate_context(
            &cp,
            &[
                "summary".to_string(),
                "stats.words".to_string(),
                "missing".to_string(),
            ],
        );
        assert_eq!(context["summary"], json!("from data"));
        assert_eq!(context["stats.words"], json!(900));
        assert_eq!(context["missing"], Value::Null);
    }
}
