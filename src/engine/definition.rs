use crate::engine::checkpoint::Checkpoint;
use crate::engine::predicate::{lookup_map_path, BranchPredicate};
use crate::shared::ids::{PipelineType, StepName};
use crate::store::{ConditionSource, RunStatus, StoreError, WorkflowRun};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(rename = "type")]
    pub pipeline_type: PipelineType,
    pub name: String,
    pub initial_step: StepName,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: StepName,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub preconditions: Vec<Condition>,
    #[serde(default)]
    pub postconditions: Vec<Condition>,
    #[serde(default)]
    pub parallel_key: Option<String>,
    #[serde(default)]
    pub human_gate: Option<HumanGate>,
    #[serde(default)]
    pub next: Option<NextRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Command,
    HumanGate,
    Parallel,
}

impl StepDefinition {
    pub fn kind(&self) -> StepKind {
        if self.human_gate.is_some() {
            StepKind::HumanGate
        } else if self.parallel_key.is_some() {
            StepKind::Parallel
        } else {
            StepKind::Command
        }
    }

    /// Bounded loops count completions of the step that owns the rule.
    pub fn max_iterations(&self) -> Option<u32> {
        match &self.next {
            Some(NextRule::Branch(branch)) => branch.max_iterations,
            _ => None,
        }
    }
}

/// A named check with the message reported when it fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    #[serde(flatten)]
    pub check: ConditionCheck,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum ConditionCheck {
    PlanExists,
    ArtifactsExist,
    InputVersionExists,
    VersionExists { data_key: String },
    VersionBelongsToSubject { data_key: String },
    DataPresent { path: String },
    DataEquals { path: String, value: Value },
    DataFlag { path: String, expected: bool },
    GateDecisionRecorded,
    StepCompleted { step: StepName },
    RunStatusIs { data_key: String, status: RunStatus },
}

pub struct ConditionContext<'c> {
    pub run: &'c WorkflowRun,
    pub checkpoint: &'c Checkpoint,
    pub source: &'c dyn ConditionSource,
}

impl ConditionContext<'_> {
    fn data_value(&self, path: &str) -> Option<&Value> {
        lookup_map_path(&self.checkpoint.data, path)
    }

    fn data_str(&self, key: &str) -> Option<&str> {
        self.data_value(key).and_then(Value::as_str)
    }
}

impl Condition {
    pub fn evaluate(&self, ctx: &ConditionContext<'_>) -> Result<bool, StoreError> {
        self.check.evaluate(ctx)
    }

    pub fn failure_message(&self, kind: &str) -> String {
        format!("{kind} \"{}\" failed: {}", self.name, self.error)
    }
}

impl ConditionCheck {
    pub fn evaluate(&self, ctx: &ConditionContext<'_>) -> Result<bool, StoreError> {
        match self {
            ConditionCheck::PlanExists => ctx.source.plan_exists(&ctx.run.id),
            ConditionCheck::ArtifactsExist => ctx.source.artifacts_exist(&ctx.run.id),
            ConditionCheck::InputVersionExists => match &ctx.run.input_version_id {
                Some(version_id) => ctx.source.version_exists(version_id),
                None => Ok(false),
            },
            ConditionCheck::VersionExists { data_key } => match ctx.data_str(data_key) {
                Some(version_id) => ctx.source.version_exists(version_id),
                None => Ok(false),
            },
            ConditionCheck::VersionBelongsToSubject { data_key } => {
                let Some(version_id) = ctx.data_str(data_key) else {
                    return Ok(false);
                };
                Ok(ctx
                    .source
                    .get_version(version_id)?
                    .is_some_and(|version| version.subject_id == ctx.run.subject_id))
            }
            ConditionCheck::DataPresent { path } => {
                Ok(ctx.data_value(path).is_some_and(|value| !value.is_null()))
            }
            ConditionCheck::DataEquals { path, value } => {
                Ok(ctx.data_value(path).is_some_and(|actual| actual == value))
            }
            ConditionCheck::DataFlag { path, expected } => Ok(ctx
                .data_value(path)
                .and_then(Value::as_bool)
                .is_some_and(|actual| actual == *expected)),
            ConditionCheck::GateDecisionRecorded => Ok(ctx.checkpoint.gate_decision.is_some()),
            ConditionCheck::StepCompleted { step } => Ok(ctx
                .checkpoint
                .completed_steps
                .iter()
                .any(|completed| completed.step == step.as_str())),
            ConditionCheck::RunStatusIs { data_key, status } => match ctx.data_str(data_key) {
                Some(run_id) => Ok(ctx.source.run_status(run_id)? == Some(*status)),
                None => Ok(false),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanGate {
    pub prompt: String,
    #[serde(default)]
    pub context: Vec<String>,
    pub options: Vec<GateOption>,
}

impl HumanGate {
    pub fn option(&self, label: &str) -> Option<&GateOption> {
        self.options.iter().find(|option| option.label == label)
    }

    pub fn labels(&self) -> Vec<String> {
        self.options
            .iter()
            .map(|option| option.label.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateOption {
    pub label: String,
    #[serde(default, alias = "next_step")]
    pub next_step: Option<StepName>,
    #[serde(default, alias = "requires_input")]
    pub requires_input: bool,
    /// Marks the run's `completed` event as approval evidence when this
    /// option finishes the run.
    #[serde(default)]
    pub approves: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NextRule {
    Step(StepName),
    Branch(ConditionalNext),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalNext {
    pub when: BranchPredicate,
    pub on_true: StepName,
    pub on_false: StepName,
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

impl PipelineDefinition {
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|step| step.name.as_str() == name)
    }

    pub fn has_step(&self, name: &str) -> bool {
        self.step(name).is_some()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err(format!("pipeline `{}` requires a name", self.pipeline_type));
        }
        if self.steps.is_empty() {
            return Err(format!(
                "pipeline `{}` must declare at least one step",
                self.pipeline_type
            ));
        }

        let mut names = BTreeSet::new();
        for step in &self.steps {
            if !names.insert(step.name.as_str()) {
                return Err(format!(
                    "pipeline `{}` declares step `{}` twice",
                    self.pipeline_type, step.name
                ));
            }
        }
        if !names.contains(self.initial_step.as_str()) {
            return Err(format!(
                "pipeline `{}` initial step `{}` is not declared",
                self.pipeline_type, self.initial_step
            ));
        }

        for step in &self.steps {
            self.validate_step(step, &names)?;
        }
        Ok(())
    }

    fn validate_step(&self, step: &StepDefinition, names: &BTreeSet<&str>) -> Result<(), String> {
        let known = |target: &StepName| -> Result<(), String> {
            if names.contains(target.as_str()) {
                Ok(())
            } else {
                Err(format!(
                    "step `{}` references unknown step `{}`",
                    step.name, target
                ))
            }
        };

        if step.human_gate.is_some() && step.parallel_key.is_some() {
            return Err(format!(
                "step `{}` cannot be both a human gate and a parallel fan-out",
                step.name
            ));
        }
        if let Some(key) = &step.parallel_key {
            if key.trim().is_empty() {
                return Err(format!("step `{}` parallel_key must be non-empty", step.name));
            }
        }
        if step.kind() == StepKind::Command && step.command.trim().is_empty() {
            return Err(format!("step `{}` requires a command", step.name));
        }

        if let Some(gate) = &step.human_gate {
            if gate.options.is_empty() {
                return Err(format!("step `{}` gate must offer options", step.name));
            }
            let mut labels = BTreeSet::new();
            for option in &gate.options {
                if option.label.trim().is_empty() || !labels.insert(option.label.as_str()) {
                    return Err(format!(
                        "step `{}` gate option labels must be unique and non-empty",
                        step.name
                    ));
                }
                if let Some(target) = &option.next_step {
                    known(target)?;
                }
            }
        }

        match &step.next {
            None => {}
            Some(NextRule::Step(target)) => known(target)?,
            Some(NextRule::Branch(branch)) => {
                known(&branch.on_true)?;
                known(&branch.on_false)?;
                if branch.when.field().trim().is_empty() {
                    return Err(format!("step `{}` branch field must be non-empty", step.name));
                }
                if branch.max_iterations == Some(0) {
                    return Err(format!(
                        "step `{}` max_iterations must be greater than zero",
                        step.name
                    ));
                }
            }
        }

        for condition in step.preconditions.iter().chain(&step.postconditions) {
            if let ConditionCheck::StepCompleted { step: target } = &condition.check {
                known(target)?;
            }
        }
        Ok(())
    }
}
