use crate::store::{RunStatus, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown pipeline type `{pipeline_type}`")]
    UnknownPipeline { pipeline_type: String },
    #[error("step `{step}` not found in pipeline `{pipeline_type}`")]
    UnknownStep { pipeline_type: String, step: String },
    #[error("no checkpoint found for workflow run `{run_id}`")]
    MissingCheckpoint { run_id: String },
    #[error("invalid gate option `{option}`; valid options are: {}", valid.join(", "))]
    InvalidGateOption { option: String, valid: Vec<String> },
    #[error("gate option `{option}` requires input")]
    GateInputRequired { option: String },
    #[error("current step `{step}` has no human gate")]
    NoHumanGate { step: String },
    #[error("step `{step}` is not a command step")]
    NotCommandStep { step: String },
    #[error("workflow run `{run_id}` is already `{status}`")]
    RunTerminal { run_id: String, status: RunStatus },
    #[error("workflow run `{run_id}` is `{status}`, expected `running`")]
    RunNotRunning { run_id: String, status: RunStatus },
    #[error("step `{step}` is not a parallel fan-out")]
    NotParallelStep { step: String },
    #[error("pipeline data error at step `{step}`: {reason}")]
    PipelineData { step: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("engine log write failed at {path}: {source}")]
    Log {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    /// Lifts `StoreError::NotFound` for checkpoints into `MissingCheckpoint`.
    pub(crate) fn from_checkpoint_load(run_id: &str, err: StoreError) -> Self {
        match err {
            StoreError::NotFound {
                entity: "checkpoint",
                ..
            } => EngineError::MissingCheckpoint {
                run_id: run_id.to_string(),
            },
            other => EngineError::Store(other),
        }
    }
}
