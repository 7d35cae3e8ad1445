pub mod checkpoint;
pub mod definition;
pub mod error;
pub mod predicate;
pub mod runner;

pub use checkpoint::{
    Checkpoint, CheckpointManager, CompletedStep, GateDecision, ParallelItem, ParallelItemState,
    ParallelStatus, PendingRetry,
};
pub use definition::{
    Condition, ConditionCheck, ConditionContext, ConditionalNext, GateOption, HumanGate,
    NextRule, PipelineDefinition, StepDefinition, StepKind,
};
pub use error::EngineError;
pub use predicate::{lookup_map_path, lookup_path, BranchPredicate};
pub use runner::{
    evaluate_next_step, extract_gate_context, ExecutionStatus, GatePrompt, ItemOutcome,
    ParallelProgress, ParallelRecord, ResumeContext, RetryContext, RetryLimits, RunOutcome,
    RunSnapshot, StepInput, StepOutput, WorkflowRunner,
};
