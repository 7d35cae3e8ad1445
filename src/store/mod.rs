pub mod artifacts;
pub mod conditions;
pub mod database;
pub mod error;
pub mod event_log;
pub mod run_store;
pub mod status;

pub use artifacts::{ArtifactRegistry, WorkflowArtifact};
pub use conditions::{ConditionSource, ContentVersion, StoreConditions};
pub use database::Database;
pub use error::StoreError;
pub use event_log::{EventLog, EventType, WorkflowEvent};
pub use run_store::{NewRun, RunFilter, RunStore, WorkflowRun};
pub use status::{RunStatus, RUN_STATUSES};
