pub mod ids;
pub mod logging;

pub use ids::{generate_record_id, validate_identifier_value, PipelineType, StepName};
pub use logging::{append_engine_event, engine_log_path, unix_now};
