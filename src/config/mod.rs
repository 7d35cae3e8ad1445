pub mod error;
pub mod load;
pub mod paths;
pub mod pipeline_file;
pub mod registry;
pub mod settings;

pub use error::ConfigError;
pub use load::{load_engine_config, load_settings};
pub use paths::{EnginePaths, DATABASE_FILE_NAME, SETTINGS_FILE_NAME};
pub use pipeline_file::{load_pipeline_file, parse_pipeline_yaml};
pub use registry::PipelineRegistry;
pub use settings::{EngineSettings, RouteSettings};
