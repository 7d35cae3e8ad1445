#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("settings validation failed: {0}")]
    Settings(String),
    #[error("pipeline validation failed: {0}")]
    Pipeline(String),
    #[error("pipeline type `{pipeline_type}` is defined more than once")]
    DuplicatePipeline { pipeline_type: String },
}
