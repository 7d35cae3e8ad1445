use crate::config::ConfigError;
use crate::engine::definition::PipelineDefinition;
use std::fs;
use std::path::Path;

pub fn parse_pipeline_yaml(raw: &str, origin: &str) -> Result<PipelineDefinition, ConfigError> {
    let definition: PipelineDefinition =
        serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
    definition.validate().map_err(ConfigError::Pipeline)?;
    Ok(definition)
}

pub fn load_pipeline_file(path: &Path) -> Result<PipelineDefinition, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_pipeline_yaml(&raw, &path.display().to_string())
}
