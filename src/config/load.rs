use super::{ConfigError, EngineSettings, PipelineRegistry};
use std::path::Path;

pub fn load_settings(path: &Path) -> Result<EngineSettings, ConfigError> {
    let settings = EngineSettings::from_path(path)?;
    settings.validate()?;
    Ok(settings)
}

/// Settings plus the pipelines found in their `pipelines_dir`. Without a
/// directory the registry is empty.
pub fn load_engine_config(path: &Path) -> Result<(EngineSettings, PipelineRegistry), ConfigError> {
    let settings = load_settings(path)?;
    let registry = match settings.resolve_pipelines_dir() {
        Some(dir) => PipelineRegistry::load_dir(&dir)?,
        None => PipelineRegistry::new(),
    };
    Ok((settings, registry))
}
