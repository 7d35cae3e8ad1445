use crate::config::pipeline_file::load_pipeline_file;
use crate::config::ConfigError;
use crate::engine::definition::PipelineDefinition;
use crate::shared::ids::PipelineType;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Validated pipeline definitions keyed by pipeline type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<PipelineType, PipelineDefinition>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: PipelineDefinition) -> Result<(), ConfigError> {
        definition.validate().map_err(ConfigError::Pipeline)?;
        if self.pipelines.contains_key(&definition.pipeline_type) {
            return Err(ConfigError::DuplicatePipeline {
                pipeline_type: definition.pipeline_type.to_string(),
            });
        }
        self.pipelines
            .insert(definition.pipeline_type.clone(), definition);
        Ok(())
    }

    pub fn get(&self, pipeline_type: &str) -> Option<&PipelineDefinition> {
        self.pipelines.get(pipeline_type)
    }

    pub fn pipeline_types(&self) -> Vec<PipelineType> {
        self.pipelines.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Loads every `*.yaml` / `*.yml` file in `dir`, in file-name order.
    pub fn load_dir(dir: &Path) -> Result<Self, ConfigError> {
        let entries = fs::read_dir(dir).map_err(|source| ConfigError::Read {
            path: dir.display().to_string(),
            source,
        })?;
        let mut files: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ConfigError::Read {
                path: dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if path.is_file() && is_yaml {
                files.push(path);
            }
        }
        files.sort();

        let mut registry = Self::new();
        for file in files {
            registry.register(load_pipeline_file(&file)?)?;
        }
        Ok(registry)
    }
}
