use crate::config::paths::EnginePaths;
use crate::config::ConfigError;
use crate::engine::runner::RetryLimits;
use crate::review::{
    CategoryRoute, RejectionCategory, RouteTable, DEFAULT_ESCALATION_TARGET,
    DEFAULT_REJECTION_THRESHOLD,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    pub state_root: PathBuf,
    #[serde(default = "default_retry_budget")]
    pub step_max_retries: u32,
    #[serde(default = "default_retry_budget")]
    pub parallel_max_retries: u32,
    #[serde(default = "default_rejection_threshold")]
    pub rejection_threshold: u32,
    #[serde(default = "default_true")]
    pub auto_chain_triggers: bool,
    #[serde(default)]
    pub routes: BTreeMap<RejectionCategory, RouteSettings>,
    #[serde(default)]
    pub pipelines_dir: Option<PathBuf>,
}

/// A configured route. `max_retries` falls back to `rejection_threshold`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSettings {
    pub handler: String,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default = "default_escalation_target")]
    pub escalation_target: String,
}

fn default_escalation_target() -> String {
    DEFAULT_ESCALATION_TARGET.to_string()
}

fn default_retry_budget() -> u32 {
    1
}

fn default_rejection_threshold() -> u32 {
    DEFAULT_REJECTION_THRESHOLD
}

fn default_true() -> bool {
    true
}

impl EngineSettings {
    pub fn with_state_root(state_root: &Path) -> Self {
        Self {
            state_root: state_root.to_path_buf(),
            step_max_retries: default_retry_budget(),
            parallel_max_retries: default_retry_budget(),
            rejection_threshold: default_rejection_threshold(),
            auto_chain_triggers: true,
            routes: BTreeMap::new(),
            pipelines_dir: None,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.state_root.is_absolute() {
            return Err(ConfigError::Settings(
                "`state_root` must be an absolute path".to_string(),
            ));
        }
        if self.rejection_threshold == 0 {
            return Err(ConfigError::Settings(
                "`rejection_threshold` must be greater than zero".to_string(),
            ));
        }
        for (category, route) in &self.routes {
            if route.handler.trim().is_empty() {
                return Err(ConfigError::Settings(format!(
                    "route `{category}` handler must be non-empty"
                )));
            }
            if route.escalation_target.trim().is_empty() {
                return Err(ConfigError::Settings(format!(
                    "route `{category}` escalation_target must be non-empty"
                )));
            }
            if route.max_retries == Some(0) {
                return Err(ConfigError::Settings(format!(
                    "route `{category}` max_retries must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    pub fn paths(&self) -> EnginePaths {
        EnginePaths::from_state_root(&self.state_root)
    }

    pub fn retry_limits(&self) -> RetryLimits {
        RetryLimits {
            step_max_retries: self.step_max_retries,
            parallel_max_retries: self.parallel_max_retries,
        }
    }

    /// Configured routes layered over the built-in category table. Every
    /// category without its own `max_retries` escalates at
    /// `rejection_threshold`.
    pub fn route_table(&self) -> RouteTable {
        let mut table = RouteTable::with_budget(self.rejection_threshold);
        for (category, route) in &self.routes {
            table.set_route(
                *category,
                CategoryRoute::new(
                    &route.handler,
                    route.max_retries.unwrap_or(self.rejection_threshold),
                    &route.escalation_target,
                ),
            );
        }
        table
    }

    /// Relative directories resolve against the state root.
    pub fn resolve_pipelines_dir(&self) -> Option<PathBuf> {
        self.pipelines_dir.as_ref().map(|dir| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                self.state_root.join(dir)
            }
        })
    }
}
