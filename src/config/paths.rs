use std::path::{Path, PathBuf};

pub const SETTINGS_FILE_NAME: &str = "stageline.yaml";
pub const DATABASE_FILE_NAME: &str = "engine.db";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnginePaths {
    pub root: PathBuf,
    pub database: PathBuf,
    pub logs_dir: PathBuf,
    pub log_file: PathBuf,
}

impl EnginePaths {
    pub fn from_state_root(state_root: &Path) -> Self {
        Self {
            database: state_root.join(DATABASE_FILE_NAME),
            logs_dir: state_root.join("logs"),
            log_file: crate::shared::logging::engine_log_path(state_root),
            root: state_root.to_path_buf(),
        }
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE_NAME)
    }
}
