use crate::EngineError;
use crate::context::ContextMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const CHECKPOINT_VERSION: u32 = 1;

/// Snapshot of a run after a node completed. Written atomically after every
/// stage so a crashed run restarts from its last completed node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub run_id: String,
    /// Last completed node.
    pub current_node: String,
    /// Exact visitation order, including loop-restart revisits.
    pub completed_nodes: Vec<String>,
    pub node_retries: BTreeMap<String, u32>,
    pub context: ContextMap,
    /// Effective fidelity of the step that produced this checkpoint; a
    /// `full` value degrades the first post-resume step to `summary:high`.
    pub last_fidelity: Option<String>,
    pub saved_at: String,
}

impl Checkpoint {
    /// Write-to-temp, fsync, rename. Readers of `path` observe either the
    /// previous checkpoint or this one, never a partial file.
    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        let parent = path.parent().ok_or_else(|| {
            EngineError::Runtime(format!(
                "checkpoint path '{}' has no parent directory",
                path.display()
            ))
        })?;
        fs::create_dir_all(parent).map_err(|error| {
            EngineError::Runtime(format!(
                "failed to create checkpoint directory '{}': {error}",
                parent.display()
            ))
        })?;

        let bytes = serde_json::to_vec_pretty(self).map_err(|error| {
            EngineError::Runtime(format!("failed to serialize checkpoint: {error}"))
        })?;

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &bytes).map_err(|error| {
            EngineError::Runtime(format!(
                "failed writing checkpoint temp file '{}': {error}",
                temp_path.display()
            ))
        })?;
        let temp_file = File::open(&temp_path).map_err(|error| {
            EngineError::Runtime(format!(
                "failed reopening checkpoint temp file '{}': {error}",
                temp_path.display()
            ))
        })?;
        temp_file.sync_all().map_err(|error| {
            EngineError::Runtime(format!("failed to fsync checkpoint: {error}"))
        })?;
        fs::rename(&temp_path, path).map_err(|error| {
            EngineError::Runtime(format!(
                "failed renaming checkpoint into place at '{}': {error}",
                path.display()
            ))
        })
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let bytes = fs::read(path).map_err(|error| {
            EngineError::Runtime(format!(
                "failed reading checkpoint '{}': {error}",
                path.display()
            ))
        })?;
        serde_json::from_slice(&bytes).map_err(|error| {
            EngineError::Runtime(format!(
                "failed deserializing checkpoint '{}': {error}",
                path.display()
            ))
        })
    }
}

pub fn checkpoint_path(logs_root: &Path) -> PathBuf {
    logs_root.join(CHECKPOINT_FILE)
}
