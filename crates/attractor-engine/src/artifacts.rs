use crate::EngineError;
use crate::graph::Graph;
use crate::outcome::StageOutcome;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Per-run artifact layout under a logs root:
///
/// ```text
/// <logs_root>/
///   manifest.json
///   checkpoint.json
///   <node_id>/
///     prompt.md
///     response.md
///     status.json
/// ```
pub fn node_dir(logs_root: &Path, node_id: &str) -> PathBuf {
    logs_root.join(node_id)
}

pub fn write_manifest(logs_root: &Path, graph: &Graph) -> Result<(), EngineError> {
    fs::create_dir_all(logs_root).map_err(|error| {
        EngineError::Runtime(format!(
            "failed to create logs root '{}': {error}",
            logs_root.display()
        ))
    })?;
    let manifest = json!({
        "name": graph.id,
        "goal": graph.goal(),
        "created_at": now_iso(),
    });
    write_pretty(&logs_root.join(MANIFEST_FILE), &manifest)
}

pub fn write_stage_status(
    logs_root: &Path,
    node_id: &str,
    outcome: &StageOutcome,
) -> Result<(), EngineError> {
    let dir = node_dir(logs_root, node_id);
    fs::create_dir_all(&dir).map_err(|error| {
        EngineError::Runtime(format!(
            "failed to create stage directory '{}': {error}",
            dir.display()
        ))
    })?;
    let status = json!({
        "outcome": outcome.status.as_str(),
        "failure_reason": outcome.failure_reason,
        "preferred_next_label": outcome.preferred_label,
        "suggested_next_ids": outcome.suggested_next_ids,
        "context_updates": outcome.context_updates,
        "notes": outcome.notes,
    });
    write_pretty(&dir.join("status.json"), &status)
}

pub fn write_stage_file(
    logs_root: &Path,
    node_id: &str,
    file_name: &str,
    contents: &str,
) -> Result<(), EngineError> {
    let dir = node_dir(logs_root, node_id);
    fs::create_dir_all(&dir).map_err(|error| {
        EngineError::Runtime(format!(
            "failed to create stage directory '{}': {error}",
            dir.display()
        ))
    })?;
    let path = dir.join(file_name);
    fs::write(&path, contents).map_err(|error| {
        EngineError::Runtime(format!("failed writing '{}': {error}", path.display()))
    })
}

fn write_pretty(path: &Path, value: &serde_json::Value) -> Result<(), EngineError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|error| EngineError::Runtime(format!("failed to serialize artifact: {error}")))?;
    fs::write(path, bytes).map_err(|error| {
        EngineError::Runtime(format!("failed writing '{}': {error}", path.display()))
    })
}

pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
