use crate::EngineError;
use crate::context::Context;
use crate::graph::{Graph, Node};
use crate::handlers::StageHandler;
use crate::outcome::StageOutcome;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const OUTPUT_CLIP_CHARS: usize = 4000;

/// Shell tool stage: runs `tool_command` through the host shell, with an
/// optional `pre_hook` before it and `post_hook` after it. A failing
/// pre-hook aborts the stage; a failing post-hook is only noted. The node
/// timeout applies to each command individually, and exceeding it surfaces
/// as a retryable error.
pub struct ToolHandler;

#[async_trait]
impl StageHandler for ToolHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &Context,
        _graph: &Graph,
        _logs_root: Option<&Path>,
    ) -> Result<StageOutcome, EngineError> {
        let Some(command) = node.attrs.get_trimmed("tool_command") else {
            return Ok(StageOutcome::failure(format!(
                "tool node '{}' has no tool_command",
                node.id
            )));
        };
        let timeout = node.timeout_millis().map(Duration::from_millis);

        if let Some(pre_hook) = node.attrs.get_trimmed("pre_hook") {
            let run = run_shell(&node.id, pre_hook, timeout).await?;
            if !run.success {
                return Ok(StageOutcome::failure(format!(
                    "pre_hook failed with status {}: {}",
                    run.status,
                    clip(&run.stderr)
                )));
            }
        }

        let run = run_shell(&node.id, command, timeout).await?;
        if !run.success {
            return Ok(StageOutcome::failure(format!(
                "tool command failed with status {}: {}",
                run.status,
                clip(&run.stderr)
            ))
            .update("tool.output", Value::String(clip(&run.stdout))));
        }

        let mut notes = format!("tool command completed: {command}");
        if let Some(post_hook) = node.attrs.get_trimmed("post_hook") {
            let post = run_shell(&node.id, post_hook, timeout).await?;
            if !post.success {
                notes.push_str(&format!(
                    "; post_hook failed with status {}: {}",
                    post.status,
                    clip(&post.stderr)
                ));
            }
        }

        Ok(StageOutcome::success()
            .note(notes)
            .update("tool.output", Value::String(clip(&run.stdout))))
    }
}

struct ShellRun {
    success: bool,
    status: i32,
    stdout: String,
    stderr: String,
}

async fn run_shell(
    node_id: &str,
    command: &str,
    timeout: Option<Duration>,
) -> Result<ShellRun, EngineError> {
    let mut shell = Command::new("sh");
    shell
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, shell.output())
            .await
            .map_err(|_| EngineError::StageTimeout {
                node_id: node_id.to_string(),
                millis: limit.as_millis() as u64,
            })?,
        None => shell.output().await,
    }
    .map_err(|error| EngineError::Runtime(format!("failed to spawn shell: {error}")))?;

    Ok(ShellRun {
        success: output.status.success(),
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn clip(text: &str) -> String {
    let trimmed = text.trim_end();
    if trimmed.chars().count() <= OUTPUT_CLIP_CHARS {
        return trimmed.to_string();
    }
    let mut clipped: String = trimmed.chars().take(OUTPUT_CLIP_CHARS).collect();
    clipped.push_str("...");
    clipped
}
