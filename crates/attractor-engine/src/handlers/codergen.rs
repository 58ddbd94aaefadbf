use crate::EngineError;
use crate::artifacts::write_stage_file;
use crate::backend::{BackendReply, BackendRequest, CodergenBackend, synthesize_preamble};
use crate::context::Context;
use crate::fidelity::apply_fidelity;
use crate::graph::{Graph, Node};
use crate::handlers::StageHandler;
use crate::outcome::StageOutcome;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

const LAST_RESPONSE_MAX_CHARS: usize = 200;

/// Default handler: turns a node's prompt into an LLM invocation, persisting
/// `prompt.md` / `response.md` next to the runner's `status.json`. Without a
/// backend the stage still succeeds with a simulated response so graphs can
/// be dry-run.
pub struct CodergenHandler {
    backend: Option<Arc<dyn CodergenBackend>>,
}

impl CodergenHandler {
    pub fn new(backend: Option<Arc<dyn CodergenBackend>>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl StageHandler for CodergenHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &Context,
        graph: &Graph,
        logs_root: Option<&Path>,
    ) -> Result<StageOutcome, EngineError> {
        let fidelity = context.get_str("internal.effective_fidelity")?;
        let thread_key = context.get_str("internal.thread_key")?;
        let snapshot = context.snapshot()?.values;
        let filtered = apply_fidelity(&snapshot, &fidelity);

        let mut prompt = node.prompt().to_string();
        if prompt.trim().is_empty() {
            prompt = node.label().to_string();
        }
        prompt = prompt.replace("$goal", graph.goal());
        let full_prompt = if fidelity == "full" {
            prompt.clone()
        } else {
            format!("{}{}", synthesize_preamble(&filtered), prompt)
        };

        if let Some(logs_root) = logs_root {
            write_stage_file(logs_root, &node.id, "prompt.md", &full_prompt)?;
        }

        let response = match self.backend.as_deref() {
            Some(backend) => {
                let request = BackendRequest {
                    node,
                    prompt: &full_prompt,
                    context: &filtered,
                    fidelity: &fidelity,
                    thread_key: (!thread_key.is_empty()).then_some(thread_key.as_str()),
                };
                match backend.invoke(request).await? {
                    BackendReply::Outcome(outcome) => {
                        if let Some(logs_root) = logs_root {
                            let rendered = outcome.notes.clone().unwrap_or_default();
                            write_stage_file(logs_root, &node.id, "response.md", &rendered)?;
                        }
                        return Ok(outcome);
                    }
                    BackendReply::Text(text) => text,
                }
            }
            None => format!("[simulated] response for stage '{}'", node.id),
        };

        if let Some(logs_root) = logs_root {
            write_stage_file(logs_root, &node.id, "response.md", &response)?;
        }

        Ok(StageOutcome::success()
            .note(format!("stage '{}' completed", node.id))
            .update("last_stage", Value::String(node.id.clone()))
            .update(
                "last_response",
                Value::String(clip(&response, LAST_RESPONSE_MAX_CHARS)),
            ))
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max_chars).collect();
    clipped.push_str("...");
    clipped
}
