use crate::EngineError;
use crate::context::{ContextMap, INTERNAL_PREFIX};
use crate::graph::Node;
use crate::outcome::StageOutcome;
use async_trait::async_trait;
use serde_json::Value;

/// What a backend invocation hands back: plain response text, or a complete
/// outcome when the backend wants to steer routing itself.
pub enum BackendReply {
    Text(String),
    Outcome(StageOutcome),
}

/// Request shape for one LLM invocation. The runner has already applied the
/// fidelity filter to `context`; `thread_key` is set only under `full`
/// fidelity and keys session reuse inside the backend.
pub struct BackendRequest<'a> {
    pub node: &'a Node,
    pub prompt: &'a str,
    pub context: &'a ContextMap,
    pub fidelity: &'a str,
    pub thread_key: Option<&'a str>,
}

/// Seam for concrete LLM providers. The engine ships none; the CLI runs in
/// simulate mode without one and hosts wire real providers in.
///
/// Transient transport failures should surface as
/// `EngineError::Transient` so the retry policy can consume an attempt;
/// authentication and refusal errors as `EngineError::Runtime`.
#[async_trait]
pub trait CodergenBackend: Send + Sync {
    async fn invoke(&self, request: BackendRequest<'_>) -> Result<BackendReply, EngineError>;
}

/// Bulleted rendering of the non-internal context, prepended to prompts when
/// the handler runs at reduced fidelity.
pub fn synthesize_preamble(context: &ContextMap) -> String {
    let mut lines = Vec::new();
    for (key, value) in context {
        if key.starts_with(INTERNAL_PREFIX) {
            continue;
        }
        let rendered = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        lines.push(format!("- {key}: {rendered}"));
    }
    if lines.is_empty() {
        String::new()
    } else {
        format!("Context:\n{}\n\n", lines.join("\n"))
    }
}
