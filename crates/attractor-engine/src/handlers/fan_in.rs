use crate::EngineError;
use crate::backend::{BackendReply, BackendRequest, CodergenBackend};
use crate::context::Context;
use crate::fidelity::apply_fidelity;
use crate::graph::{Graph, Node};
use crate::handlers::StageHandler;
use crate::outcome::{StageOutcome, StageStatus};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

/// Fan-in evaluator: reads the aggregated `parallel.results`, ranks the
/// branch outcomes, and reports the best one. With a prompt and a backend
/// wired the ranking question is delegated to the model; without either, a
/// status-rank sort decides.
pub struct FanInHandler {
    backend: Option<Arc<dyn CodergenBackend>>,
}

impl FanInHandler {
    pub fn new(backend: Option<Arc<dyn CodergenBackend>>) -> Self {
        Self { backend }
    }
}

#[derive(Clone, Debug)]
struct Candidate {
    branch: String,
    status: StageStatus,
}

#[async_trait]
impl StageHandler for FanInHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &Context,
        _graph: &Graph,
        _logs_root: Option<&Path>,
    ) -> Result<StageOutcome, EngineError> {
        let results = context.get("parallel.results")?;
        let candidates = results
            .as_ref()
            .and_then(Value::as_array)
            .map(|entries| entries.iter().filter_map(candidate_from).collect::<Vec<_>>())
            .unwrap_or_default();
        if candidates.is_empty() {
            return Ok(StageOutcome::failure(format!(
                "fan-in node '{}' found no parallel results to evaluate",
                node.id
            )));
        }

        if let (Some(backend), false) = (self.backend.as_deref(), node.prompt().trim().is_empty())
        {
            let fidelity = context.get_str("internal.effective_fidelity")?;
            let snapshot = context.snapshot()?.values;
            let filtered = apply_fidelity(&snapshot, &fidelity);
            let prompt = format!(
                "{}\n\nBranch results:\n{}",
                node.prompt(),
                serde_json::to_string_pretty(results.as_ref().unwrap_or(&Value::Null))
                    .unwrap_or_default()
            );
            let request = BackendRequest {
                node,
                prompt: &prompt,
                context: &filtered,
                fidelity: &fidelity,
                thread_key: None,
            };
            match backend.invoke(request).await {
                Ok(BackendReply::Outcome(outcome)) => return Ok(outcome),
                Ok(BackendReply::Text(text)) => {
                    return Ok(rank_candidates(&node.id, candidates)
                        .note(format!("ranked by backend: {}", text.trim())));
                }
                Err(error) if error.is_retryable() => return Err(error),
                Err(error) => {
                    return Ok(StageOutcome::failure(format!(
                        "fan-in ranking backend failed: {error}"
                    )));
                }
            }
        }

        Ok(rank_candidates(&node.id, candidates))
    }
}

fn rank_candidates(node_id: &str, mut candidates: Vec<Candidate>) -> StageOutcome {
    candidates.sort_by(|left, right| {
        left.status
            .rank()
            .cmp(&right.status.rank())
            .then_with(|| left.branch.cmp(&right.branch))
    });
    let best = candidates.first().expect("candidates are non-empty").clone();

    StageOutcome::success()
        .note(format!(
            "fan-in '{}' selected branch '{}' ({})",
            node_id,
            best.branch,
            best.status.as_str()
        ))
        .update("parallel.best_branch", Value::String(best.branch))
        .update(
            "parallel.best_status",
            Value::String(best.status.as_str().to_string()),
        )
}

fn candidate_from(value: &Value) -> Option<Candidate> {
    let entry = value.as_object()?;
    let branch = entry.get("branch")?.as_str()?.to_string();
    let status = entry
        .get("status")
        .and_then(Value::as_str)
        .and_then(|raw| StageStatus::parse(raw).ok())
        .unwrap_or(StageStatus::Fail);
    Some(Candidate { branch, status })
}
