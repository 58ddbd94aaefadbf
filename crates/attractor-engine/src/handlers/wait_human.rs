use crate::EngineError;
use crate::context::Context;
use crate::graph::{Graph, Node};
use crate::handlers::StageHandler;
use crate::interviewer::{GateAnswer, GateChoice, GateQuestion, Interviewer};
use crate::outcome::StageOutcome;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Human decision gate. The outgoing edges are the options; the interviewer
/// supplies the answer. Timeouts fall back to `human.default_choice` when it
/// names an edge, otherwise the stage asks to be retried; a skipped gate
/// fails the stage.
pub struct WaitHumanHandler {
    interviewer: Arc<dyn Interviewer>,
}

impl WaitHumanHandler {
    pub fn new(interviewer: Arc<dyn Interviewer>) -> Self {
        Self { interviewer }
    }
}

#[async_trait]
impl StageHandler for WaitHumanHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &Context,
        graph: &Graph,
        _logs_root: Option<&Path>,
    ) -> Result<StageOutcome, EngineError> {
        let choices = gate_choices(node, graph);
        if choices.is_empty() {
            return Ok(StageOutcome::failure(format!(
                "human gate '{}' has no outgoing edges to offer",
                node.id
            )));
        }

        let question = GateQuestion {
            node_id: node.id.clone(),
            text: node.label().to_string(),
            choices: choices.clone(),
            default_choice: node
                .attrs
                .get_trimmed("human.default_choice")
                .map(ToOwned::to_owned),
            timeout: node.timeout_millis().map(Duration::from_millis),
        };

        let selected = match self.interviewer.ask(question).await {
            GateAnswer::Selected(raw) => match match_choice(&choices, &raw) {
                Some(choice) => choice,
                None => choices[0].clone(),
            },
            GateAnswer::Timeout => {
                let fallback = node
                    .attrs
                    .get_trimmed("human.default_choice")
                    .and_then(|raw| match_choice(&choices, raw));
                match fallback {
                    Some(choice) => choice,
                    None => {
                        return Ok(StageOutcome::retry(format!(
                            "human gate '{}' timed out with no default choice",
                            node.id
                        )));
                    }
                }
            }
            GateAnswer::Skipped => {
                return Ok(StageOutcome::failure(format!(
                    "human gate '{}' was skipped",
                    node.id
                )));
            }
        };

        Ok(StageOutcome::success()
            .note(format!("human selected '{}'", selected.key))
            .update("human.choice", Value::String(selected.key.clone()))
            .update("human.choice_label", Value::String(selected.label.clone()))
            .suggest(selected.target_node.clone()))
    }
}

fn gate_choices(node: &Node, graph: &Graph) -> Vec<GateChoice> {
    graph
        .outgoing(&node.id)
        .map(|edge| {
            let label = match edge.label().trim() {
                "" => edge.to.clone(),
                text => text.to_string(),
            };
            GateChoice {
                key: accelerator_key(&label),
                label,
                target_node: edge.to.clone(),
            }
        })
        .collect()
}

/// `[K] Label`, `K) Label`, and `K - Label` styles all yield `K`; anything
/// else keys on the first character.
fn accelerator_key(label: &str) -> String {
    let trimmed = label.trim();
    if let Some((key, _)) = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
    {
        let key = key.trim();
        if !key.is_empty() {
            return key.to_ascii_uppercase();
        }
    }
    for separator in [')', '-'] {
        if let Some((key, _)) = trimmed.split_once(separator) {
            let key = key.trim();
            if key.len() == 1 {
                return key.to_ascii_uppercase();
            }
        }
    }
    trimmed
        .chars()
        .next()
        .map(|ch| ch.to_ascii_uppercase().to_string())
        .unwrap_or_else(|| "?".to_string())
}

fn match_choice(choices: &[GateChoice], raw: &str) -> Option<GateChoice> {
    let needle = raw.trim().to_ascii_lowercase();
    choices
        .iter()
        .find(|choice| {
            choice.key.to_ascii_lowercase() == needle
                || choice.label.to_ascii_lowercase() == needle
                || choice.target_node.to_ascii_lowercase() == needle
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interviewer::QueueInterviewer;
    use crate::outcome::StageStatus;
    use crate::parse::parse_pipeline;

    fn gate_graph() -> Graph {
        parse_pipeline(
            r#"
            digraph G {
                gate [shape=hexagon, label="Ship it?"]
                ship
                fix
                gate -> ship [label="[Y] Yes"]
                gate -> fix [label="[N] No"]
            }
            "#,
        )
        .expect("graph should parse")
    }

    async fn run_gate(graph: &Graph, answer: GateAnswer) -> StageOutcome {
        let node = graph.nodes.get("gate").expect("gate should exist");
        let handler = WaitHumanHandler::new(Arc::new(QueueInterviewer::with_answers([answer])));
        handler
            .execute(node, &Context::new(), graph, None)
            .await
            .expect("execution should succeed")
    }

    #[tokio::test(flavor = "current_thread")]
    async fn selection_routes_through_suggested_next_id() {
        let graph = gate_graph();
        let outcome = run_gate(&graph, GateAnswer::Selected("N".to_string())).await;
        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(outcome.suggested_next_ids, vec!["fix".to_string()]);
        assert_eq!(
            outcome.context_updates.get("human.choice"),
            Some(&Value::String("N".to_string()))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn timeout_without_default_asks_for_retry() {
        let graph = gate_graph();
        let outcome = run_gate(&graph, GateAnswer::Timeout).await;
        assert_eq!(outcome.status, StageStatus::Retry);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn timeout_with_default_choice_succeeds() {
        let graph = parse_pipeline(
            r#"
            digraph G {
                gate [shape=hexagon, human_default_choice="Y"]
                ship
                gate -> ship [label="[Y] Yes"]
            }
            "#,
        )
        .expect("graph should parse");

        let outcome = run_gate(&graph, GateAnswer::Timeout).await;
        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(outcome.suggested_next_ids, vec!["ship".to_string()]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn skipped_gate_fails() {
        let graph = gate_graph();
        let outcome = run_gate(&graph, GateAnswer::Skipped).await;
        assert_eq!(outcome.status, StageStatus::Fail);
    }

    #[test]
    fn accelerator_keys_parse_common_label_styles() {
        assert_eq!(accelerator_key("[Y] Yes"), "Y");
        assert_eq!(accelerator_key("a) Approve"), "A");
        assert_eq!(accelerator_key("r - Reject"), "R");
        assert_eq!(accelerator_key("Continue"), "C");
    }
}
