use crate::EngineError;
use crate::condition::evaluate_condition;
use crate::context::{Context, ContextMap};
use crate::graph::{Graph, Node};
use crate::handlers::StageHandler;
use crate::outcome::StageOutcome;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_MAX_CYCLES: u64 = 1000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 45_000;
const DEFAULT_ACTIONS: &str = "observe,wait";

/// One observation of a supervised child workload.
#[derive(Clone, Debug, Default)]
pub struct ChildReport {
    pub status: String,
    pub outcome: String,
    pub telemetry: ContextMap,
}

/// Eyes and hands of the manager loop: `observe` reports the child's state
/// each cycle, `steer` nudges it when the cooldown allows.
#[async_trait]
pub trait ManagerObserver: Send + Sync {
    async fn observe(&self, cycle: u64) -> Result<ChildReport, EngineError>;

    async fn steer(&self, _cycle: u64, _context: &Context) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Cyclic observe/steer supervisor. Terminates with success when the child
/// completes successfully or the stop condition holds, with failure when the
/// child fails or `manager.max_cycles` runs out.
pub struct ManagerLoopHandler {
    observer: Option<Arc<dyn ManagerObserver>>,
}

impl ManagerLoopHandler {
    pub fn new(observer: Option<Arc<dyn ManagerObserver>>) -> Self {
        Self { observer }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct ManagerActions {
    observe: bool,
    steer: bool,
    wait: bool,
}

#[async_trait]
impl StageHandler for ManagerLoopHandler {
    async fn execute(
        &self,
        node: &Node,
        context: &Context,
        _graph: &Graph,
        _logs_root: Option<&Path>,
    ) -> Result<StageOutcome, EngineError> {
        let max_cycles = node
            .attrs
            .get_i64("manager.max_cycles")
            .filter(|value| *value > 0)
            .map(|value| value as u64)
            .unwrap_or(DEFAULT_MAX_CYCLES);
        let poll_interval_ms = node
            .attrs
            .get_millis("manager.poll_interval")
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        let steer_cooldown_ms = node
            .attrs
            .get_millis("manager.steer_cooldown_ms")
            .unwrap_or(poll_interval_ms);
        let actions = parse_actions(
            node.attrs
                .get_trimmed("manager.actions")
                .unwrap_or(DEFAULT_ACTIONS),
        );
        let stop_condition = node
            .attrs
            .get_trimmed("manager.stop_condition")
            .unwrap_or_default()
            .to_string();

        let mut elapsed_since_steer_ms = steer_cooldown_ms;

        for cycle in 1..=max_cycles {
            context.set("manager.current_cycle", Value::Number(cycle.into()))?;

            if actions.observe {
                if let Some(observer) = self.observer.as_deref() {
                    let report = observer.observe(cycle).await?;
                    context.set("stack.child.status", Value::String(report.status))?;
                    context.set("stack.child.outcome", Value::String(report.outcome))?;
                    for (key, value) in report.telemetry {
                        context.set(format!("stack.child.telemetry.{key}"), value)?;
                    }
                }
            }

            if actions.steer && elapsed_since_steer_ms >= steer_cooldown_ms {
                if let Some(observer) = self.observer.as_deref() {
                    observer.steer(cycle, context).await?;
                    elapsed_since_steer_ms = 0;
                }
            }

            let child_status = context.get_str("stack.child.status")?;
            let child_outcome = context.get_str("stack.child.outcome")?;
            if child_status == "completed" && child_outcome == "success" {
                return Ok(finish(cycle, "child completed successfully"));
            }
            if child_status == "failed" {
                return Ok(StageOutcome::failure(format!(
                    "child failed after {cycle} manager cycle(s)"
                ))
                .update("manager.cycles", Value::Number(cycle.into())));
            }

            if !stop_condition.is_empty() {
                let marker = StageOutcome::success();
                let snapshot = context.snapshot()?.values;
                let stop = evaluate_condition(&stop_condition, &marker, &snapshot)
                    .map_err(|error| {
                        EngineError::Runtime(format!(
                            "manager.stop_condition evaluation failed: {error}"
                        ))
                    })?;
                if stop {
                    return Ok(finish(cycle, "stop condition satisfied"));
                }
            }

            if actions.wait && cycle < max_cycles && poll_interval_ms > 0 {
                tokio::time::sleep(Duration::from_millis(poll_interval_ms)).await;
                elapsed_since_steer_ms =
                    elapsed_since_steer_ms.saturating_add(poll_interval_ms);
            } else {
                elapsed_since_steer_ms = elapsed_since_steer_ms.saturating_add(1);
            }
        }

        Ok(StageOutcome::failure(format!(
            "manager loop exhausted {max_cycles} cycle(s) without completion"
        )))
    }
}

fn finish(cycle: u64, reason: &str) -> StageOutcome {
    StageOutcome::success()
        .note(reason.to_string())
        .update("manager.cycles", Value::Number(cycle.into()))
}

fn parse_actions(raw: &str) -> ManagerActions {
    let mut actions = ManagerActions::default();
    for action in raw.split(',').map(str::trim) {
        match action {
            "observe" => actions.observe = true,
            "steer" => actions.steer = true,
            "wait" => actions.wait = true,
            _ => {}
        }
    }
    if !actions.observe && !actions.steer && !actions.wait {
        actions.observe = true;
        actions.wait = true;
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::StageStatus;
    use crate::parse::parse_pipeline;
    use serde_json::json;
    use std::sync::Mutex;

    struct ScriptedObserver {
        reports: Mutex<Vec<ChildReport>>,
        steered: Mutex<Vec<u64>>,
    }

    impl ScriptedObserver {
        fn new(reports: Vec<ChildReport>) -> Self {
            Self {
                reports: Mutex::new(reports),
                steered: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ManagerObserver for ScriptedObserver {
        async fn observe(&self, _cycle: u64) -> Result<ChildReport, EngineError> {
            let mut reports = self.reports.lock().expect("mutex should lock");
            if reports.len() > 1 {
                Ok(reports.remove(0))
            } else {
                Ok(reports.first().cloned().unwrap_or_default())
            }
        }

        async fn steer(&self, cycle: u64, _context: &Context) -> Result<(), EngineError> {
            self.steered.lock().expect("mutex should lock").push(cycle);
            Ok(())
        }
    }

    fn report(status: &str, outcome: &str) -> ChildReport {
        ChildReport {
            status: status.to_string(),
            outcome: outcome.to_string(),
            telemetry: ContextMap::new(),
        }
    }

    fn manager_graph(attrs: &str) -> Graph {
        parse_pipeline(&format!("digraph G {{ m [shape=house, {attrs}] }}"))
            .expect("graph should parse")
    }

    #[tokio::test(flavor = "current_thread")]
    async fn completes_when_child_reports_success() {
        let graph = manager_graph(r#"manager_poll_interval=1ms"#);
        let node = graph.nodes.get("m").expect("node should exist");
        let observer = Arc::new(ScriptedObserver::new(vec![
            report("running", ""),
            report("completed", "success"),
        ]));

        let outcome = ManagerLoopHandler::new(Some(observer))
            .execute(node, &Context::new(), &graph, None)
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(
            outcome.context_updates.get("manager.cycles"),
            Some(&json!(2))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fails_when_child_fails() {
        let graph = manager_graph(r#"manager_poll_interval=1ms"#);
        let node = graph.nodes.get("m").expect("node should exist");
        let observer = Arc::new(ScriptedObserver::new(vec![report("failed", "fail")]));

        let outcome = ManagerLoopHandler::new(Some(observer))
            .execute(node, &Context::new(), &graph, None)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, StageStatus::Fail);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stop_condition_ends_the_loop() {
        let graph = manager_graph(
            r#"manager_poll_interval=1ms, manager_stop_condition="context.stack.ready=true""#,
        );
        let node = graph.nodes.get("m").expect("node should exist");
        let context = Context::new();
        context
            .set("stack.ready", json!(true))
            .expect("set should succeed");

        let outcome = ManagerLoopHandler::new(None)
            .execute(node, &context, &graph, None)
            .await
            .expect("execution should succeed");

        assert_eq!(outcome.status, StageStatus::Success);
        assert!(
            outcome
                .notes
                .expect("notes expected")
                .contains("stop condition")
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn max_cycles_exhaustion_fails() {
        let graph = manager_graph(r#"manager_max_cycles=3, manager_poll_interval=1ms"#);
        let node = graph.nodes.get("m").expect("node should exist");
        let observer = Arc::new(ScriptedObserver::new(vec![report("running", "")]));

        let outcome = ManagerLoopHandler::new(Some(observer))
            .execute(node, &Context::new(), &graph, None)
            .await
            .expect("execution should succeed");
        assert_eq!(outcome.status, StageStatus::Fail);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn steer_respects_cooldown() {
        let graph = manager_graph(
            r#"manager_max_cycles=4, manager_poll_interval=1ms, manager_steer_cooldown_ms=2, manager_actions="observe,steer,wait""#,
        );
        let node = graph.nodes.get("m").expect("node should exist");
        let observer = Arc::new(ScriptedObserver::new(vec![report("running", "")]));

        ManagerLoopHandler::new(Some(Arc::clone(&observer) as Arc<dyn ManagerObserver>))
            .execute(node, &Context::new(), &graph, None)
            .await
            .expect("execution should succeed");

        let steered = observer.steered.lock().expect("mutex should lock").clone();
        assert!(
            steered.len() < 4,
            "cooldown should suppress some steer calls: {steered:?}"
        );
        assert_eq!(steered.first(), Some(&1));
    }

    #[test]
    fn actions_parse_with_default_fallback() {
        let actions = parse_actions("observe, steer");
        assert!(actions.observe && actions.steer && !actions.wait);

        let fallback = parse_actions("bogus");
        assert!(fallback.observe && fallback.wait);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn telemetry_lands_under_child_namespace() {
        let graph = manager_graph(r#"manager_poll_interval=1ms"#);
        let node = graph.nodes.get("m").expect("node should exist");
        let mut telemetry = ContextMap::new();
        telemetry.insert("progress".to_string(), json!(0.5));
        let observer = Arc::new(ScriptedObserver::new(vec![ChildReport {
            status: "completed".to_string(),
            outcome: "success".to_string(),
            telemetry,
        }]));

        let context = Context::new();
        ManagerLoopHandler::new(Some(observer))
            .execute(node, &context, &graph, None)
            .await
            .expect("execution should succeed");

        assert_eq!(
            context
                .get("stack.child.telemetry.progress")
                .expect("read should succeed"),
            Some(json!(0.5))
        );
    }
}
