use crate::EngineError;
use crate::artifacts::{now_iso, write_manifest, write_stage_status};
use crate::cancel::CancelToken;
use crate::checkpoint::{Checkpoint, checkpoint_path};
use crate::context::{Context, ContextMap};
use crate::events::{EventBus, RunEvent, RunEventKind};
use crate::fidelity::{
    RESUME_DEGRADED_FIDELITY, find_incoming_edge, resolve_fidelity, resolve_thread_key,
};
use crate::graph::{Edge, Graph, Node, is_terminal};
use crate::handlers::{FAN_IN_TYPE, HandlerRegistry, PARALLEL_TYPE, builtin_registry};
use crate::interviewer::AutoApproveInterviewer;
use crate::outcome::{StageOutcome, StageStatus};
use crate::retry::{
    BackoffConfig, backoff_delay_ms, outcome_wants_retry, promote_exhausted_retry,
    retry_policy_for,
};
use crate::routing::choose_edge;
use crate::validate::validate_or_raise;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

const RETRY_COUNT_PREFIX: &str = "internal.retry_count.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialSuccess,
    Fail,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Fail => "fail",
        }
    }
}

#[derive(Debug)]
pub struct RunResult {
    pub status: RunStatus,
    pub failure_reason: Option<String>,
    pub completed_nodes: Vec<String>,
    pub outcomes: BTreeMap<String, StageOutcome>,
    pub context: Context,
}

pub struct RunOptions {
    pub run_id: Option<String>,
    pub logs_root: Option<PathBuf>,
    /// Logs root (or checkpoint file) of a previous run to resume from.
    pub resume_from: Option<PathBuf>,
    pub backoff: BackoffConfig,
    /// Bound on goal-gate retry-target jumps; an always-failing gate would
    /// otherwise cycle forever.
    pub max_gate_jumps: u32,
    pub events: EventBus,
    pub cancel: CancelToken,
    /// Pre-built context handle. The store is shared, so a host keeping a
    /// clone can observe the run's context while it executes.
    pub context: Option<Context>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            run_id: None,
            logs_root: None,
            resume_from: None,
            backoff: BackoffConfig::default(),
            max_gate_jumps: 16,
            events: EventBus::new(),
            cancel: CancelToken::new(),
            context: None,
        }
    }
}

/// Drives one cursor through a validated graph: fidelity resolution, handler
/// dispatch with retry, checkpointing, edge selection, goal gates, loop
/// restarts, and the recursive fan-out executor.
#[derive(Clone)]
pub struct PipelineRunner {
    registry: Arc<HandlerRegistry>,
}

impl PipelineRunner {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// Built-in handlers, no backend, auto-approved gates. What
    /// `run --simulate` uses.
    pub fn simulating() -> Self {
        Self::new(builtin_registry(None, Arc::new(AutoApproveInterviewer)))
    }

    pub async fn run(&self, graph: &Graph, options: RunOptions) -> Result<RunResult, EngineError> {
        validate_or_raise(graph, &[])?;

        let run_id = options
            .run_id
            .unwrap_or_else(|| format!("{}-run", graph.id));
        let scope = WalkScope {
            graph: Arc::new(graph.clone()),
            registry: Arc::clone(&self.registry),
            backoff: options.backoff.clone(),
            cancel: options.cancel.clone(),
            logs_root: options.logs_root.clone(),
            events: Some(EventEmitter {
                bus: options.events.clone(),
                run_id: run_id.clone(),
                seq: Arc::new(AtomicU64::new(0)),
            }),
        };
        if let Some(logs_root) = scope.logs_root.as_deref() {
            write_manifest(logs_root, graph)?;
        }

        let started = Instant::now();
        let context = options.context.unwrap_or_default();
        context.set("graph.goal", Value::String(graph.goal().to_string()))?;

        let mut completed: Vec<String> = Vec::new();
        let mut outcomes: BTreeMap<String, StageOutcome> = BTreeMap::new();
        let mut previous: Option<String> = None;
        let mut degrade_once = false;
        let mut cursor: Option<String>;

        let resume_path = options.resume_from.as_deref().map(|path| {
            if path.is_dir() {
                checkpoint_path(path)
            } else {
                path.to_path_buf()
            }
        });
        match self.restore(&scope, resume_path.as_deref(), &context, &mut completed, &mut outcomes)? {
            Restore::Fresh => {
                let start = graph
                    .start_candidates()
                    .into_iter()
                    .next()
                    .ok_or_else(|| EngineError::Graph("pipeline has no start node".to_string()))?;
                cursor = Some(start.id.clone());
            }
            Restore::Resumed {
                next_node,
                degrade_fidelity,
            } => {
                previous = completed.last().cloned();
                degrade_once = degrade_fidelity;
                cursor = next_node;
            }
        }

        scope.emit(RunEventKind::PipelineStarted {
            graph_id: graph.id.clone(),
        });
        info!(run_id = %run_id, graph_id = %graph.id, "pipeline started");

        let mut gate_jumps = 0u32;
        let mut final_status = RunStatus::Success;
        let mut failure_reason: Option<String> = None;

        while let Some(current) = cursor.take() {
            if scope.cancel.is_cancelled() {
                final_status = RunStatus::Fail;
                failure_reason = Some("run cancelled".to_string());
                break;
            }
            let node = graph.nodes.get(&current).ok_or_else(|| {
                EngineError::Graph(format!("cursor reached unknown node '{current}'"))
            })?;
            let terminal = is_terminal(node);

            // Terminal check happens before execution so unsatisfied goal
            // gates can hijack the cursor toward their retry target.
            if terminal {
                if let Some(gate_id) = first_unsatisfied_gate(graph, &outcomes) {
                    match resolve_retry_target(graph, &gate_id) {
                        Some(target) if gate_jumps < options.max_gate_jumps => {
                            gate_jumps += 1;
                            debug!(gate = %gate_id, target = %target, "goal gate unsatisfied, jumping to retry target");
                            previous = completed.last().cloned();
                            cursor = Some(target);
                            continue;
                        }
                        _ => {
                            final_status = RunStatus::Fail;
                            failure_reason = Some(format!(
                                "goal gate unsatisfied: node '{gate_id}' did not succeed"
                            ));
                            break;
                        }
                    }
                }
            }

            let incoming = find_incoming_edge(graph, &node.id, previous.as_deref());
            prepare_step_context(&scope, &context, node, incoming, &mut degrade_once)?;

            let outcome = self.execute_stage(&scope, node, &context).await?;

            completed.push(node.id.clone());
            outcomes.insert(node.id.clone(), outcome.clone());
            context.apply_updates(&outcome.context_updates)?;
            context.set(
                "outcome",
                Value::String(outcome.status.as_str().to_string()),
            )?;
            match outcome.preferred_label.as_deref() {
                Some(label) => context.set("preferred_label", Value::String(label.to_string()))?,
                None => context.remove("preferred_label")?,
            }
            if let Some(logs_root) = scope.logs_root.as_deref() {
                write_stage_status(logs_root, &node.id, &outcome)?;
            }

            if !scope.cancel.is_cancelled() {
                self.save_checkpoint(&scope, &run_id, &node.id, &completed, &context)?;
            }

            if terminal {
                final_status = match outcome.status {
                    StageStatus::PartialSuccess => RunStatus::PartialSuccess,
                    StageStatus::Fail | StageStatus::Skipped => RunStatus::Fail,
                    _ => RunStatus::Success,
                };
                failure_reason = outcome.failure_reason.clone();
                break;
            }

            // Fan-out nodes route straight to the fan-in their branches
            // stopped at; their outgoing edges are branch definitions, not
            // cursor routes.
            if scope.registry.resolve_type(node) == PARALLEL_TYPE {
                match outcome
                    .suggested_next_ids
                    .iter()
                    .find(|id| graph.nodes.contains_key(*id))
                {
                    Some(fan_in) => {
                        previous = Some(node.id.clone());
                        cursor = Some(fan_in.clone());
                        continue;
                    }
                    None => {
                        final_status = run_status_of(&outcome);
                        failure_reason = outcome.failure_reason.clone();
                        break;
                    }
                }
            }

            let snapshot = context.snapshot()?.values;
            match choose_edge(graph, &node.id, &outcome, &snapshot) {
                Some(edge) => {
                    if edge.loop_restart() {
                        self.handle_loop_restart(&scope, &context, &mut outcomes, edge)?;
                    }
                    previous = Some(node.id.clone());
                    cursor = Some(edge.to.clone());
                }
                None => {
                    if outcome.status == StageStatus::Fail {
                        final_status = RunStatus::Fail;
                        failure_reason = Some(
                            outcome
                                .failure_reason
                                .clone()
                                .unwrap_or_else(|| "stage failed".to_string())
                                + " (no outgoing fail edge)",
                        );
                    } else {
                        final_status = run_status_of(&outcome);
                        failure_reason = outcome.failure_reason.clone();
                    }
                    break;
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        match final_status {
            RunStatus::Fail => {
                let reason = failure_reason
                    .clone()
                    .unwrap_or_else(|| "pipeline failed".to_string());
                warn!(run_id = %run_id, reason = %reason, "pipeline failed");
                scope.emit(RunEventKind::PipelineFailed {
                    reason,
                    duration_ms,
                });
            }
            status => {
                info!(run_id = %run_id, status = status.as_str(), "pipeline completed");
                scope.emit(RunEventKind::PipelineCompleted {
                    status: status.as_str().to_string(),
                    duration_ms,
                });
            }
        }

        Ok(RunResult {
            status: final_status,
            failure_reason,
            completed_nodes: completed,
            outcomes,
            context,
        })
    }

    fn restore(
        &self,
        scope: &WalkScope,
        resume_from: Option<&std::path::Path>,
        context: &Context,
        completed: &mut Vec<String>,
        outcomes: &mut BTreeMap<String, StageOutcome>,
    ) -> Result<Restore, EngineError> {
        let Some(resume_from) = resume_from else {
            return Ok(Restore::Fresh);
        };
        if !resume_from.is_file() {
            return Ok(Restore::Fresh);
        }
        let checkpoint = Checkpoint::load(resume_from)?;

        context.apply_updates(&checkpoint.context)?;
        *completed = checkpoint.completed_nodes.clone();
        for node_id in completed.iter() {
            outcomes.insert(node_id.clone(), StageOutcome::success());
        }
        for (node_id, count) in &checkpoint.node_retries {
            context.set(
                format!("{RETRY_COUNT_PREFIX}{node_id}"),
                Value::Number((*count as u64).into()),
            )?;
        }

        scope.emit(RunEventKind::CheckpointResumed {
            node_id: checkpoint.current_node.clone(),
        });

        let graph = &scope.graph;
        let last_is_terminal = graph
            .nodes
            .get(&checkpoint.current_node)
            .map(is_terminal)
            .unwrap_or(false);
        let next_node = if last_is_terminal {
            None
        } else {
            let placeholder = outcomes
                .get(&checkpoint.current_node)
                .cloned()
                .unwrap_or_else(StageOutcome::success);
            choose_edge(
                graph,
                &checkpoint.current_node,
                &placeholder,
                &checkpoint.context,
            )
            .map(|edge| edge.to.clone())
        };

        Ok(Restore::Resumed {
            degrade_fidelity: next_node.is_some()
                && checkpoint.last_fidelity.as_deref() == Some("full"),
            next_node,
        })
    }

    fn save_checkpoint(
        &self,
        scope: &WalkScope,
        run_id: &str,
        node_id: &str,
        completed: &[String],
        context: &Context,
    ) -> Result<(), EngineError> {
        let Some(logs_root) = scope.logs_root.as_deref() else {
            return Ok(());
        };
        let snapshot = context.snapshot()?;
        let node_retries = scan_retry_counts(&snapshot.values);
        let checkpoint = Checkpoint {
            version: crate::checkpoint::CHECKPOINT_VERSION,
            run_id: run_id.to_string(),
            current_node: node_id.to_string(),
            completed_nodes: completed.to_vec(),
            node_retries,
            context: snapshot.values,
            last_fidelity: context
                .get("internal.effective_fidelity")?
                .and_then(|value| value.as_str().map(ToOwned::to_owned)),
            saved_at: now_iso(),
        };
        checkpoint.save(&checkpoint_path(logs_root))?;
        scope.emit(RunEventKind::CheckpointSaved {
            node_id: node_id.to_string(),
            completed_count: completed.len(),
        });
        Ok(())
    }

    fn handle_loop_restart(
        &self,
        scope: &WalkScope,
        context: &Context,
        outcomes: &mut BTreeMap<String, StageOutcome>,
        edge: &Edge,
    ) -> Result<(), EngineError> {
        for key in context.keys_with_prefix(RETRY_COUNT_PREFIX)? {
            context.remove(&key)?;
        }
        let reachable = scope.graph.reachable_from(&edge.to);
        let mut cleared: Vec<String> = Vec::new();
        for node_id in &reachable {
            if outcomes.remove(node_id).is_some() {
                cleared.push(node_id.clone());
            }
        }
        debug!(target = %edge.to, cleared = cleared.len(), "loop restart");
        scope.emit(RunEventKind::LoopRestarted {
            target_node: edge.to.clone(),
            cleared_nodes: cleared,
        });
        Ok(())
    }

    /// Runs one node with the retry policy: Retry and Fail outcomes consume
    /// attempts while any remain, thrown errors retry only when classified
    /// retryable, and cancellation turns into a Fail outcome.
    async fn execute_stage(
        &self,
        scope: &WalkScope,
        node: &Node,
        context: &Context,
    ) -> Result<StageOutcome, EngineError> {
        let policy = retry_policy_for(node, &scope.graph, scope.backoff.clone());
        let handler_type = scope.registry.resolve_type(node);
        if handler_type == "wait.human" {
            scope.emit(RunEventKind::InterviewStarted {
                node_id: node.id.clone(),
            });
        }

        let started = Instant::now();
        let mut attempt: u32 = 1;
        loop {
            scope.emit(RunEventKind::StageStarted {
                node_id: node.id.clone(),
                attempt,
            });

            let invocation = self.dispatch(scope, node, context, &handler_type);
            let result = match node.timeout_millis() {
                Some(millis) => {
                    let limit = Duration::from_millis(millis);
                    tokio::select! {
                        _ = scope.cancel.cancelled() => Err(EngineError::Cancelled),
                        timed = tokio::time::timeout(limit, invocation) => {
                            timed.unwrap_or(Err(EngineError::StageTimeout {
                                node_id: node.id.clone(),
                                millis,
                            }))
                        }
                    }
                }
                None => tokio::select! {
                    _ = scope.cancel.cancelled() => Err(EngineError::Cancelled),
                    result = invocation => result,
                },
            };

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(EngineError::Cancelled) => StageOutcome::failure("run cancelled"),
                Err(error) if error.is_retryable() && attempt < policy.max_attempts => {
                    attempt = self
                        .schedule_retry(scope, node, context, attempt, &policy.backoff)
                        .await?;
                    continue;
                }
                Err(error) => StageOutcome::failure(error.to_string()),
            };

            if outcome_wants_retry(&outcome)
                && attempt < policy.max_attempts
                && !scope.cancel.is_cancelled()
            {
                attempt = self
                    .schedule_retry(scope, node, context, attempt, &policy.backoff)
                    .await?;
                continue;
            }

            let accepted = if outcome.status == StageStatus::Retry {
                promote_exhausted_retry(node)
            } else {
                outcome
            };

            let duration_ms = started.elapsed().as_millis() as u64;
            if accepted.status == StageStatus::Fail {
                scope.emit(RunEventKind::StageFailed {
                    node_id: node.id.clone(),
                    attempt,
                    reason: accepted
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "stage failed".to_string()),
                });
            } else {
                scope.emit(RunEventKind::StageCompleted {
                    node_id: node.id.clone(),
                    attempt,
                    status: accepted.status.as_str().to_string(),
                    duration_ms,
                });
            }
            return Ok(accepted);
        }
    }

    async fn schedule_retry(
        &self,
        scope: &WalkScope,
        node: &Node,
        context: &Context,
        attempt: u32,
        backoff: &BackoffConfig,
    ) -> Result<u32, EngineError> {
        let used = context.get_i64(&format!("{RETRY_COUNT_PREFIX}{}", node.id))?;
        context.set(
            format!("{RETRY_COUNT_PREFIX}{}", node.id),
            Value::Number(((used + 1) as u64).into()),
        )?;

        let delay_ms = backoff_delay_ms(attempt, backoff);
        scope.emit(RunEventKind::StageRetrying {
            node_id: node.id.clone(),
            attempt,
            next_attempt: attempt + 1,
            delay_ms,
        });
        debug!(node = %node.id, attempt, delay_ms, "stage retrying");

        tokio::select! {
            _ = scope.cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
        }
        Ok(attempt + 1)
    }

    async fn dispatch(
        &self,
        scope: &WalkScope,
        node: &Node,
        context: &Context,
        handler_type: &str,
    ) -> Result<StageOutcome, EngineError> {
        if handler_type == PARALLEL_TYPE {
            return self.run_parallel(scope, node, context).await;
        }
        let handler = scope.registry.resolve(node)?;
        handler
            .execute(node, context, &scope.graph, scope.logs_root.as_deref())
            .await
    }

    /// Fan-out executor: one cloned-context sub-walk per outgoing edge,
    /// bounded by a `max_parallel` semaphore, aggregated under the node's
    /// join and error policies. Branch results keep declaration order.
    async fn run_parallel(
        &self,
        scope: &WalkScope,
        node: &Node,
        context: &Context,
    ) -> Result<StageOutcome, EngineError> {
        let branches: Vec<Edge> = scope.graph.outgoing(&node.id).cloned().collect();
        if branches.is_empty() {
            return Ok(StageOutcome::failure(format!(
                "parallel node '{}' has no outgoing branches",
                node.id
            )));
        }

        let join_policy = node
            .attrs
            .get_trimmed("join_policy")
            .unwrap_or("wait_all")
            .to_string();
        let join_k = node.attrs.get_i64("join_k").filter(|k| *k > 0).unwrap_or(1) as usize;
        let join_quorum = node
            .attrs
            .get_f64("join_quorum")
            .filter(|q| *q > 0.0 && *q <= 1.0)
            .unwrap_or(0.5);
        let error_policy = node
            .attrs
            .get_trimmed("error_policy")
            .unwrap_or("continue")
            .to_string();
        let max_parallel = node
            .attrs
            .get_i64("max_parallel")
            .filter(|value| *value > 0)
            .unwrap_or(4) as usize;

        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let group_cancelled = Arc::new(AtomicBool::new(false));
        let fail_fast = error_policy == "fail_fast";

        let mut handles = Vec::with_capacity(branches.len());
        for edge in &branches {
            let branch_name = match edge.label().trim() {
                "" => edge.to.clone(),
                label => label.to_string(),
            };
            let branch_scope = scope.for_branch();
            let runner = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let group_cancelled = Arc::clone(&group_cancelled);
            let parent_context = context.clone_detached()?;
            let target = edge.to.clone();
            let origin = node.id.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("branch semaphore is never closed");
                if group_cancelled.load(Ordering::SeqCst) {
                    return BranchResult {
                        branch: branch_name,
                        target,
                        status: StageStatus::Fail,
                        failure_reason: Some("cancelled due to fail_fast".to_string()),
                        notes: None,
                        fan_in: None,
                    };
                }

                let walk =
                    runner.branch_walk(branch_scope, target.clone(), Some(origin), parent_context);
                let (outcome, fan_in) = match walk.await {
                    Ok(done) => done,
                    Err(error) => (StageOutcome::failure(error.to_string()), None),
                };
                if fail_fast && outcome.status == StageStatus::Fail {
                    group_cancelled.store(true, Ordering::SeqCst);
                }
                BranchResult {
                    branch: branch_name,
                    target,
                    status: outcome.status,
                    failure_reason: outcome.failure_reason,
                    notes: outcome.notes,
                    fan_in,
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.map_err(|error| {
                EngineError::Runtime(format!("parallel branch task panicked: {error}"))
            })?);
        }

        let total = results.len();
        let countable: Vec<&BranchResult> = results
            .iter()
            .filter(|result| error_policy != "ignore" || result.status != StageStatus::Fail)
            .collect();
        let successes = countable
            .iter()
            .filter(|result| result.status.is_success_like())
            .count();
        let failures = countable
            .iter()
            .filter(|result| result.status == StageStatus::Fail)
            .count();

        let (status, notes) = match join_policy.as_str() {
            "first_success" => {
                if successes >= 1 {
                    (
                        StageStatus::Success,
                        format!("first_success satisfied with {successes} successful branch(es)"),
                    )
                } else {
                    (
                        StageStatus::Fail,
                        "first_success unsatisfied: no branch succeeded".to_string(),
                    )
                }
            }
            "k_of_n" => {
                if successes >= join_k {
                    (
                        StageStatus::Success,
                        format!("k_of_n satisfied: {successes}/{total} succeeded (k={join_k})"),
                    )
                } else {
                    (
                        StageStatus::Fail,
                        format!("k_of_n unsatisfied: {successes}/{total} succeeded (k={join_k})"),
                    )
                }
            }
            "quorum" => {
                let required = ((total as f64) * join_quorum).ceil().max(1.0) as usize;
                if successes >= required {
                    (
                        StageStatus::Success,
                        format!("quorum satisfied: {successes}/{total} (required {required})"),
                    )
                } else {
                    (
                        StageStatus::Fail,
                        format!("quorum unsatisfied: {successes}/{total} (required {required})"),
                    )
                }
            }
            _ => {
                if failures == 0 {
                    (
                        StageStatus::Success,
                        format!("all {total} branch(es) succeeded"),
                    )
                } else {
                    (
                        StageStatus::PartialSuccess,
                        format!("{successes}/{total} branches succeeded"),
                    )
                }
            }
        };

        let fan_in = results.iter().find_map(|result| result.fan_in.clone());
        let results_json: Vec<Value> = results.iter().map(BranchResult::to_json).collect();

        let mut outcome = StageOutcome::with_status(status).note(notes);
        if status == StageStatus::Fail {
            outcome.failure_reason = outcome.notes.clone();
        }
        outcome = outcome
            .update("parallel.results", Value::Array(results_json))
            .update("parallel.branch_count", json!(total))
            .update("parallel.success_count", json!(successes))
            .update("parallel.failure_count", json!(failures));
        if let Some(fan_in) = fan_in {
            outcome.suggested_next_ids.push(fan_in);
        }
        Ok(outcome)
    }

    /// Sub-walk: the main loop minus lifecycle events, checkpoints, and
    /// goal gates. Stops at terminals, fan-in nodes (unexecuted), or dead
    /// ends, and reports the last outcome plus the fan-in it parked at.
    fn branch_walk(
        &self,
        scope: WalkScope,
        start: String,
        origin: Option<String>,
        context: Context,
    ) -> BoxFuture<'static, Result<(StageOutcome, Option<String>), EngineError>> {
        let runner = self.clone();
        Box::pin(async move {
            let mut cursor = start;
            let mut previous = origin;
            let mut last_outcome = StageOutcome::success();
            let mut no_degrade = false;

            loop {
                if scope.cancel.is_cancelled() {
                    return Ok((StageOutcome::failure("run cancelled"), None));
                }
                let node = scope
                    .graph
                    .nodes
                    .get(&cursor)
                    .ok_or_else(|| {
                        EngineError::Graph(format!("branch walk reached unknown node '{cursor}'"))
                    })?
                    .clone();

                if scope.registry.resolve_type(&node) == FAN_IN_TYPE {
                    return Ok((last_outcome, Some(node.id.clone())));
                }

                let incoming = find_incoming_edge(&scope.graph, &node.id, previous.as_deref());
                prepare_step_context(&scope, &context, &node, incoming, &mut no_degrade)?;
                let outcome = runner.execute_stage(&scope, &node, &context).await?;
                context.apply_updates(&outcome.context_updates)?;
                context.set(
                    "outcome",
                    Value::String(outcome.status.as_str().to_string()),
                )?;
                last_outcome = outcome;

                if is_terminal(&node) {
                    return Ok((last_outcome, None));
                }

                let snapshot = context.snapshot()?.values;
                let Some(edge) = choose_edge(&scope.graph, &node.id, &last_outcome, &snapshot)
                else {
                    return Ok((last_outcome, None));
                };
                previous = Some(node.id.clone());
                cursor = edge.to.clone();
            }
        })
    }
}

enum Restore {
    Fresh,
    Resumed {
        next_node: Option<String>,
        degrade_fidelity: bool,
    },
}

#[derive(Clone)]
struct WalkScope {
    graph: Arc<Graph>,
    registry: Arc<HandlerRegistry>,
    backoff: BackoffConfig,
    cancel: CancelToken,
    logs_root: Option<PathBuf>,
    events: Option<EventEmitter>,
}

impl WalkScope {
    fn emit(&self, kind: RunEventKind) {
        if let Some(events) = self.events.as_ref() {
            events.emit(kind);
        }
    }

    /// Branch scopes share graph, registry, and cancellation but stay
    /// silent on the event stream and skip checkpoint/artifact writes.
    fn for_branch(&self) -> Self {
        Self {
            graph: Arc::clone(&self.graph),
            registry: Arc::clone(&self.registry),
            backoff: self.backoff.clone(),
            cancel: self.cancel.clone(),
            logs_root: None,
            events: None,
        }
    }
}

#[derive(Clone)]
struct EventEmitter {
    bus: EventBus,
    run_id: String,
    seq: Arc<AtomicU64>,
}

impl EventEmitter {
    fn emit(&self, kind: RunEventKind) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.bus.emit(RunEvent {
            seq,
            timestamp: now_iso(),
            run_id: self.run_id.clone(),
            kind,
        });
    }
}

#[derive(Clone, Debug)]
struct BranchResult {
    branch: String,
    target: String,
    status: StageStatus,
    failure_reason: Option<String>,
    notes: Option<String>,
    fan_in: Option<String>,
}

impl BranchResult {
    fn to_json(&self) -> Value {
        json!({
            "branch": self.branch,
            "target": self.target,
            "status": self.status.as_str(),
            "failure_reason": self.failure_reason,
            "notes": self.notes,
        })
    }
}

/// Writes the per-step `internal.*` keys: incoming-edge fidelity and thread
/// id, the resolved effective fidelity (degraded once after a `full` resume),
/// and the thread key when running at `full`.
fn prepare_step_context(
    scope: &WalkScope,
    context: &Context,
    node: &Node,
    incoming: Option<&Edge>,
    degrade_once: &mut bool,
) -> Result<(), EngineError> {
    match incoming.and_then(|edge| edge.attrs.get_trimmed("fidelity")) {
        Some(fidelity) => context.set(
            "internal.incoming_edge_fidelity",
            Value::String(fidelity.to_string()),
        )?,
        None => context.remove("internal.incoming_edge_fidelity")?,
    }
    match incoming.and_then(|edge| edge.attrs.get_trimmed("thread_id")) {
        Some(thread_id) => context.set(
            "internal.incoming_edge_thread_id",
            Value::String(thread_id.to_string()),
        )?,
        None => context.remove("internal.incoming_edge_thread_id")?,
    }

    let mut effective = resolve_fidelity(&scope.graph, &node.id, incoming);
    if *degrade_once {
        effective = RESUME_DEGRADED_FIDELITY.to_string();
        *degrade_once = false;
    }
    context.set(
        "internal.effective_fidelity",
        Value::String(effective.clone()),
    )?;

    if effective == "full" {
        let previous = incoming.map(|edge| edge.from.as_str());
        let thread_key = resolve_thread_key(&scope.graph, &node.id, incoming, previous);
        context.set("internal.thread_key", Value::String(thread_key))?;
    } else {
        context.remove("internal.thread_key")?;
    }
    Ok(())
}

fn first_unsatisfied_gate(graph: &Graph, outcomes: &BTreeMap<String, StageOutcome>) -> Option<String> {
    graph
        .nodes
        .values()
        .filter(|node| node.goal_gate())
        .find(|node| {
            outcomes
                .get(&node.id)
                .is_some_and(|outcome| !outcome.status.is_success_like())
        })
        .map(|node| node.id.clone())
}

fn resolve_retry_target(graph: &Graph, gate_id: &str) -> Option<String> {
    let gate = graph.nodes.get(gate_id)?;
    [
        gate.attrs.get_trimmed("retry_target"),
        gate.attrs.get_trimmed("fallback_retry_target"),
        graph.attrs.get_trimmed("retry_target"),
        graph.attrs.get_trimmed("fallback_retry_target"),
    ]
    .into_iter()
    .flatten()
    .find(|target| graph.nodes.contains_key(*target))
    .map(ToOwned::to_owned)
}

fn run_status_of(outcome: &StageOutcome) -> RunStatus {
    match outcome.status {
        StageStatus::Success | StageStatus::Retry => RunStatus::Success,
        StageStatus::PartialSuccess => RunStatus::PartialSuccess,
        StageStatus::Fail | StageStatus::Skipped => RunStatus::Fail,
    }
}

fn scan_retry_counts(snapshot: &ContextMap) -> BTreeMap<String, u32> {
    snapshot
        .iter()
        .filter_map(|(key, value)| {
            let node_id = key.strip_prefix(RETRY_COUNT_PREFIX)?;
            let count = value.as_u64()? as u32;
            Some((node_id.to_string(), count))
        })
        .collect()
}
