use async_trait::async_trait;
use attractor_engine::handlers::StageHandler;
use attractor_engine::{
    AutoApproveInterviewer, BackoffConfig, CancelToken, Checkpoint, Context, EventBus, Graph,
    Node, PipelineRunner, RunEvent, RunEventKind, RunOptions, RunStatus, StageOutcome,
    StageStatus, builtin_registry, checkpoint_path, parse_pipeline,
};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

struct CountingHandler {
    calls: Arc<AtomicU32>,
    fail_first: u32,
}

#[async_trait]
impl StageHandler for CountingHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &Context,
        _graph: &Graph,
        _logs_root: Option<&Path>,
    ) -> Result<StageOutcome, attractor_engine::EngineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            Ok(StageOutcome::failure(format!(
                "{} failing on call {call}",
                node.id
            )))
        } else {
            Ok(StageOutcome::success())
        }
    }
}

fn runner_with(
    extra: Vec<(&str, Arc<dyn StageHandler>)>,
) -> PipelineRunner {
    let mut registry = builtin_registry(None, Arc::new(AutoApproveInterviewer));
    for (handler_type, handler) in extra {
        registry.register(handler_type, handler);
    }
    PipelineRunner::new(registry)
}

fn collecting_bus() -> (EventBus, Arc<Mutex<Vec<RunEvent>>>) {
    let bus = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(Arc::new(move |event: &RunEvent| {
        sink.lock().expect("event mutex should lock").push(event.clone());
    }));
    (bus, seen)
}

fn event_names(seen: &Mutex<Vec<RunEvent>>) -> Vec<&'static str> {
    seen.lock()
        .expect("event mutex should lock")
        .iter()
        .map(|event| event.kind.name())
        .collect()
}

fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter_ratio: 0.0,
    }
}

#[tokio::test(flavor = "current_thread")]
async fn linear_simulate_run_writes_artifacts_in_visitation_order() {
    let temp = TempDir::new().expect("temp dir should be created");
    let graph = parse_pipeline(
        r#"
        digraph demo {
            graph [goal="ship the demo"]
            start [shape=Mdiamond]
            a [prompt="first step of $goal"]
            b [prompt="second step"]
            exit [shape=Msquare]
            start -> a -> b -> exit
        }
        "#,
    )
    .expect("graph should parse");

    let (events, seen) = collecting_bus();
    let result = PipelineRunner::simulating()
        .run(
            &graph,
            RunOptions {
                logs_root: Some(temp.path().to_path_buf()),
                events,
                ..RunOptions::default()
            },
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.completed_nodes, vec!["start", "a", "b", "exit"]);

    for artifact in [
        "manifest.json",
        "checkpoint.json",
        "a/prompt.md",
        "a/response.md",
        "a/status.json",
        "b/prompt.md",
    ] {
        assert!(
            temp.path().join(artifact).is_file(),
            "expected artifact {artifact}"
        );
    }

    let names = event_names(&seen);
    assert_eq!(names.first(), Some(&"pipeline_started"));
    assert_eq!(names.last(), Some(&"pipeline_completed"));
    assert!(!names.contains(&"stage_retrying"));

    let checkpoint = Checkpoint::load(&checkpoint_path(temp.path()))
        .expect("checkpoint should load");
    assert_eq!(checkpoint.current_node, "exit");
    assert_eq!(checkpoint.completed_nodes, result.completed_nodes);
}

#[tokio::test(flavor = "current_thread")]
async fn conditional_gate_retries_failed_stage_then_exits() {
    let calls = Arc::new(AtomicU32::new(0));
    let runner = runner_with(vec![(
        "flaky",
        Arc::new(CountingHandler {
            calls: Arc::clone(&calls),
            fail_first: 1,
        }) as Arc<dyn StageHandler>,
    )]);

    let graph = parse_pipeline(
        r#"
        digraph G {
            start [shape=Mdiamond]
            plan
            implement [type="flaky", max_retries=2]
            gate [shape=diamond]
            exit [shape=Msquare]
            start -> plan -> implement -> gate
            gate -> exit [condition="outcome=success"]
            gate -> implement [condition="outcome!=success"]
        }
        "#,
    )
    .expect("graph should parse");

    let (events, seen) = collecting_bus();
    let result = runner
        .run(
            &graph,
            RunOptions {
                backoff: fast_backoff(),
                events,
                ..RunOptions::default()
            },
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 2, "fail once, succeed on retry");
    assert_eq!(
        result.completed_nodes,
        vec!["start", "plan", "implement", "gate", "exit"]
    );
    assert_eq!(
        event_names(&seen)
            .iter()
            .filter(|name| **name == "stage_retrying")
            .count(),
        1
    );
}

#[tokio::test(flavor = "current_thread")]
async fn weight_tiebreak_picks_heavier_edge() {
    let graph = parse_pipeline(
        r#"
        digraph G {
            start [shape=Mdiamond]
            pick
            heavy
            light
            exit [shape=Msquare]
            start -> pick
            pick -> light [weight=5]
            pick -> heavy [weight=10]
            heavy -> exit
            light -> exit
        }
        "#,
    )
    .expect("graph should parse");

    let result = PipelineRunner::simulating()
        .run(&graph, RunOptions::default())
        .await
        .expect("run should succeed");

    assert!(result.completed_nodes.contains(&"heavy".to_string()));
    assert!(!result.completed_nodes.contains(&"light".to_string()));
}

// Branches b2 and b3 are dead ends on purpose: an unconditional edge out
// of a failing node would route the sub-walk onward, so a failing branch
// must stop where it failed for its result to stay a failure.
fn fan_out_graph(join_attrs: &str, failing: &[&str]) -> Graph {
    let mark = |id: &str| {
        if failing.contains(&id) {
            format!("{id} [type=\"always_fail\"]")
        } else {
            id.to_string()
        }
    };
    parse_pipeline(&format!(
        r#"
        digraph G {{
            start [shape=Mdiamond]
            fanout [shape=component, {join_attrs}]
            {b1}
            {b2}
            {b3}
            exit [shape=Msquare]
            start -> fanout
            fanout -> b1
            fanout -> b2
            fanout -> b3
            b1 -> exit
        }}
        "#,
        b1 = mark("b1"),
        b2 = mark("b2"),
        b3 = mark("b3"),
    ))
    .expect("graph should parse")
}

fn always_fail() -> Arc<dyn StageHandler> {
    Arc::new(CountingHandler {
        calls: Arc::new(AtomicU32::new(0)),
        fail_first: u32::MAX,
    })
}

fn parallel_results(result: &attractor_engine::RunResult) -> Vec<Value> {
    result
        .context
        .get("parallel.results")
        .expect("context read should succeed")
        .and_then(|value| value.as_array().cloned())
        .expect("parallel.results should be an array")
}

#[tokio::test(flavor = "current_thread")]
async fn k_of_n_join_succeeds_with_enough_branches() {
    let runner = runner_with(vec![("always_fail", always_fail())]);
    let graph = fan_out_graph("join_policy=\"k_of_n\", join_k=2", &["b3"]);

    let result = runner
        .run(&graph, RunOptions::default())
        .await
        .expect("run should succeed");

    assert_eq!(result.status, RunStatus::Success);
    let results = parallel_results(&result);
    assert_eq!(results.len(), 3);
    let fanout = result.outcomes.get("fanout").expect("fanout outcome recorded");
    assert_eq!(fanout.status, StageStatus::Success);
}

#[tokio::test(flavor = "current_thread")]
async fn k_of_n_join_fails_below_threshold_but_keeps_results() {
    let runner = runner_with(vec![("always_fail", always_fail())]);
    let graph = fan_out_graph("join_policy=\"k_of_n\", join_k=2", &["b2", "b3"]);

    let result = runner
        .run(&graph, RunOptions::default())
        .await
        .expect("run should complete");

    assert_eq!(result.status, RunStatus::Fail);
    let results = parallel_results(&result);
    assert_eq!(results.len(), 3);
    let fanout = result.outcomes.get("fanout").expect("fanout outcome recorded");
    assert_eq!(fanout.status, StageStatus::Fail);
}

#[tokio::test(flavor = "current_thread")]
async fn wait_all_with_one_failure_is_partial_success() {
    let runner = runner_with(vec![("always_fail", always_fail())]);
    let graph = fan_out_graph("join_policy=\"wait_all\"", &["b3"]);

    let result = runner
        .run(&graph, RunOptions::default())
        .await
        .expect("run should complete");

    assert_eq!(result.status, RunStatus::PartialSuccess);
    let fanout = result.outcomes.get("fanout").expect("fanout outcome recorded");
    assert_eq!(fanout.status, StageStatus::PartialSuccess);
    assert!(
        fanout
            .notes
            .as_deref()
            .expect("notes expected")
            .contains("2/3")
    );
}

#[tokio::test(flavor = "current_thread")]
async fn ignore_error_policy_excludes_failures_from_counting() {
    let runner = runner_with(vec![("always_fail", always_fail())]);
    let graph = fan_out_graph(
        "join_policy=\"wait_all\", error_policy=\"ignore\"",
        &["b3"],
    );

    let result = runner
        .run(&graph, RunOptions::default())
        .await
        .expect("run should complete");

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(parallel_results(&result).len(), 3);
}

#[tokio::test(flavor = "current_thread")]
async fn fail_fast_marks_unscheduled_branches_cancelled() {
    let runner = runner_with(vec![("always_fail", always_fail())]);
    // One permit means branches run strictly one after another; the first
    // branch fails in place (it has no outgoing edge), so everything
    // scheduled behind it must be cancelled.
    let graph = parse_pipeline(
        r#"
        digraph G {
            start [shape=Mdiamond]
            fanout [shape=component, error_policy="fail_fast", max_parallel=1]
            bad [type="always_fail"]
            g1
            g2
            exit [shape=Msquare]
            start -> fanout
            fanout -> bad
            fanout -> g1
            fanout -> g2
            g1 -> exit
        }
        "#,
    )
    .expect("graph should parse");

    let result = runner
        .run(&graph, RunOptions::default())
        .await
        .expect("run should complete");

    let results = parallel_results(&result);
    assert_eq!(results.len(), 3);
    let cancelled: Vec<&Value> = results
        .iter()
        .filter(|entry| {
            entry["failure_reason"]
                .as_str()
                .is_some_and(|reason| reason.contains("fail_fast"))
        })
        .collect();
    assert_eq!(cancelled.len(), 2, "branches behind the failure are cancelled");
}

#[tokio::test(flavor = "current_thread")]
async fn single_branch_fan_out_behaves_sequentially_under_all_policies() {
    for policy in ["wait_all", "first_success", "k_of_n", "quorum"] {
        let graph = parse_pipeline(&format!(
            r#"
            digraph G {{
                start [shape=Mdiamond]
                fanout [shape=component, join_policy="{policy}"]
                only
                exit [shape=Msquare]
                start -> fanout
                fanout -> only
                only -> exit
            }}
            "#,
        ))
        .expect("graph should parse");

        let result = PipelineRunner::simulating()
            .run(&graph, RunOptions::default())
            .await
            .expect("run should succeed");
        assert_eq!(result.status, RunStatus::Success, "policy {policy}");
        assert_eq!(parallel_results(&result).len(), 1, "policy {policy}");
    }
}

struct SlowHandler {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl StageHandler for SlowHandler {
    async fn execute(
        &self,
        _node: &Node,
        _context: &Context,
        _graph: &Graph,
        _logs_root: Option<&Path>,
    ) -> Result<StageOutcome, attractor_engine::EngineError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(StageOutcome::success())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn max_parallel_bounds_concurrent_branches() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let runner = runner_with(vec![(
        "slow",
        Arc::new(SlowHandler {
            active: Arc::clone(&active),
            peak: Arc::clone(&peak),
        }) as Arc<dyn StageHandler>,
    )]);

    let graph = parse_pipeline(
        r#"
        digraph G {
            start [shape=Mdiamond]
            fanout [shape=component, max_parallel=2]
            w1 [type="slow"]
            w2 [type="slow"]
            w3 [type="slow"]
            w4 [type="slow"]
            exit [shape=Msquare]
            start -> fanout
            fanout -> w1
            fanout -> w2
            fanout -> w3
            fanout -> w4
            w1 -> exit
        }
        "#,
    )
    .expect("graph should parse");

    let result = runner
        .run(&graph, RunOptions::default())
        .await
        .expect("run should succeed");

    assert_eq!(result.status, RunStatus::Success);
    assert!(
        peak.load(Ordering::SeqCst) <= 2,
        "no more than max_parallel branches may run at once"
    );
}

#[tokio::test(flavor = "current_thread")]
async fn branch_context_mutations_stay_invisible_to_parent() {
    struct TaintHandler;

    #[async_trait]
    impl StageHandler for TaintHandler {
        async fn execute(
            &self,
            node: &Node,
            context: &Context,
            _graph: &Graph,
            _logs_root: Option<&Path>,
        ) -> Result<StageOutcome, attractor_engine::EngineError> {
            context.set(
                format!("branch.taint.{}", node.id),
                Value::String(node.id.clone()),
            )?;
            Ok(StageOutcome::success())
        }
    }

    let runner = runner_with(vec![(
        "taint",
        Arc::new(TaintHandler) as Arc<dyn StageHandler>,
    )]);
    let graph = parse_pipeline(
        r#"
        digraph G {
            start [shape=Mdiamond]
            fanout [shape=component]
            t1 [type="taint"]
            t2 [type="taint"]
            exit [shape=Msquare]
            start -> fanout
            fanout -> t1
            fanout -> t2
            t1 -> exit
        }
        "#,
    )
    .expect("graph should parse");

    let result = runner
        .run(&graph, RunOptions::default())
        .await
        .expect("run should succeed");

    assert_eq!(
        result
            .context
            .get("branch.taint.t1")
            .expect("context read should succeed"),
        None,
        "sibling writes must not reach the parent context"
    );
    assert!(
        result
            .context
            .get("parallel.results")
            .expect("context read should succeed")
            .is_some()
    );
}

#[tokio::test(flavor = "current_thread")]
async fn loop_restart_clears_outcomes_and_retry_counters() {
    let work_calls = Arc::new(AtomicU32::new(0));
    let gate_calls = Arc::new(AtomicU32::new(0));
    let runner = runner_with(vec![
        (
            "worker",
            Arc::new(CountingHandler {
                calls: Arc::clone(&work_calls),
                fail_first: 0,
            }) as Arc<dyn StageHandler>,
        ),
        (
            "flaky_gate",
            Arc::new(CountingHandler {
                calls: Arc::clone(&gate_calls),
                fail_first: 1,
            }) as Arc<dyn StageHandler>,
        ),
    ]);

    let graph = parse_pipeline(
        r#"
        digraph G {
            start [shape=Mdiamond]
            work [type="worker"]
            gate [type="flaky_gate"]
            exit [shape=Msquare]
            start -> work -> gate
            gate -> work [loop_restart=true, condition="outcome=fail"]
            gate -> exit [condition="outcome=success"]
        }
        "#,
    )
    .expect("graph should parse");

    let (events, seen) = collecting_bus();
    let result = runner
        .run(
            &graph,
            RunOptions {
                events,
                ..RunOptions::default()
            },
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(work_calls.load(Ordering::SeqCst), 2, "work re-runs after restart");
    assert_eq!(
        result.completed_nodes,
        vec!["start", "work", "gate", "work", "gate", "exit"]
    );
    assert_eq!(
        event_names(&seen)
            .iter()
            .filter(|name| **name == "loop_restarted")
            .count(),
        1
    );
    assert_eq!(
        result
            .context
            .get_i64("internal.retry_count.work")
            .expect("context read should succeed"),
        0
    );
}

#[tokio::test(flavor = "current_thread")]
async fn resume_skips_completed_nodes_and_continues() {
    let temp = TempDir::new().expect("temp dir should be created");
    let graph_source = r#"
        digraph G {
            start [shape=Mdiamond]
            a [type="tracked"]
            b [type="tracked"]
            exit [shape=Msquare]
            start -> a -> b -> exit
        }
    "#;
    let graph = parse_pipeline(graph_source).expect("graph should parse");

    let calls = Arc::new(AtomicU32::new(0));
    let runner = runner_with(vec![(
        "tracked",
        Arc::new(CountingHandler {
            calls: Arc::clone(&calls),
            fail_first: 0,
        }) as Arc<dyn StageHandler>,
    )]);

    let checkpoint = Checkpoint {
        version: 1,
        run_id: "G-run".to_string(),
        current_node: "a".to_string(),
        completed_nodes: vec!["start".to_string(), "a".to_string()],
        node_retries: Default::default(),
        context: [("outcome".to_string(), Value::String("success".to_string()))]
            .into_iter()
            .collect(),
        last_fidelity: Some("compact".to_string()),
        saved_at: "2026-01-01T00:00:00Z".to_string(),
    };
    checkpoint
        .save(&checkpoint_path(temp.path()))
        .expect("checkpoint should save");

    let (events, seen) = collecting_bus();
    let result = runner
        .run(
            &graph,
            RunOptions {
                logs_root: Some(temp.path().to_path_buf()),
                resume_from: Some(temp.path().to_path_buf()),
                events,
                ..RunOptions::default()
            },
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "only b runs after resume");
    assert_eq!(
        result.completed_nodes,
        vec!["start", "a", "b", "exit"],
        "restored prefix plus the resumed suffix"
    );
    assert_eq!(
        event_names(&seen)
            .iter()
            .filter(|name| **name == "checkpoint_resumed")
            .count(),
        1
    );
}

#[tokio::test(flavor = "current_thread")]
async fn resume_after_full_fidelity_degrades_first_step_once() {
    struct FidelityProbe {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl StageHandler for FidelityProbe {
        async fn execute(
            &self,
            _node: &Node,
            context: &Context,
            _graph: &Graph,
            _logs_root: Option<&Path>,
        ) -> Result<StageOutcome, attractor_engine::EngineError> {
            self.seen
                .lock()
                .expect("mutex should lock")
                .push(context.get_str("internal.effective_fidelity")?);
            Ok(StageOutcome::success())
        }
    }

    let temp = TempDir::new().expect("temp dir should be created");
    let graph = parse_pipeline(
        r#"
        digraph G {
            graph [default_fidelity="full"]
            start [shape=Mdiamond]
            a [type="probe"]
            b [type="probe"]
            c [type="probe"]
            exit [shape=Msquare]
            start -> a -> b -> c -> exit
        }
        "#,
    )
    .expect("graph should parse");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let runner = runner_with(vec![(
        "probe",
        Arc::new(FidelityProbe {
            seen: Arc::clone(&seen),
        }) as Arc<dyn StageHandler>,
    )]);

    let checkpoint = Checkpoint {
        version: 1,
        run_id: "G-run".to_string(),
        current_node: "a".to_string(),
        completed_nodes: vec!["start".to_string(), "a".to_string()],
        node_retries: Default::default(),
        context: Default::default(),
        last_fidelity: Some("full".to_string()),
        saved_at: "2026-01-01T00:00:00Z".to_string(),
    };
    checkpoint
        .save(&checkpoint_path(temp.path()))
        .expect("checkpoint should save");

    runner
        .run(
            &graph,
            RunOptions {
                resume_from: Some(temp.path().to_path_buf()),
                ..RunOptions::default()
            },
        )
        .await
        .expect("run should succeed");

    let fidelities = seen.lock().expect("mutex should lock").clone();
    assert_eq!(
        fidelities,
        vec!["summary:high".to_string(), "full".to_string()],
        "first post-resume step degrades, the next resolves normally"
    );
}

#[tokio::test(flavor = "current_thread")]
async fn cancellation_during_retry_sleep_fails_the_run() {
    struct AlwaysRetry;

    #[async_trait]
    impl StageHandler for AlwaysRetry {
        async fn execute(
            &self,
            _node: &Node,
            _context: &Context,
            _graph: &Graph,
            _logs_root: Option<&Path>,
        ) -> Result<StageOutcome, attractor_engine::EngineError> {
            Ok(StageOutcome::retry("not ready"))
        }
    }

    let runner = runner_with(vec![(
        "stubborn",
        Arc::new(AlwaysRetry) as Arc<dyn StageHandler>,
    )]);
    let graph = parse_pipeline(
        r#"
        digraph G {
            start [shape=Mdiamond]
            wait [type="stubborn", max_retries=10]
            exit [shape=Msquare]
            start -> wait -> exit
        }
        "#,
    )
    .expect("graph should parse");

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let result = runner
        .run(
            &graph,
            RunOptions {
                cancel,
                backoff: BackoffConfig {
                    base_delay_ms: 60_000,
                    max_delay_ms: 60_000,
                    jitter_ratio: 0.0,
                },
                ..RunOptions::default()
            },
        )
        .await
        .expect("run should complete");

    assert_eq!(result.status, RunStatus::Fail);
    assert!(
        result
            .failure_reason
            .expect("failure reason expected")
            .contains("cancelled")
    );
}

#[tokio::test(flavor = "current_thread")]
async fn goal_gate_failure_jumps_to_retry_target() {
    let gate_calls = Arc::new(AtomicU32::new(0));
    let fix_calls = Arc::new(AtomicU32::new(0));
    let runner = runner_with(vec![
        (
            "flaky_check",
            Arc::new(CountingHandler {
                calls: Arc::clone(&gate_calls),
                fail_first: 1,
            }) as Arc<dyn StageHandler>,
        ),
        (
            "fixer",
            Arc::new(CountingHandler {
                calls: Arc::clone(&fix_calls),
                fail_first: 0,
            }) as Arc<dyn StageHandler>,
        ),
    ]);

    // The failing check still routes to exit; the unsatisfied goal gate must
    // hijack the cursor at the terminal and send it to the retry target.
    let graph = parse_pipeline(
        r#"
        digraph G {
            start [shape=Mdiamond]
            check [type="flaky_check", goal_gate=true, retry_target="fix"]
            fix [type="fixer"]
            exit [shape=Msquare]
            start -> check -> exit
            check -> fix [condition="context.manual_reroute=yes"]
            fix -> check
        }
        "#,
    )
    .expect("graph should parse");

    let result = runner
        .run(&graph, RunOptions::default())
        .await
        .expect("run should succeed");

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(fix_calls.load(Ordering::SeqCst), 1);
    assert_eq!(gate_calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        result.completed_nodes,
        vec!["start", "check", "fix", "check", "exit"]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn dead_end_on_success_ends_run_with_last_outcome() {
    let graph = parse_pipeline(
        r#"
        digraph G {
            start [shape=Mdiamond]
            stub
            exit [shape=Msquare]
            start -> stub
            start -> exit [weight=-1]
        }
        "#,
    )
    .expect("graph should parse");

    let result = PipelineRunner::simulating()
        .run(&graph, RunOptions::default())
        .await
        .expect("run should complete");

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.completed_nodes, vec!["start", "stub"]);
}

#[tokio::test(flavor = "current_thread")]
async fn fail_with_no_fail_edge_terminates_the_run() {
    let runner = runner_with(vec![("always_fail", always_fail())]);
    let graph = parse_pipeline(
        r#"
        digraph G {
            start [shape=Mdiamond]
            broken [type="always_fail"]
            next
            exit [shape=Msquare]
            start -> broken
            broken -> next [condition="outcome=success"]
            next -> exit
        }
        "#,
    )
    .expect("graph should parse");

    let result = runner
        .run(&graph, RunOptions::default())
        .await
        .expect("run should complete");

    assert_eq!(result.status, RunStatus::Fail);
    assert!(
        result
            .failure_reason
            .expect("failure reason expected")
            .contains("no outgoing fail edge")
    );
}

#[tokio::test(flavor = "current_thread")]
async fn checkpoint_reflects_every_completed_stage() {
    let temp = TempDir::new().expect("temp dir should be created");
    let graph = parse_pipeline(
        r#"
        digraph G {
            start [shape=Mdiamond]
            a
            b
            exit [shape=Msquare]
            start -> a -> b -> exit
        }
        "#,
    )
    .expect("graph should parse");

    let bus = EventBus::new();
    let logs_root = temp.path().to_path_buf();
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    let checkpoint_dir = logs_root.clone();
    bus.subscribe(Arc::new(move |event: &RunEvent| {
        if let RunEventKind::CheckpointSaved { node_id, .. } = &event.kind {
            let checkpoint = Checkpoint::load(&checkpoint_path(&checkpoint_dir))
                .expect("checkpoint should load mid-run");
            assert_eq!(&checkpoint.current_node, node_id);
            assert_eq!(checkpoint.completed_nodes.last(), Some(node_id));
            sink.lock().expect("mutex should lock").push(node_id.clone());
        }
    }));

    PipelineRunner::simulating()
        .run(
            &graph,
            RunOptions {
                logs_root: Some(logs_root),
                events: bus,
                ..RunOptions::default()
            },
        )
        .await
        .expect("run should succeed");

    assert_eq!(
        observed.lock().expect("mutex should lock").clone(),
        vec!["start", "a", "b", "exit"]
    );
}
