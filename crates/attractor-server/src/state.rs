use attractor_engine::{
    CancelToken, ChannelInterviewer, Context, EventBus, GateAnswer, GateQuestion, Graph,
    PendingQuestion, PipelineRunner, RunEvent, RunEventKind, RunOptions, RunStatus,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;

/// Registry of runs owned by this control plane instance.
#[derive(Clone, Default)]
pub struct AppState {
    runs: Arc<RwLock<HashMap<String, Arc<RunHandle>>>>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<RunHandle>> {
        self.runs
            .read()
            .expect("run registry lock poisoned")
            .get(run_id)
            .cloned()
    }

    pub fn insert(&self, handle: Arc<RunHandle>) {
        self.runs
            .write()
            .expect("run registry lock poisoned")
            .insert(handle.run_id.clone(), handle);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunPhase {
    Running,
    Finished(RunStatus),
    Cancelled,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished(RunStatus::Success) => "success",
            Self::Finished(RunStatus::PartialSuccess) => "partial_success",
            Self::Finished(RunStatus::Fail) => "fail",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

pub struct ParkedQuestion {
    pub question_id: String,
    pub question: GateQuestion,
    reply: tokio::sync::oneshot::Sender<GateAnswer>,
}

/// Everything the control plane tracks about one run: the runner task's
/// side channels (events, context, cancellation), the buffered event log
/// for SSE replay, and the at-most-one pending human question.
pub struct RunHandle {
    pub run_id: String,
    pub dot_source: String,
    pub logs_root: PathBuf,
    pub context: Context,
    pub cancel: CancelToken,
    phase: RwLock<RunPhase>,
    failure_reason: RwLock<Option<String>>,
    current_node: RwLock<Option<String>>,
    completed: RwLock<Vec<String>>,
    event_log: Mutex<Vec<RunEvent>>,
    live_events: broadcast::Sender<RunEvent>,
    pending: Mutex<Option<ParkedQuestion>>,
}

impl RunHandle {
    pub fn phase(&self) -> RunPhase {
        *self.phase.read().expect("phase lock poisoned")
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.failure_reason
            .read()
            .expect("failure lock poisoned")
            .clone()
    }

    pub fn current_node(&self) -> Option<String> {
        self.current_node
            .read()
            .expect("current node lock poisoned")
            .clone()
    }

    pub fn completed_nodes(&self) -> Vec<String> {
        self.completed.read().expect("completed lock poisoned").clone()
    }

    pub fn buffered_events(&self) -> Vec<RunEvent> {
        self.event_log.lock().expect("event log lock poisoned").clone()
    }

    pub fn subscribe_live(&self) -> broadcast::Receiver<RunEvent> {
        self.live_events.subscribe()
    }

    pub fn pending_question(&self) -> Option<(String, GateQuestion)> {
        self.pending
            .lock()
            .expect("pending question lock poisoned")
            .as_ref()
            .map(|parked| (parked.question_id.clone(), parked.question.clone()))
    }

    pub fn park_question(&self, parked: ParkedQuestion) {
        *self.pending.lock().expect("pending question lock poisoned") = Some(parked);
    }

    /// Resolves the pending question if (and only if) it matches
    /// `question_id`. The reply slot fires at most once per question.
    pub fn answer_question(
        &self,
        question_id: &str,
        answer: GateAnswer,
    ) -> Result<(), AnswerRejection> {
        let mut pending = self.pending.lock().expect("pending question lock poisoned");
        match pending.as_ref() {
            None => Err(AnswerRejection::NonePending),
            Some(parked) if parked.question_id != question_id => Err(AnswerRejection::WrongId),
            Some(_) => {
                let parked = pending.take().expect("pending question just observed");
                let _ = parked.reply.send(answer);
                Ok(())
            }
        }
    }

    /// Flips the run to cancelled: signals the token and resolves any
    /// parked question as Skipped so the runner unblocks.
    pub fn cancel(&self) -> Result<(), ()> {
        if self.phase().is_terminal() {
            return Err(());
        }
        *self.phase.write().expect("phase lock poisoned") = RunPhase::Cancelled;
        self.cancel.cancel();
        if let Some(parked) = self
            .pending
            .lock()
            .expect("pending question lock poisoned")
            .take()
        {
            let _ = parked.reply.send(GateAnswer::Skipped);
        }
        Ok(())
    }

    fn observe_event(&self, event: &RunEvent) {
        match &event.kind {
            RunEventKind::StageStarted { node_id, .. } => {
                *self.current_node.write().expect("current node lock poisoned") =
                    Some(node_id.clone());
            }
            RunEventKind::StageCompleted { node_id, .. }
            | RunEventKind::StageFailed { node_id, .. } => {
                self.completed
                    .write()
                    .expect("completed lock poisoned")
                    .push(node_id.clone());
            }
            RunEventKind::PipelineCompleted { status, .. } => {
                let status = match status.as_str() {
                    "partial_success" => RunStatus::PartialSuccess,
                    _ => RunStatus::Success,
                };
                let mut phase = self.phase.write().expect("phase lock poisoned");
                if !phase.is_terminal() {
                    *phase = RunPhase::Finished(status);
                }
            }
            RunEventKind::PipelineFailed { reason, .. } => {
                *self.failure_reason.write().expect("failure lock poisoned") =
                    Some(reason.clone());
                let mut phase = self.phase.write().expect("phase lock poisoned");
                if !phase.is_terminal() {
                    *phase = RunPhase::Finished(RunStatus::Fail);
                }
            }
            _ => {}
        }

        self.event_log
            .lock()
            .expect("event log lock poisoned")
            .push(event.clone());
        let _ = self.live_events.send(event.clone());
    }
}

pub enum AnswerRejection {
    NonePending,
    WrongId,
}

/// Validates nothing (the caller already did), wires the event plumbing and
/// the channel interviewer, spawns the runner task, and registers the
/// handle.
pub fn launch_run(state: &AppState, run_id: String, dot_source: String, graph: Graph) -> Arc<RunHandle> {
    let logs_root = std::env::temp_dir().join("attractor-runs").join(&run_id);
    let context = Context::new();
    let cancel = CancelToken::new();
    let (live_events, _) = broadcast::channel(1024);

    let handle = Arc::new(RunHandle {
        run_id: run_id.clone(),
        dot_source,
        logs_root: logs_root.clone(),
        context: context.clone(),
        cancel: cancel.clone(),
        phase: RwLock::new(RunPhase::Running),
        failure_reason: RwLock::new(None),
        current_node: RwLock::new(None),
        completed: RwLock::new(Vec::new()),
        event_log: Mutex::new(Vec::new()),
        live_events,
        pending: Mutex::new(None),
    });
    state.insert(Arc::clone(&handle));

    let events = EventBus::new();
    let observer = Arc::clone(&handle);
    events.subscribe(Arc::new(move |event: &RunEvent| {
        observer.observe_event(event);
    }));

    let (interviewer, mut question_inbox) = ChannelInterviewer::new();
    let question_sink = Arc::clone(&handle);
    tokio::spawn(async move {
        while let Some(PendingQuestion { question, reply }) = question_inbox.recv().await {
            question_sink.park_question(ParkedQuestion {
                question_id: uuid::Uuid::new_v4().to_string(),
                question,
                reply,
            });
        }
    });

    let runner = PipelineRunner::new(attractor_engine::builtin_registry(
        None,
        Arc::new(interviewer),
    ));
    let run_handle = Arc::clone(&handle);
    tokio::spawn(async move {
        let options = RunOptions {
            run_id: Some(run_id.clone()),
            logs_root: Some(logs_root),
            events,
            cancel,
            context: Some(context),
            ..RunOptions::default()
        };
        match runner.run(&graph, options).await {
            Ok(result) => {
                tracing::info!(run_id = %run_id, status = result.status.as_str(), "run finished");
            }
            Err(error) => {
                tracing::error!(run_id = %run_id, error = %error, "run aborted");
                *run_handle.failure_reason.write().expect("failure lock poisoned") =
                    Some(error.to_string());
                let mut phase = run_handle.phase.write().expect("phase lock poisoned");
                if !phase.is_terminal() {
                    *phase = RunPhase::Finished(RunStatus::Fail);
                }
            }
        }
    });

    handle
}
