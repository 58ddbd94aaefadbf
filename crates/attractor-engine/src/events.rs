use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One entry in a run's ordered event stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub seq: u64,
    pub timestamp: String,
    pub run_id: String,
    #[serde(flatten)]
    pub kind: RunEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEventKind {
    PipelineStarted {
        graph_id: String,
    },
    PipelineCompleted {
        status: String,
        duration_ms: u64,
    },
    PipelineFailed {
        reason: String,
        duration_ms: u64,
    },
    StageStarted {
        node_id: String,
        attempt: u32,
    },
    StageCompleted {
        node_id: String,
        attempt: u32,
        status: String,
        duration_ms: u64,
    },
    StageRetrying {
        node_id: String,
        attempt: u32,
        next_attempt: u32,
        delay_ms: u64,
    },
    StageFailed {
        node_id: String,
        attempt: u32,
        reason: String,
    },
    CheckpointSaved {
        node_id: String,
        completed_count: usize,
    },
    CheckpointResumed {
        node_id: String,
    },
    LoopRestarted {
        target_node: String,
        cleared_nodes: Vec<String>,
    },
    InterviewStarted {
        node_id: String,
    },
}

impl RunEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PipelineStarted { .. } => "pipeline_started",
            Self::PipelineCompleted { .. } => "pipeline_completed",
            Self::PipelineFailed { .. } => "pipeline_failed",
            Self::StageStarted { .. } => "stage_started",
            Self::StageCompleted { .. } => "stage_completed",
            Self::StageRetrying { .. } => "stage_retrying",
            Self::StageFailed { .. } => "stage_failed",
            Self::CheckpointSaved { .. } => "checkpoint_saved",
            Self::CheckpointResumed { .. } => "checkpoint_resumed",
            Self::LoopRestarted { .. } => "loop_restarted",
            Self::InterviewStarted { .. } => "interview_started",
        }
    }
}

pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &RunEvent);
}

impl<F> EventSubscriber for F
where
    F: Fn(&RunEvent) + Send + Sync,
{
    fn on_event(&self, event: &RunEvent) {
        self(event);
    }
}

pub type SharedEventSubscriber = Arc<dyn EventSubscriber>;
pub type EventSender = mpsc::UnboundedSender<RunEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<RunEvent>;

/// Ordered fan-out of run events. Emission is synchronous from the caller's
/// perspective; subscribers must not block. Channel subscribers buffer into
/// an unbounded mpsc for consumers that stream (CLI printer, SSE).
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<EventBusState>>,
}

#[derive(Default)]
struct EventBusState {
    subscribers: Vec<SharedEventSubscriber>,
    senders: Vec<EventSender>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: SharedEventSubscriber) {
        self.inner
            .lock()
            .expect("event bus mutex should lock")
            .subscribers
            .push(subscriber);
    }

    pub fn subscribe_channel(&self) -> EventReceiver {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .expect("event bus mutex should lock")
            .senders
            .push(sender);
        receiver
    }

    pub fn emit(&self, event: RunEvent) {
        let mut state = self.inner.lock().expect("event bus mutex should lock");
        for subscriber in &state.subscribers {
            subscriber.on_event(&event);
        }
        state
            .senders
            .retain(|sender| sender.send(event.clone()).is_ok());
    }
}
