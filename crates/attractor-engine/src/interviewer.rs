use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// One selectable route out of a human gate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GateChoice {
    pub key: String,
    pub label: String,
    pub target_node: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GateQuestion {
    pub node_id: String,
    pub text: String,
    pub choices: Vec<GateChoice>,
    pub default_choice: Option<String>,
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateAnswer {
    Selected(String),
    Timeout,
    Skipped,
}

/// Answers human gates. Implementations range from console prompts to an
/// HTTP endpoint resolving a pending question; the runner calls `ask` at
/// most once per gate visit.
#[async_trait]
pub trait Interviewer: Send + Sync {
    async fn ask(&self, question: GateQuestion) -> GateAnswer;
}

/// Picks the first choice, unconditionally. The `--auto-approve` CLI path
/// and most tests use this.
#[derive(Debug, Default)]
pub struct AutoApproveInterviewer;

#[async_trait]
impl Interviewer for AutoApproveInterviewer {
    async fn ask(&self, question: GateQuestion) -> GateAnswer {
        question
            .choices
            .first()
            .map(|choice| GateAnswer::Selected(choice.key.clone()))
            .unwrap_or(GateAnswer::Skipped)
    }
}

/// Reads the answer from stdin on a blocking task.
#[derive(Debug, Default)]
pub struct ConsoleInterviewer;

#[async_trait]
impl Interviewer for ConsoleInterviewer {
    async fn ask(&self, question: GateQuestion) -> GateAnswer {
        match tokio::task::spawn_blocking(move || ask_console(question)).await {
            Ok(answer) => answer,
            Err(_) => GateAnswer::Skipped,
        }
    }
}

/// FIFO of scripted answers; empty queue answers Skipped.
#[derive(Default)]
pub struct QueueInterviewer {
    answers: Mutex<VecDeque<GateAnswer>>,
}

impl QueueInterviewer {
    pub fn with_answers<I>(answers: I) -> Self
    where
        I: IntoIterator<Item = GateAnswer>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
        }
    }

    pub fn push(&self, answer: GateAnswer) {
        self.answers
            .lock()
            .expect("queue interviewer mutex should lock")
            .push_back(answer);
    }
}

#[async_trait]
impl Interviewer for QueueInterviewer {
    async fn ask(&self, _question: GateQuestion) -> GateAnswer {
        self.answers
            .lock()
            .expect("queue interviewer mutex should lock")
            .pop_front()
            .unwrap_or(GateAnswer::Skipped)
    }
}

/// Forwards each question over a channel together with a one-shot reply
/// slot. The HTTP control plane holds the receiving end, parks the question,
/// and resolves the slot exactly once when an answer (or a cancellation)
/// arrives. A dropped reply slot reads as Skipped.
pub struct ChannelInterviewer {
    outbox: mpsc::UnboundedSender<PendingQuestion>,
}

pub struct PendingQuestion {
    pub question: GateQuestion,
    pub reply: oneshot::Sender<GateAnswer>,
}

impl ChannelInterviewer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PendingQuestion>) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        (Self { outbox }, inbox)
    }
}

#[async_trait]
impl Interviewer for ChannelInterviewer {
    async fn ask(&self, question: GateQuestion) -> GateAnswer {
        let (reply, response) = oneshot::channel();
        if self
            .outbox
            .send(PendingQuestion { question, reply })
            .is_err()
        {
            return GateAnswer::Skipped;
        }
        response.await.unwrap_or(GateAnswer::Skipped)
    }
}

fn ask_console(question: GateQuestion) -> GateAnswer {
    eprintln!("[?] {}", question.text);
    for choice in &question.choices {
        eprintln!("  [{}] {}", choice.key, choice.label);
    }
    let Some(raw) = read_line("Select: ") else {
        return GateAnswer::Skipped;
    };
    if raw.is_empty() {
        return match question.default_choice {
            Some(default_choice) => GateAnswer::Selected(default_choice),
            None => GateAnswer::Skipped,
        };
    }
    GateAnswer::Selected(raw)
}

fn read_line(prompt: &str) -> Option<String> {
    let mut stdout = io::stdout();
    write!(stdout, "{prompt}").ok()?;
    stdout.flush().ok()?;

    let mut raw = String::new();
    io::stdin().read_line(&mut raw).ok()?;
    Some(raw.trim().to_string())
}
