use crate::ContextMap;
use crate::EngineError;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    PartialSuccess,
    Retry,
    Fail,
    Skipped,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Retry => "retry",
            Self::Fail => "fail",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Result<Self, EngineError> {
        match value.trim() {
            "success" => Ok(Self::Success),
            "partial_success" => Ok(Self::PartialSuccess),
            "retry" => Ok(Self::Retry),
            "fail" => Ok(Self::Fail),
            "skipped" => Ok(Self::Skipped),
            other => Err(EngineError::Runtime(format!(
                "unknown stage status '{other}'"
            ))),
        }
    }

    pub fn is_success_like(self) -> bool {
        matches!(self, Self::Success | Self::PartialSuccess)
    }

    /// Ranking used by the fan-in handler: lower is better.
    pub fn rank(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::PartialSuccess => 1,
            Self::Retry => 2,
            Self::Fail => 3,
            Self::Skipped => 4,
        }
    }
}

/// Result of one handler invocation.
///
/// Handlers may also write to the live context while running, but
/// `context_updates` is the authoritative record that lands in checkpoints
/// and `status.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub status: StageStatus,
    pub failure_reason: Option<String>,
    pub preferred_label: Option<String>,
    pub suggested_next_ids: Vec<String>,
    pub context_updates: ContextMap,
    pub notes: Option<String>,
}

impl StageOutcome {
    pub fn with_status(status: StageStatus) -> Self {
        Self {
            status,
            failure_reason: None,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            context_updates: ContextMap::new(),
            notes: None,
        }
    }

    pub fn success() -> Self {
        Self::with_status(StageStatus::Success)
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        let mut outcome = Self::with_status(StageStatus::Retry);
        outcome.failure_reason = Some(reason.into());
        outcome
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        let mut outcome = Self::with_status(StageStatus::Fail);
        outcome.failure_reason = Some(reason.into());
        outcome
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        let mut outcome = Self::with_status(StageStatus::Skipped);
        outcome.failure_reason = Some(reason.into());
        outcome
    }

    pub fn note(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn update(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context_updates.insert(key.into(), value);
        self
    }

    pub fn suggest(mut self, node_id: impl Into<String>) -> Self {
        self.suggested_next_ids.push(node_id.into());
        self
    }
}
