use crate::validate::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("DOT parse error: {0}")]
    Parse(String),
    #[error("invalid graph: {0}")]
    Graph(String),
    #[error("stylesheet error: {0}")]
    Stylesheet(String),
    #[error(transparent)]
    Validation(#[from] ValidationFailure),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("transient error: {0}")]
    Transient(String),
    #[error("stage '{node_id}' timed out after {millis}ms")]
    StageTimeout { node_id: String, millis: u64 },
    #[error("run cancelled")]
    Cancelled,
}

impl EngineError {
    /// Whether the retry policy may consume an attempt on this error.
    /// Validation and graph-shape problems are permanent; so is cancellation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::StageTimeout { .. })
    }
}

#[derive(Debug, Error, Clone)]
#[error("validation failed with {error_count} error(s)")]
pub struct ValidationFailure {
    pub diagnostics: Vec<Diagnostic>,
    pub error_count: usize,
}

impl ValidationFailure {
    pub fn new(diagnostics: Vec<Diagnostic>) -> Self {
        let error_count = diagnostics.iter().filter(|d| d.is_error()).count();
        Self {
            diagnostics,
            error_count,
        }
    }
}
