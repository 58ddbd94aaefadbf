use crate::graph::{Graph, Node};
use crate::outcome::{StageOutcome, StageStatus};
use rand::Rng;

#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the computed delay added as jitter, at most.
    pub jitter_ratio: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 200,
            max_delay_ms: 60_000,
            jitter_ratio: 0.2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

/// Node `max_retries` is the attempt budget itself, floored at one, falling
/// back to the graph's `default_max_retry`.
pub fn retry_policy_for(node: &Node, graph: &Graph, backoff: BackoffConfig) -> RetryPolicy {
    let configured = node
        .attrs
        .get_i64("max_retries")
        .or_else(|| graph.attrs.get_i64("default_max_retry"))
        .unwrap_or(1);
    RetryPolicy {
        max_attempts: configured.max(1) as u32,
        backoff,
    }
}

/// Retry and Fail outcomes both consume attempts and re-run while the budget
/// lasts; only a final-attempt result is accepted.
pub fn outcome_wants_retry(outcome: &StageOutcome) -> bool {
    matches!(outcome.status, StageStatus::Retry | StageStatus::Fail)
}

/// Result synthesized when a Retry outcome exhausts its attempts.
pub fn promote_exhausted_retry(node: &Node) -> StageOutcome {
    if node.allow_partial() {
        StageOutcome::with_status(StageStatus::PartialSuccess)
            .note("retry attempts exhausted, partial result accepted")
    } else {
        StageOutcome::failure("retry attempts exhausted")
    }
}

/// Exponential backoff with bounded jitter; `attempt` is the attempt that
/// just failed (1-based), the delay precedes the next one.
pub fn backoff_delay_ms(attempt: u32, config: &BackoffConfig) -> u64 {
    let exponent = attempt.saturating_sub(1).min(32);
    let base = (config.base_delay_ms as f64) * 2f64.powi(exponent as i32);
    let clamped = base.min(config.max_delay_ms as f64);
    let jitter = if config.jitter_ratio > 0.0 {
        clamped * config.jitter_ratio * rand::thread_rng().gen_range(0.0..1.0)
    } else {
        0.0
    };
    (clamped + jitter).round().min(config.max_delay_ms as f64) as u64
}
