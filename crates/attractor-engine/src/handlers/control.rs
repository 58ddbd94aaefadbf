use crate::EngineError;
use crate::context::Context;
use crate::graph::{Graph, Node};
use crate::handlers::StageHandler;
use crate::outcome::StageOutcome;
use async_trait::async_trait;
use std::path::Path;

/// `start`, `exit`, and `conditional` nodes do no work of their own:
/// start/exit mark the walk's ends and conditional nodes route purely
/// through their outgoing edge conditions.
pub struct PassThroughHandler {
    role: &'static str,
}

impl PassThroughHandler {
    pub fn start() -> Self {
        Self { role: "start" }
    }

    pub fn exit() -> Self {
        Self { role: "exit" }
    }

    pub fn conditional() -> Self {
        Self { role: "conditional" }
    }
}

#[async_trait]
impl StageHandler for PassThroughHandler {
    async fn execute(
        &self,
        node: &Node,
        _context: &Context,
        _graph: &Graph,
        _logs_root: Option<&Path>,
    ) -> Result<StageOutcome, EngineError> {
        Ok(StageOutcome::success().note(format!("{} {}", self.role, node.id)))
    }
}

/// Fan-out nodes are scheduled by the runner, which intercepts them before
/// dispatch; reaching this handler means a host resolved one by hand.
pub struct ParallelPlaceholder;

#[async_trait]
impl StageHandler for ParallelPlaceholder {
    async fn execute(
        &self,
        node: &Node,
        _context: &Context,
        _graph: &Graph,
        _logs_root: Option<&Path>,
    ) -> Result<StageOutcome, EngineError> {
        Err(EngineError::Runtime(format!(
            "parallel node '{}' must be executed by the pipeline runner",
            node.id
        )))
    }
}
