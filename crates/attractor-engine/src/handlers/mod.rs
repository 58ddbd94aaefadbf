use crate::EngineError;
use crate::backend::CodergenBackend;
use crate::context::Context;
use crate::graph::{Graph, Node};
use crate::interviewer::Interviewer;
use crate::outcome::StageOutcome;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub mod codergen;
pub mod control;
pub mod fan_in;
pub mod manager;
pub mod tool;
pub mod wait_human;

pub const DEFAULT_HANDLER_TYPE: &str = "codergen";
pub const PARALLEL_TYPE: &str = "parallel";
pub const FAN_IN_TYPE: &str = "parallel.fan_in";

pub const KNOWN_HANDLER_TYPES: [&str; 9] = [
    "start",
    "exit",
    "conditional",
    "codergen",
    "wait.human",
    "parallel",
    "parallel.fan_in",
    "tool",
    "stack.manager_loop",
];

/// Produces the outcome for one node visit. Handlers may block on I/O and
/// may write to the live context, but the returned outcome's
/// `context_updates` is the authoritative record; the graph is never
/// mutated.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn execute(
        &self,
        node: &Node,
        context: &Context,
        graph: &Graph,
        logs_root: Option<&Path>,
    ) -> Result<StageOutcome, EngineError>;
}

pub type SharedStageHandler = Arc<dyn StageHandler>;

/// Maps nodes to handlers: an explicit `type` attribute wins, then the
/// shape table, then the default type. Hosts register custom types over the
/// built-ins.
pub struct HandlerRegistry {
    handlers: BTreeMap<String, SharedStageHandler>,
    shape_types: BTreeMap<String, String>,
    default_type: String,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
            shape_types: shape_type_table(),
            default_type: DEFAULT_HANDLER_TYPE.to_string(),
        }
    }

    pub fn register(
        &mut self,
        handler_type: impl Into<String>,
        handler: SharedStageHandler,
    ) -> Option<SharedStageHandler> {
        self.handlers.insert(handler_type.into(), handler)
    }

    pub fn map_shape(&mut self, shape: impl Into<String>, handler_type: impl Into<String>) {
        self.shape_types.insert(shape.into(), handler_type.into());
    }

    pub fn resolve_type(&self, node: &Node) -> String {
        if let Some(explicit) = node.handler_type() {
            return explicit.to_string();
        }
        self.shape_types
            .get(node.shape())
            .cloned()
            .unwrap_or_else(|| self.default_type.clone())
    }

    pub fn resolve(&self, node: &Node) -> Result<SharedStageHandler, EngineError> {
        let handler_type = self.resolve_type(node);
        self.handlers
            .get(&handler_type)
            .or_else(|| self.handlers.get(&self.default_type))
            .cloned()
            .ok_or_else(|| {
                EngineError::Runtime(format!("no handler registered for type '{handler_type}'"))
            })
    }
}

fn shape_type_table() -> BTreeMap<String, String> {
    [
        ("Mdiamond", "start"),
        ("Msquare", "exit"),
        ("diamond", "conditional"),
        ("box", "codergen"),
        ("hexagon", "wait.human"),
        ("component", PARALLEL_TYPE),
        ("tripleoctagon", FAN_IN_TYPE),
        ("parallelogram", "tool"),
        ("house", "stack.manager_loop"),
    ]
    .into_iter()
    .map(|(shape, handler_type)| (shape.to_string(), handler_type.to_string()))
    .collect()
}

/// Registry with every built-in wired. Fan-out (`parallel`) nodes are
/// driven by the runner itself; the entry here only reports misuse.
pub fn builtin_registry(
    backend: Option<Arc<dyn CodergenBackend>>,
    interviewer: Arc<dyn Interviewer>,
) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("start", Arc::new(control::PassThroughHandler::start()));
    registry.register("exit", Arc::new(control::PassThroughHandler::exit()));
    registry.register(
        "conditional",
        Arc::new(control::PassThroughHandler::conditional()),
    );
    registry.register(
        "codergen",
        Arc::new(codergen::CodergenHandler::new(backend.clone())),
    );
    registry.register(
        "wait.human",
        Arc::new(wait_human::WaitHumanHandler::new(interviewer)),
    );
    registry.register(PARALLEL_TYPE, Arc::new(control::ParallelPlaceholder));
    registry.register(FAN_IN_TYPE, Arc::new(fan_in::FanInHandler::new(backend)));
    registry.register("tool", Arc::new(tool::ToolHandler));
    registry.register(
        "stack.manager_loop",
        Arc::new(manager::ManagerLoopHandler::new(None)),
    );
    registry
}
