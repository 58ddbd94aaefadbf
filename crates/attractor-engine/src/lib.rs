//! Execution engine for annotated agentic pipeline graphs.
//!
//! A pipeline is a DOT digraph whose nodes are units of work (LLM stages,
//! human gates, shell tools, fan-outs, supervisors) and whose edges carry
//! routing conditions, weights, fidelity directives, and loop-restart
//! flags. This crate parses, validates, and runs such graphs: front end in
//! [`parse`] / [`stylesheet`] / [`prompt`] / [`validate`], execution in
//! [`runner`] with the supporting [`context`], [`fidelity`], [`condition`],
//! [`routing`], [`retry`], [`checkpoint`], and [`events`] modules.

pub mod artifacts;
pub mod backend;
pub mod cancel;
pub mod checkpoint;
pub mod condition;
pub mod context;
pub mod error;
pub mod events;
pub mod fidelity;
pub mod graph;
pub mod handlers;
pub mod interviewer;
pub mod outcome;
pub mod parse;
pub mod prompt;
pub mod retry;
pub mod routing;
pub mod runner;
pub mod stylesheet;
pub mod validate;

pub use backend::{BackendReply, BackendRequest, CodergenBackend};
pub use cancel::CancelToken;
pub use checkpoint::{Checkpoint, checkpoint_path};
pub use condition::{evaluate_condition, validate_condition};
pub use context::{Context, ContextMap, ContextSnapshot};
pub use error::{EngineError, ValidationFailure};
pub use events::{EventBus, RunEvent, RunEventKind};
pub use fidelity::{apply_fidelity, resolve_fidelity, resolve_thread_key};
pub use graph::{AttrValue, Attrs, Edge, Graph, Node};
pub use handlers::{HandlerRegistry, StageHandler, builtin_registry};
pub use interviewer::{
    AutoApproveInterviewer, ChannelInterviewer, ConsoleInterviewer, GateAnswer, GateChoice,
    GateQuestion, Interviewer, PendingQuestion, QueueInterviewer,
};
pub use outcome::{StageOutcome, StageStatus};
pub use parse::parse_pipeline;
pub use prompt::{PromptOptions, resolve_prompts};
pub use retry::BackoffConfig;
pub use routing::choose_edge;
pub use runner::{PipelineRunner, RunOptions, RunResult, RunStatus};
pub use stylesheet::apply_model_stylesheet;
pub use validate::{Diagnostic, Severity, validate, validate_or_raise};

use std::path::Path;

/// Front-end convenience: parse a DOT source, apply the model stylesheet,
/// resolve prompts, and validate, collecting every diagnostic. `source_path`
/// anchors `@file` and `/command` prompt references.
pub fn load_pipeline(
    source: &str,
    source_path: Option<&Path>,
    overrides: std::collections::BTreeMap<String, String>,
) -> Result<(Graph, Vec<Diagnostic>), EngineError> {
    let mut graph = parse_pipeline(source)?;
    graph.source_path = source_path.map(Path::to_path_buf);
    // A malformed stylesheet surfaces through the validation rule below
    // alongside any other diagnostics, not as a lone hard error here.
    let _ = apply_model_stylesheet(&mut graph);

    let mut options = match source_path {
        Some(path) => PromptOptions::for_source(path),
        None => PromptOptions::default(),
    };
    options.overrides = overrides;
    let mut diagnostics = resolve_prompts(&mut graph, &options);

    diagnostics.extend(validate(&graph, &[]));
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(ValidationFailure::new(diagnostics).into());
    }
    Ok((graph, diagnostics))
}
