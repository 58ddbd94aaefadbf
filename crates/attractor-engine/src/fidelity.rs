use crate::context::{ContextMap, INTERNAL_PREFIX};
use crate::graph::{Edge, Graph};
use serde_json::Value;

pub const DEFAULT_FIDELITY: &str = "compact";
pub const RESUME_DEGRADED_FIDELITY: &str = "summary:high";
pub const DEFAULT_THREAD_KEY: &str = "default";

pub fn is_valid_fidelity(tag: &str) -> bool {
    matches!(
        tag,
        "full" | "truncate" | "compact" | "summary:low" | "summary:medium" | "summary:high"
    )
}

/// Projects a context snapshot through a fidelity tag. Unrecognized tags
/// (including the empty string) behave as `full`. Idempotent: the truncation
/// thresholds equal the kept prefix lengths, so a second pass reproduces the
/// first.
pub fn apply_fidelity(snapshot: &ContextMap, tag: &str) -> ContextMap {
    match tag {
        "truncate" => truncate_values(snapshot, 1000, true),
        "compact" => truncate_values(snapshot, 1000, false),
        "summary:low" => snapshot
            .iter()
            .map(|(key, _)| (key.clone(), Value::String(String::new())))
            .collect(),
        "summary:medium" => truncate_values(snapshot, 100, true),
        "summary:high" => truncate_values(snapshot, 500, true),
        _ => snapshot.clone(),
    }
}

fn truncate_values(snapshot: &ContextMap, max_chars: usize, keep_internal: bool) -> ContextMap {
    snapshot
        .iter()
        .filter(|(key, _)| keep_internal || !key.starts_with(INTERNAL_PREFIX))
        .map(|(key, value)| (key.clone(), truncate_value(value, max_chars)))
        .collect()
}

fn truncate_value(value: &Value, max_chars: usize) -> Value {
    match value {
        Value::String(text) if text.chars().count() > max_chars => {
            let mut clipped: String = text.chars().take(max_chars).collect();
            clipped.push_str("...");
            Value::String(clipped)
        }
        other => other.clone(),
    }
}

pub fn find_incoming_edge<'a>(
    graph: &'a Graph,
    target: &str,
    previous: Option<&'a str>,
) -> Option<&'a Edge> {
    let from = previous?;
    graph.outgoing(from).find(|edge| edge.to == target)
}

/// First *valid* tag of (incoming edge, node, graph default); `compact`
/// otherwise. Invalid spellings fall through rather than winning the slot.
pub fn resolve_fidelity(graph: &Graph, target: &str, incoming: Option<&Edge>) -> String {
    let candidates = [
        incoming.and_then(|edge| edge.attrs.get_trimmed("fidelity")),
        graph
            .nodes
            .get(target)
            .and_then(|node| node.attrs.get_trimmed("fidelity")),
        graph.attrs.get_trimmed("default_fidelity"),
    ];
    for candidate in candidates.into_iter().flatten() {
        if is_valid_fidelity(candidate) {
            return candidate.to_string();
        }
    }
    DEFAULT_FIDELITY.to_string()
}

/// Session-coalescing key, resolved only when the effective fidelity is
/// `full`: node thread id, incoming-edge thread id, graph default thread,
/// first node class, previous node id, then the literal `"default"`.
pub fn resolve_thread_key(
    graph: &Graph,
    target: &str,
    incoming: Option<&Edge>,
    previous: Option<&str>,
) -> String {
    let node = graph.nodes.get(target);

    if let Some(thread_id) = node.and_then(|node| node.attrs.get_trimmed("thread_id")) {
        return thread_id.to_string();
    }
    if let Some(thread_id) = incoming.and_then(|edge| edge.attrs.get_trimmed("thread_id")) {
        return thread_id.to_string();
    }
    if let Some(thread_id) = graph.attrs.get_trimmed("default_thread") {
        return thread_id.to_string();
    }
    if let Some(class) = node.and_then(|node| node.classes().into_iter().next()) {
        return class;
    }
    previous
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| DEFAULT_THREAD_KEY.to_string())
}
