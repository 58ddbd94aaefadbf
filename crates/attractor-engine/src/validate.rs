use crate::condition::validate_condition;
use crate::error::ValidationFailure;
use crate::fidelity::is_valid_fidelity;
use crate::graph::Graph;
use crate::handlers::KNOWN_HANDLER_TYPES;
use crate::stylesheet::parse_stylesheet;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge: Option<(String, String)>,
}

impl Diagnostic {
    pub fn error(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Error,
            message: message.into(),
            node_id: None,
            edge: None,
        }
    }

    pub fn warning(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Warning,
            message: message.into(),
            node_id: None,
            edge: None,
        }
    }

    pub fn at_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn at_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edge = Some((from.into(), to.into()));
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Pluggable extra rule, for hosts that want project-specific checks.
pub trait GraphRule {
    fn name(&self) -> &str;
    fn check(&self, graph: &Graph) -> Vec<Diagnostic>;
}

pub fn validate(graph: &Graph, extra_rules: &[&dyn GraphRule]) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    diagnostics.extend(rule_single_start(graph));
    diagnostics.extend(rule_has_terminal(graph));
    diagnostics.extend(rule_edge_targets_exist(graph));
    diagnostics.extend(rule_start_has_no_incoming(graph));
    diagnostics.extend(rule_terminal_has_no_outgoing(graph));
    diagnostics.extend(rule_all_reachable(graph));
    diagnostics.extend(rule_conditions_parse(graph));
    diagnostics.extend(rule_stylesheet_parses(graph));
    diagnostics.extend(rule_fidelity_tags_valid(graph));
    diagnostics.extend(rule_retry_targets_exist(graph));
    diagnostics.extend(rule_goal_gates_have_retry_target(graph));
    diagnostics.extend(rule_handler_types_known(graph));
    for rule in extra_rules {
        diagnostics.extend(rule.check(graph));
    }
    diagnostics
}

pub fn validate_or_raise(
    graph: &Graph,
    extra_rules: &[&dyn GraphRule],
) -> Result<Vec<Diagnostic>, ValidationFailure> {
    let diagnostics = validate(graph, extra_rules);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(ValidationFailure::new(diagnostics));
    }
    Ok(diagnostics)
}

fn rule_single_start(graph: &Graph) -> Vec<Diagnostic> {
    let starts = graph.start_candidates();
    if starts.len() == 1 {
        Vec::new()
    } else {
        vec![Diagnostic::error(
            "single_start",
            format!(
                "pipeline must have exactly one start node; found {}",
                starts.len()
            ),
        )]
    }
}

fn rule_has_terminal(graph: &Graph) -> Vec<Diagnostic> {
    if graph.terminal_candidates().is_empty() {
        vec![Diagnostic::error(
            "has_terminal",
            "pipeline must have at least one terminal node",
        )]
    } else {
        Vec::new()
    }
}

fn rule_edge_targets_exist(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .edges
        .iter()
        .filter(|edge| !graph.nodes.contains_key(&edge.to))
        .map(|edge| {
            Diagnostic::error(
                "edge_target_exists",
                format!("edge target '{}' does not exist", edge.to),
            )
            .at_edge(edge.from.clone(), edge.to.clone())
        })
        .collect()
}

fn rule_start_has_no_incoming(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .start_candidates()
        .into_iter()
        .filter(|start| graph.incoming(&start.id).next().is_some())
        .map(|start| {
            Diagnostic::error("start_no_incoming", "start node must have no incoming edges")
                .at_node(start.id.clone())
        })
        .collect()
}

fn rule_terminal_has_no_outgoing(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .terminal_candidates()
        .into_iter()
        .filter(|terminal| graph.outgoing(&terminal.id).next().is_some())
        .map(|terminal| {
            Diagnostic::error(
                "terminal_no_outgoing",
                "terminal node must have no outgoing edges",
            )
            .at_node(terminal.id.clone())
        })
        .collect()
}

fn rule_all_reachable(graph: &Graph) -> Vec<Diagnostic> {
    let Some(start) = graph.start_candidates().into_iter().next() else {
        return Vec::new();
    };
    let reachable = graph.reachable_from(&start.id);
    graph
        .nodes
        .values()
        .filter(|node| !reachable.contains(&node.id))
        .map(|node| {
            Diagnostic::error("reachability", "node is unreachable from start")
                .at_node(node.id.clone())
        })
        .collect()
}

fn rule_conditions_parse(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for edge in &graph.edges {
        let condition = edge.condition();
        if condition.is_empty() {
            continue;
        }
        if let Err(message) = validate_condition(condition) {
            diagnostics.push(
                Diagnostic::error("condition_syntax", message)
                    .at_edge(edge.from.clone(), edge.to.clone()),
            );
        }
    }
    diagnostics
}

fn rule_stylesheet_parses(graph: &Graph) -> Vec<Diagnostic> {
    let source = graph.attrs.get_str("model_stylesheet").unwrap_or_default();
    if source.trim().is_empty() {
        return Vec::new();
    }
    match parse_stylesheet(source) {
        Ok(_) => Vec::new(),
        Err(error) => vec![Diagnostic::error("stylesheet_syntax", error.to_string())],
    }
}

fn rule_fidelity_tags_valid(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let mut check = |tag: Option<&str>, place: String| {
        if let Some(tag) = tag {
            let trimmed = tag.trim();
            if !trimmed.is_empty() && !is_valid_fidelity(trimmed) {
                diagnostics.push(Diagnostic::warning(
                    "fidelity_tag",
                    format!("unknown fidelity '{trimmed}' on {place} falls back to defaults"),
                ));
            }
        }
    };
    check(
        graph.attrs.get_str("default_fidelity"),
        "graph default".to_string(),
    );
    for node in graph.nodes.values() {
        check(node.attrs.get_str("fidelity"), format!("node '{}'", node.id));
    }
    for edge in &graph.edges {
        check(
            edge.attrs.get_str("fidelity"),
            format!("edge '{}' -> '{}'", edge.from, edge.to),
        );
    }
    diagnostics
}

fn rule_retry_targets_exist(graph: &Graph) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let mut check = |target: Option<&str>, owner: Option<&str>| {
        if let Some(target) = target {
            if !graph.nodes.contains_key(target) {
                let mut diagnostic = Diagnostic::error(
                    "retry_target_exists",
                    format!("retry target '{target}' does not exist"),
                );
                if let Some(owner) = owner {
                    diagnostic = diagnostic.at_node(owner.to_string());
                }
                diagnostics.push(diagnostic);
            }
        }
    };
    for key in ["retry_target", "fallback_retry_target"] {
        check(graph.attrs.get_trimmed(key), None);
        for node in graph.nodes.values() {
            check(node.attrs.get_trimmed(key), Some(&node.id));
        }
    }
    diagnostics
}

fn rule_goal_gates_have_retry_target(graph: &Graph) -> Vec<Diagnostic> {
    let graph_has_target = graph.attrs.get_trimmed("retry_target").is_some()
        || graph.attrs.get_trimmed("fallback_retry_target").is_some();
    graph
        .nodes
        .values()
        .filter(|node| node.goal_gate())
        .filter(|node| {
            !graph_has_target
                && node.attrs.get_trimmed("retry_target").is_none()
                && node.attrs.get_trimmed("fallback_retry_target").is_none()
        })
        .map(|node| {
            Diagnostic::warning(
                "goal_gate_retry_target",
                "goal gate has no retry target; an unsatisfied gate fails the run",
            )
            .at_node(node.id.clone())
        })
        .collect()
}

fn rule_handler_types_known(graph: &Graph) -> Vec<Diagnostic> {
    graph
        .nodes
        .values()
        .filter_map(|node| {
            let handler_type = node.handler_type()?;
            if KNOWN_HANDLER_TYPES.contains(&handler_type) || handler_type.contains('.') {
                None
            } else {
                Some(
                    Diagnostic::warning(
                        "handler_type",
                        format!("unknown handler type '{handler_type}' resolves to the default"),
                    )
                    .at_node(node.id.clone()),
                )
            }
        })
        .collect()
}
