use crate::EngineError;
use crate::graph::{AttrValue, Attrs, DurationLit, Edge, Graph, Node, split_list};
use graphviz_rust::dot_structures::{
    Attribute, Edge as DotEdge, EdgeTy, Graph as DotGraph, GraphAttributes, Id, Node as DotNode,
    NodeId, Stmt, Subgraph, Vertex,
};

/// Parses the Attractor DOT subset: a single non-strict `digraph` with node
/// and edge statements (chains allowed), `node []` / `edge []` defaults,
/// graph attributes, and `cluster` subgraphs whose labels become node
/// classes. Undirected edges, ports, and HTML values are rejected.
pub fn parse_pipeline(source: &str) -> Result<Graph, EngineError> {
    if contains_undirected_edge(source) {
        return Err(EngineError::Parse(
            "undirected edge operator '--' is not supported".to_string(),
        ));
    }

    let quoted = quote_bare_durations(source);
    let dot = graphviz_rust::parse(&quoted).map_err(EngineError::Parse)?;

    let (id, strict, stmts) = match dot {
        DotGraph::DiGraph { id, strict, stmts } => (id, strict, stmts),
        DotGraph::Graph { .. } => {
            return Err(EngineError::Parse(
                "only 'digraph' pipelines are supported".to_string(),
            ));
        }
    };
    if strict {
        return Err(EngineError::Parse(
            "'strict' digraphs are not supported".to_string(),
        ));
    }

    let mut graph = Graph::new(graph_name(id)?);
    graph.source = Some(source.to_string());
    collect_statements(&mut graph, &stmts, &DefaultsFrame::default(), true)?;
    Ok(graph)
}

#[derive(Clone, Debug, Default)]
struct DefaultsFrame {
    node_defaults: Attrs,
    edge_defaults: Attrs,
    classes: Vec<String>,
}

fn collect_statements(
    graph: &mut Graph,
    stmts: &[Stmt],
    parent: &DefaultsFrame,
    top_level: bool,
) -> Result<(), EngineError> {
    let mut frame = parent.clone();

    for stmt in stmts {
        match stmt {
            Stmt::GAttribute(GraphAttributes::Node(attrs)) => {
                frame.node_defaults.merge_inherited(&convert_attrs(attrs)?);
            }
            Stmt::GAttribute(GraphAttributes::Edge(attrs)) => {
                frame.edge_defaults.merge_inherited(&convert_attrs(attrs)?);
            }
            Stmt::GAttribute(GraphAttributes::Graph(attrs)) => {
                if top_level {
                    graph.attrs.merge_inherited(&convert_attrs(attrs)?);
                }
            }
            Stmt::Attribute(attr) => {
                if top_level {
                    let (key, value) = convert_attr(attr)?;
                    graph.attrs.set_explicit(key, value);
                }
            }
            Stmt::Node(node) => collect_node(graph, node, &frame)?,
            Stmt::Edge(edge) => collect_edge(graph, edge, &frame)?,
            Stmt::Subgraph(subgraph) => collect_subgraph(graph, subgraph, &frame)?,
        }
    }
    Ok(())
}

fn collect_subgraph(
    graph: &mut Graph,
    subgraph: &Subgraph,
    parent: &DefaultsFrame,
) -> Result<(), EngineError> {
    let mut frame = parent.clone();
    if let Some(class) = subgraph_class(subgraph)? {
        frame.classes.push(class);
    }
    collect_statements(graph, &subgraph.stmts, &frame, false)
}

/// A cluster's `label` slugified (lowercased, runs of non-alphanumerics
/// collapsed to `-`) names the class its member nodes receive.
fn subgraph_class(subgraph: &Subgraph) -> Result<Option<String>, EngineError> {
    let mut label = None;
    for stmt in &subgraph.stmts {
        match stmt {
            Stmt::Attribute(Attribute(key, value)) if attr_key(key)? == "label" => {
                label = Some(id_text(value)?);
            }
            Stmt::GAttribute(GraphAttributes::Graph(attrs)) => {
                for attr in attrs {
                    let (key, value) = convert_attr(attr)?;
                    if key == "label" {
                        label = Some(value.render());
                    }
                }
            }
            _ => {}
        }
    }
    Ok(label.as_deref().and_then(slugify))
}

fn slugify(label: &str) -> Option<String> {
    let mut slug = String::new();
    for ch in label.trim().to_ascii_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    (!slug.is_empty()).then_some(slug)
}

fn collect_node(graph: &mut Graph, node: &DotNode, frame: &DefaultsFrame) -> Result<(), EngineError> {
    let node_id = vertex_id(&node.id)?;

    let mut attrs = frame.node_defaults.as_defaults();
    attrs.merge_tracked(&convert_attrs(&node.attributes)?);
    apply_frame_classes(&mut attrs, &frame.classes);

    let entry = graph
        .nodes
        .entry(node_id.clone())
        .or_insert_with(|| Node::new(node_id));
    entry.attrs.merge_tracked(&attrs);
    Ok(())
}

fn apply_frame_classes(attrs: &mut Attrs, frame_classes: &[String]) {
    if frame_classes.is_empty() {
        return;
    }
    let mut classes = split_list(attrs.get_str("class").unwrap_or_default());
    for class in frame_classes {
        if !classes.contains(class) {
            classes.push(class.clone());
        }
    }
    attrs.set_inherited("class", AttrValue::String(classes.join(",")));
}

fn collect_edge(graph: &mut Graph, edge: &DotEdge, frame: &DefaultsFrame) -> Result<(), EngineError> {
    let hops: Vec<String> = match &edge.ty {
        EdgeTy::Pair(from, to) => vec![endpoint_id(from)?, endpoint_id(to)?],
        EdgeTy::Chain(chain) => chain
            .iter()
            .map(endpoint_id)
            .collect::<Result<Vec<_>, _>>()?,
    };
    if hops.len() < 2 {
        return Err(EngineError::Parse(
            "edge statement needs at least two endpoints".to_string(),
        ));
    }

    let mut attrs = frame.edge_defaults.as_defaults();
    attrs.merge_tracked(&convert_attrs(&edge.attributes)?);

    for pair in hops.windows(2) {
        for endpoint in pair {
            graph
                .nodes
                .entry(endpoint.clone())
                .or_insert_with(|| Node::new(endpoint.clone()));
        }
        graph.edges.push(Edge {
            from: pair[0].clone(),
            to: pair[1].clone(),
            attrs: attrs.clone(),
        });
    }
    Ok(())
}

fn endpoint_id(vertex: &Vertex) -> Result<String, EngineError> {
    match vertex {
        Vertex::N(node_id) => vertex_id(node_id),
        Vertex::S(_) => Err(EngineError::Parse(
            "subgraphs as edge endpoints are not supported".to_string(),
        )),
    }
}

fn vertex_id(node_id: &NodeId) -> Result<String, EngineError> {
    if node_id.1.is_some() {
        return Err(EngineError::Parse(
            "ports in node identifiers are not supported".to_string(),
        ));
    }
    let id = id_text(&node_id.0)?;
    if !is_identifier(&id) {
        return Err(EngineError::Parse(format!(
            "node id '{id}' is invalid; expected [A-Za-z_][A-Za-z0-9_]*"
        )));
    }
    Ok(id)
}

fn graph_name(id: Id) -> Result<String, EngineError> {
    match id {
        Id::Anonymous(value) => Ok(value),
        other => id_text(&other),
    }
}

fn convert_attrs(attrs: &[Attribute]) -> Result<Attrs, EngineError> {
    let mut converted = Attrs::new();
    for attr in attrs {
        let (key, value) = convert_attr(attr)?;
        converted.set_explicit(key, value);
    }
    Ok(converted)
}

fn convert_attr(attr: &Attribute) -> Result<(String, AttrValue), EngineError> {
    Ok((attr_key(&attr.0)?, attr_value(&attr.1)?))
}

fn attr_key(id: &Id) -> Result<String, EngineError> {
    let key = id_text(id)?;
    let valid = !key.is_empty()
        && key.split('.').all(|segment| {
            let mut chars = segment.chars();
            matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
                && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        });
    if valid {
        Ok(key)
    } else {
        Err(EngineError::Parse(format!("invalid attribute key '{key}'")))
    }
}

fn attr_value(id: &Id) -> Result<AttrValue, EngineError> {
    match id {
        Id::Html(_) => Err(EngineError::Parse(
            "HTML attribute values are not supported".to_string(),
        )),
        Id::Escaped(_) => {
            let text = id_text(id)?;
            Ok(match parse_duration_literal(&text) {
                Some(duration) => AttrValue::Duration(duration),
                None => AttrValue::String(text),
            })
        }
        Id::Plain(raw) => Ok(typed_plain_value(raw)),
        Id::Anonymous(value) => Ok(AttrValue::String(value.clone())),
    }
}

fn typed_plain_value(raw: &str) -> AttrValue {
    match raw {
        "true" => return AttrValue::Boolean(true),
        "false" => return AttrValue::Boolean(false),
        _ => {}
    }
    if let Some(duration) = parse_duration_literal(raw) {
        return AttrValue::Duration(duration);
    }
    if let Ok(value) = raw.parse::<i64>() {
        return AttrValue::Integer(value);
    }
    if raw.contains('.') {
        if let Ok(value) = raw.parse::<f64>() {
            return AttrValue::Float(value);
        }
    }
    AttrValue::String(raw.to_string())
}

fn parse_duration_literal(raw: &str) -> Option<DurationLit> {
    if raw.len() < 2 {
        return None;
    }
    let unit = ["ms", "s", "m", "h", "d"]
        .into_iter()
        .find(|unit| raw.ends_with(unit))?;
    let amount = raw[..raw.len() - unit.len()].parse::<u64>().ok()?;
    let factor = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => unreachable!(),
    };
    Some(DurationLit {
        raw: raw.to_string(),
        millis: amount.saturating_mul(factor),
    })
}

fn id_text(id: &Id) -> Result<String, EngineError> {
    match id {
        Id::Plain(value) | Id::Anonymous(value) => Ok(value.clone()),
        Id::Escaped(value) => {
            let unquoted = value
                .strip_prefix('"')
                .and_then(|inner| inner.strip_suffix('"'))
                .ok_or_else(|| {
                    EngineError::Parse(format!("escaped id '{value}' is missing quotes"))
                })?;
            Ok(unescape(unquoted))
        }
        Id::Html(_) => Err(EngineError::Parse(
            "HTML labels are not supported".to_string(),
        )),
    }
}

fn unescape(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => output.push('\n'),
            Some('t') => output.push('\t'),
            Some('"') => output.push('"'),
            Some('\\') => output.push('\\'),
            Some(other) => output.push(other),
            None => output.push('\\'),
        }
    }
    output
}

fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// Byte classes the pre-pass tracks while scanning outside of strings and
/// comments.
#[derive(Clone, Copy, PartialEq)]
enum ScanState {
    Code,
    Quoted,
    LineComment,
    BlockComment,
}

fn scan_source(source: &str, mut visit: impl FnMut(ScanState, usize, char)) {
    let mut state = ScanState::Code;
    let mut chars = source.char_indices().peekable();
    while let Some((index, ch)) = chars.next() {
        let next = chars.peek().map(|(_, ch)| *ch);
        match state {
            ScanState::Code => match ch {
                '"' => {
                    state = ScanState::Quoted;
                    visit(ScanState::Code, index, ch);
                }
                '/' if next == Some('/') => state = ScanState::LineComment,
                '/' if next == Some('*') => state = ScanState::BlockComment,
                _ => visit(ScanState::Code, index, ch),
            },
            ScanState::Quoted => {
                visit(ScanState::Quoted, index, ch);
                if ch == '\\' {
                    chars.next();
                } else if ch == '"' {
                    state = ScanState::Code;
                }
            }
            ScanState::LineComment => {
                if ch == '\n' {
                    state = ScanState::Code;
                }
            }
            ScanState::BlockComment => {
                if ch == '*' && next == Some('/') {
                    chars.next();
                    state = ScanState::Code;
                }
            }
        }
    }
}

fn contains_undirected_edge(source: &str) -> bool {
    let mut previous: Option<char> = None;
    let mut found = false;
    scan_source(source, |state, _, ch| {
        if state == ScanState::Code {
            if previous == Some('-') && ch == '-' {
                found = true;
            }
            previous = Some(ch);
        } else {
            previous = None;
        }
    });
    found
}

/// `timeout=900s` is not valid DOT (a plain id cannot start with a digit),
/// so bare duration tokens after `=` get quoted before the real parse.
fn quote_bare_durations(source: &str) -> String {
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut token_start: Option<usize> = None;
    let mut token_end = 0;
    let mut after_equals = false;

    scan_source(source, |state, index, ch| {
        if state != ScanState::Code {
            token_start = None;
            after_equals = false;
            return;
        }
        if ch == '=' {
            after_equals = true;
            token_start = None;
            return;
        }
        if after_equals && ch.is_whitespace() {
            return;
        }
        if after_equals && ch.is_ascii_alphanumeric() {
            if token_start.is_none() {
                token_start = Some(index);
            }
            token_end = index + ch.len_utf8();
            return;
        }
        if let Some(start) = token_start.take() {
            if parse_duration_literal(&source[start..token_end]).is_some() {
                spans.push((start, token_end));
            }
        }
        after_equals = false;
    });
    if let Some(start) = token_start {
        if parse_duration_literal(&source[start..token_end]).is_some() {
            spans.push((start, token_end));
        }
    }

    let mut output = String::with_capacity(source.len() + spans.len() * 2);
    let mut cursor = 0;
    for (start, end) in spans {
        output.push_str(&source[cursor..start]);
        output.push('"');
        output.push_str(&source[start..end]);
        output.push('"');
        cursor = end;
    }
    output.push_str(&source[cursor..]);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_chain_produces_nodes_and_edges() {
        let graph = parse_pipeline(
            r#"
            digraph G {
                start [shape=Mdiamond]
                plan [prompt="Write a plan for $goal"]
                exit [shape=Msquare]
                start -> plan -> exit
            }
            "#,
        )
        .expect("graph should parse");

        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.edges[0].from, "start");
        assert_eq!(graph.edges[1].to, "exit");
    }

    #[test]
    fn edge_only_nodes_are_materialized() {
        let graph = parse_pipeline("digraph G { a -> b }").expect("graph should parse");
        assert!(graph.nodes.contains_key("a"));
        assert!(graph.nodes.contains_key("b"));
    }

    #[test]
    fn node_defaults_inherit_without_clobbering_explicit() {
        let graph = parse_pipeline(
            r#"
            digraph G {
                node [fidelity="compact", max_retries=2]
                plan [fidelity="full"]
                build
            }
            "#,
        )
        .expect("graph should parse");

        let plan = graph.nodes.get("plan").expect("plan should exist");
        assert_eq!(plan.attrs.get_str("fidelity"), Some("full"));
        assert_eq!(plan.attrs.get_i64("max_retries"), Some(2));

        let build = graph.nodes.get("build").expect("build should exist");
        assert_eq!(build.attrs.get_str("fidelity"), Some("compact"));
    }

    #[test]
    fn cluster_label_becomes_node_class_and_durations_parse() {
        let graph = parse_pipeline(
            r#"
            digraph G {
                subgraph cluster_review {
                    label="Review Loop"
                    node [timeout=900s]
                    check
                }
            }
            "#,
        )
        .expect("graph should parse");

        let check = graph.nodes.get("check").expect("check should exist");
        assert_eq!(check.attrs.get_str("class"), Some("review-loop"));
        assert_eq!(check.attrs.get_millis("timeout"), Some(900_000));
    }

    #[test]
    fn graph_attributes_collect_at_top_level() {
        let graph = parse_pipeline(
            r#"
            digraph pipeline {
                graph [goal="ship the thing", default_max_retry=3]
                label="Pipeline"
                a
            }
            "#,
        )
        .expect("graph should parse");

        assert_eq!(graph.id, "pipeline");
        assert_eq!(graph.goal(), "ship the thing");
        assert_eq!(graph.attrs.get_i64("default_max_retry"), Some(3));
        assert_eq!(graph.attrs.get_str("label"), Some("Pipeline"));
    }

    #[test]
    fn undirected_edges_are_rejected_but_comments_are_not() {
        let error = parse_pipeline("digraph G { a -- b }").expect_err("parse must fail");
        assert!(error.to_string().contains("--"));

        parse_pipeline("digraph G { a // -- not an edge\n }").expect("comment should parse");
        parse_pipeline("digraph G { a [label=\"x -- y\"] }").expect("quoted should parse");
    }

    #[test]
    fn strict_and_undirected_graphs_are_rejected() {
        assert!(parse_pipeline("strict digraph G { a }").is_err());
        assert!(parse_pipeline("graph G { a }").is_err());
    }

    #[test]
    fn typed_values_come_through() {
        let graph = parse_pipeline(
            r#"
            digraph G {
                n [weight=7, ratio=0.5, goal_gate=true, name="quoted"]
            }
            "#,
        )
        .expect("graph should parse");

        let node = graph.nodes.get("n").expect("node should exist");
        assert_eq!(node.attrs.get_i64("weight"), Some(7));
        assert_eq!(node.attrs.get_f64("ratio"), Some(0.5));
        assert_eq!(node.attrs.get_bool("goal_gate"), Some(true));
        assert_eq!(node.attrs.get_str("name"), Some("quoted"));
    }

    #[test]
    fn parse_serialize_parse_is_isomorphic() {
        let graph = parse_pipeline(
            r#"
            digraph G {
                graph [goal="g"]
                start [shape=Mdiamond]
                work [max_retries=2, class="a,b"]
                exit [shape=Msquare]
                start -> work [condition="outcome=success", weight=3]
                work -> exit
            }
            "#,
        )
        .expect("graph should parse");

        let json = serde_json::to_string(&graph).expect("graph should serialize");
        let restored: Graph = serde_json::from_str(&json).expect("graph should deserialize");
        assert_eq!(restored.id, graph.id);
        assert_eq!(restored.attrs, graph.attrs);
        assert_eq!(restored.nodes, graph.nodes);
        assert_eq!(restored.edges, graph.edges);
    }
}
