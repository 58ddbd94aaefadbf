use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// A duration attribute as written in the source (`900s`) plus its
/// normalized millisecond value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DurationLit {
    pub raw: String,
    pub millis: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Duration(DurationLit),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::String(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            Self::Integer(value) => Some(*value as f64),
            Self::String(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            Self::String(value) => match value.trim() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_millis(&self) -> Option<u64> {
        match self {
            Self::Duration(value) => Some(value.millis),
            Self::Integer(value) if *value >= 0 => Some(*value as u64),
            Self::String(value) => parse_duration_text(value),
            _ => None,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::String(value) => value.clone(),
            Self::Integer(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
            Self::Boolean(value) => value.to_string(),
            Self::Duration(value) => value.raw.clone(),
        }
    }
}

pub fn parse_duration_text(raw: &str) -> Option<u64> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    let split_at = text
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split_at);
    let amount = digits.parse::<u64>().ok()?;
    let factor = match unit {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return None,
    };
    Some(amount.saturating_mul(factor))
}

/// Attribute bag with explicit-key tracking. Keys set directly on a node or
/// edge statement stay "explicit"; keys inherited from `node [...]` /
/// `edge [...]` defaults or a stylesheet do not, and never clobber an
/// explicit value during later merges.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Attrs {
    values: BTreeMap<String, AttrValue>,
    explicit: BTreeSet<String>,
}

impl Attrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> &BTreeMap<String, AttrValue> {
        &self.values
    }

    pub fn set_inherited(&mut self, key: impl Into<String>, value: AttrValue) {
        self.values.insert(key.into(), value);
    }

    pub fn set_explicit(&mut self, key: impl Into<String>, value: AttrValue) {
        let key = key.into();
        self.explicit.insert(key.clone());
        self.values.insert(key, value);
    }

    pub fn merge_inherited(&mut self, other: &Attrs) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    pub fn merge_tracked(&mut self, other: &Attrs) {
        for (key, value) in &other.values {
            if other.explicit.contains(key) {
                self.explicit.insert(key.clone());
            }
            self.values.insert(key.clone(), value.clone());
        }
    }

    pub fn is_explicit(&self, key: &str) -> bool {
        self.explicit.contains(key)
    }

    pub fn as_defaults(&self) -> Self {
        Self {
            values: self.values.clone(),
            explicit: BTreeSet::new(),
        }
    }

    /// Looks up `key`, falling back to the underscored spelling
    /// (`manager.max_cycles` -> `manager_max_cycles`) so graphs written for
    /// stricter DOT tooling keep working.
    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        if let Some(value) = self.values.get(key) {
            return Some(value);
        }
        if key.contains('.') {
            return self.values.get(&key.replace('.', "_"));
        }
        None
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(AttrValue::as_str)
    }

    pub fn get_trimmed(&self, key: &str) -> Option<&str> {
        self.get_str(key)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(AttrValue::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(AttrValue::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(AttrValue::as_bool)
    }

    pub fn get_millis(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(AttrValue::as_millis)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub attrs: Attrs,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attrs: Attrs::new(),
        }
    }

    pub fn shape(&self) -> &str {
        self.attrs.get_str("shape").unwrap_or("box")
    }

    pub fn label(&self) -> &str {
        self.attrs.get_str("label").unwrap_or(self.id.as_str())
    }

    pub fn prompt(&self) -> &str {
        self.attrs.get_str("prompt").unwrap_or_default()
    }

    pub fn handler_type(&self) -> Option<&str> {
        self.attrs.get_trimmed("type")
    }

    pub fn goal_gate(&self) -> bool {
        self.attrs.get_bool("goal_gate").unwrap_or(false)
    }

    pub fn allow_partial(&self) -> bool {
        self.attrs.get_bool("allow_partial").unwrap_or(false)
    }

    pub fn timeout_millis(&self) -> Option<u64> {
        self.attrs.get_millis("timeout")
    }

    pub fn classes(&self) -> Vec<String> {
        split_list(self.attrs.get_str("class").unwrap_or_default())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub attrs: Attrs,
}

impl Edge {
    pub fn label(&self) -> &str {
        self.attrs.get_str("label").unwrap_or_default()
    }

    pub fn condition(&self) -> &str {
        self.attrs
            .get_str("condition")
            .unwrap_or_default()
            .trim()
    }

    pub fn weight(&self) -> i64 {
        self.attrs.get_i64("weight").unwrap_or(0)
    }

    pub fn loop_restart(&self) -> bool {
        self.attrs.get_bool("loop_restart").unwrap_or(false)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub id: String,
    pub attrs: Attrs,
    pub nodes: BTreeMap<String, Node>,
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing, skip_deserializing)]
    pub source: Option<String>,
    #[serde(default, skip_serializing, skip_deserializing)]
    pub source_path: Option<std::path::PathBuf>,
}

impl Graph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attrs: Attrs::new(),
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            source: None,
            source_path: None,
        }
    }

    pub fn goal(&self) -> &str {
        self.attrs.get_str("goal").unwrap_or_default()
    }

    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.from == node_id)
    }

    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.to == node_id)
    }

    pub fn start_candidates(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|node| {
                node.attrs.get_str("shape") == Some("Mdiamond")
                    || node.id.eq_ignore_ascii_case("start")
            })
            .collect()
    }

    pub fn terminal_candidates(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|node| is_terminal(node))
            .collect()
    }

    /// Node ids reachable from `from` (inclusive) along edge direction.
    /// Loop-restart bookkeeping and the reachability lint both use this;
    /// callers cache results when walking deep loops.
    pub fn reachable_from(&self, from: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();
        if self.nodes.contains_key(from) {
            seen.insert(from.to_string());
            queue.push_back(from.to_string());
        }
        while let Some(node_id) = queue.pop_front() {
            for edge in self.outgoing(&node_id) {
                if seen.insert(edge.to.clone()) {
                    queue.push_back(edge.to.clone());
                }
            }
        }
        seen
    }
}

pub fn is_terminal(node: &Node) -> bool {
    node.attrs.get_str("shape") == Some("Msquare")
        || matches!(node.id.to_ascii_lowercase().as_str(), "exit" | "end")
}

pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToString::to_string)
        .collect()
}
