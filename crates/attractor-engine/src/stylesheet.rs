use crate::EngineError;
use crate::graph::{AttrValue, Graph};

/// Properties a model stylesheet may set. Anything else in a declaration
/// block is ignored so stylesheets can carry annotations for other tools.
pub const STYLESHEET_PROPERTIES: [&str; 3] = ["llm_model", "llm_provider", "reasoning_effort"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StyleSelector {
    Universal,
    NodeId(String),
    Class(String),
}

impl StyleSelector {
    fn specificity(&self) -> usize {
        match self {
            Self::Universal => 0,
            Self::Class(_) => 1,
            Self::NodeId(_) => 2,
        }
    }

    fn matches(&self, node_id: &str, classes: &[String]) -> bool {
        match self {
            Self::Universal => true,
            Self::NodeId(id) => id == node_id,
            Self::Class(class) => classes.iter().any(|candidate| candidate == class),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StyleRule {
    pub selector: StyleSelector,
    pub declarations: Vec<(String, String)>,
    pub order: usize,
}

/// CSS-like syntax: `selector { prop: value; ... }` blocks, where a selector
/// is `*`, `.class`, or `#node_id` (a bare name also addresses a node id).
pub fn parse_stylesheet(source: &str) -> Result<Vec<StyleRule>, EngineError> {
    let mut rules = Vec::new();
    let mut rest = source;

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let Some(open) = rest.find('{') else {
            return Err(EngineError::Stylesheet(
                "expected '{' after selector".to_string(),
            ));
        };
        let selector = parse_selector(rest[..open].trim())?;
        rest = &rest[open + 1..];

        let Some(close) = rest.find('}') else {
            return Err(EngineError::Stylesheet(
                "missing closing '}' in rule".to_string(),
            ));
        };
        let declarations = parse_declarations(&rest[..close])?;
        rest = &rest[close + 1..];

        rules.push(StyleRule {
            selector,
            declarations,
            order: rules.len(),
        });
    }
    Ok(rules)
}

fn parse_selector(raw: &str) -> Result<StyleSelector, EngineError> {
    if raw.is_empty() {
        return Err(EngineError::Stylesheet("empty selector".to_string()));
    }
    if raw == "*" {
        return Ok(StyleSelector::Universal);
    }
    if let Some(class) = raw.strip_prefix('.') {
        if class.is_empty() {
            return Err(EngineError::Stylesheet("empty class selector".to_string()));
        }
        return Ok(StyleSelector::Class(class.to_string()));
    }
    let id = raw.strip_prefix('#').unwrap_or(raw);
    if id.is_empty() || id.contains(char::is_whitespace) {
        return Err(EngineError::Stylesheet(format!("invalid selector '{raw}'")));
    }
    Ok(StyleSelector::NodeId(id.to_string()))
}

fn parse_declarations(block: &str) -> Result<Vec<(String, String)>, EngineError> {
    let mut declarations = Vec::new();
    for entry in block.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((property, value)) = entry.split_once(':') else {
            return Err(EngineError::Stylesheet(format!(
                "declaration '{entry}' is missing ':'"
            )));
        };
        let property = property.trim();
        let value = value.trim().trim_matches('"');
        if property.is_empty() || value.is_empty() {
            return Err(EngineError::Stylesheet(format!(
                "declaration '{entry}' has an empty side"
            )));
        }
        declarations.push((property.to_string(), value.to_string()));
    }
    Ok(declarations)
}

/// Resolves the graph's `model_stylesheet` onto its nodes. Explicit node
/// attributes always win; among matching rules, higher specificity wins and
/// later rules break ties.
pub fn apply_model_stylesheet(graph: &mut Graph) -> Result<(), EngineError> {
    let source = graph
        .attrs
        .get_str("model_stylesheet")
        .unwrap_or_default()
        .to_string();
    if source.trim().is_empty() {
        return Ok(());
    }
    let rules = parse_stylesheet(&source)?;

    for node in graph.nodes.values_mut() {
        let classes = crate::graph::split_list(node.attrs.get_str("class").unwrap_or_default());
        for property in STYLESHEET_PROPERTIES {
            if node.attrs.is_explicit(property) {
                continue;
            }
            let winner = rules
                .iter()
                .filter(|rule| rule.selector.matches(&node.id, &classes))
                .filter_map(|rule| {
                    rule.declarations
                        .iter()
                        .find(|(name, _)| name == property)
                        .map(|(_, value)| (rule.selector.specificity(), rule.order, value))
                })
                .max_by_key(|(specificity, order, _)| (*specificity, *order));
            if let Some((_, _, value)) = winner {
                node.attrs
                    .set_inherited(property, AttrValue::String(value.clone()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_pipeline;

    #[test]
    fn parse_stylesheet_reads_rules_in_order() {
        let rules = parse_stylesheet(
            "* { llm_model: base; } .review { llm_model: strong; reasoning_effort: high; }",
        )
        .expect("stylesheet should parse");

        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].selector, StyleSelector::Universal);
        assert_eq!(rules[1].selector, StyleSelector::Class("review".to_string()));
        assert_eq!(rules[1].declarations.len(), 2);
    }

    #[test]
    fn parse_stylesheet_rejects_unterminated_rule() {
        assert!(parse_stylesheet("* { llm_model: base; ").is_err());
        assert!(parse_stylesheet("{ llm_model: base; }").is_err());
        assert!(parse_stylesheet("* { llm_model }").is_err());
    }

    #[test]
    fn apply_resolves_specificity_and_explicit_wins() {
        let mut graph = parse_pipeline(
            r#"
            digraph G {
                graph [model_stylesheet="* { llm_model: base; } .review { llm_model: classy; } #check { llm_model: exact; }"]
                plan
                check [class="review"]
                pinned [llm_model="mine"]
                audit [class="review"]
            }
            "#,
        )
        .expect("graph should parse");

        apply_model_stylesheet(&mut graph).expect("stylesheet should apply");

        let get = |id: &str| {
            graph
                .nodes
                .get(id)
                .and_then(|node| node.attrs.get_str("llm_model"))
                .map(ToOwned::to_owned)
        };
        assert_eq!(get("plan").as_deref(), Some("base"));
        assert_eq!(get("audit").as_deref(), Some("classy"));
        assert_eq!(get("check").as_deref(), Some("exact"));
        assert_eq!(get("pinned").as_deref(), Some("mine"));
    }

    #[test]
    fn later_rule_wins_equal_specificity() {
        let mut graph = parse_pipeline(
            r#"
            digraph G {
                graph [model_stylesheet=".a { llm_provider: first; } .b { llm_provider: second; }"]
                n [class="a,b"]
            }
            "#,
        )
        .expect("graph should parse");

        apply_model_stylesheet(&mut graph).expect("stylesheet should apply");
        let node = graph.nodes.get("n").expect("node should exist");
        assert_eq!(node.attrs.get_str("llm_provider"), Some("second"));
    }
}
