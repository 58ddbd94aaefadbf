use crate::context::ContextMap;
use crate::outcome::StageOutcome;
use regex::Regex;
use serde_json::Value;

/// Edge-condition language: a disjunction (`||`) of conjunctions (`&&`) of
/// optionally `!`-negated clauses `key op value`. No parentheses; `!` binds
/// tighter than `&&`, `&&` tighter than `||`. The empty expression is true.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Contains,
    Matches,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Clause {
    negated: bool,
    key: String,
    op: CompareOp,
    value: String,
}

pub fn validate_condition(expression: &str) -> Result<(), String> {
    for conjunction in parse_expression(expression)? {
        for clause in conjunction {
            if !is_condition_key(&clause.key) {
                return Err(format!("condition key '{}' is invalid", clause.key));
            }
            if clause.op == CompareOp::Matches {
                Regex::new(&clause.value)
                    .map_err(|error| format!("invalid regex '{}': {error}", clause.value))?;
            }
        }
    }
    Ok(())
}

pub fn evaluate_condition(
    expression: &str,
    outcome: &StageOutcome,
    context: &ContextMap,
) -> Result<bool, String> {
    let disjunction = parse_expression(expression)?;
    if disjunction.is_empty() {
        return Ok(true);
    }
    for conjunction in disjunction {
        if conjunction
            .iter()
            .all(|clause| evaluate_clause(clause, outcome, context))
        {
            return Ok(true);
        }
    }
    Ok(false)
}

fn evaluate_clause(clause: &Clause, outcome: &StageOutcome, context: &ContextMap) -> bool {
    let left = resolve_key(&clause.key, outcome, context);
    let satisfied = match clause.op {
        CompareOp::Eq => left == clause.value,
        CompareOp::Ne => left != clause.value,
        CompareOp::Contains => left.contains(&clause.value),
        CompareOp::Matches => Regex::new(&clause.value)
            .map(|regex| regex.is_match(&left))
            .unwrap_or(false),
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            numeric_compare(&left, &clause.value, clause.op)
        }
    };
    satisfied != clause.negated
}

fn numeric_compare(left_raw: &str, right_raw: &str, op: CompareOp) -> bool {
    let ordering = match (
        left_raw.trim().parse::<i64>(),
        right_raw.trim().parse::<i64>(),
    ) {
        (Ok(left), Ok(right)) => left.cmp(&right),
        _ => {
            let (Ok(left), Ok(right)) = (
                left_raw.trim().parse::<f64>(),
                right_raw.trim().parse::<f64>(),
            ) else {
                return false;
            };
            let Some(ordering) = left.partial_cmp(&right) else {
                return false;
            };
            ordering
        }
    };
    match op {
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::Le => ordering.is_le(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Ge => ordering.is_ge(),
        _ => false,
    }
}

fn resolve_key(key: &str, outcome: &StageOutcome, context: &ContextMap) -> String {
    match key {
        "outcome" => outcome.status.as_str().to_string(),
        "preferred_label" => outcome.preferred_label.clone().unwrap_or_default(),
        _ => key
            .strip_prefix("context.")
            .and_then(|suffix| context.get(suffix))
            .map(value_to_string)
            .unwrap_or_default(),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn is_condition_key(key: &str) -> bool {
    if key == "outcome" || key == "preferred_label" {
        return true;
    }
    let Some(suffix) = key.strip_prefix("context.") else {
        return false;
    };
    let mut chars = suffix.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '.')
}

fn parse_expression(expression: &str) -> Result<Vec<Vec<Clause>>, String> {
    let mut disjunction = Vec::new();
    for branch in split_outside_quotes(expression, "||") {
        let branch = branch.trim();
        if branch.is_empty() {
            continue;
        }
        let mut conjunction = Vec::new();
        for raw_clause in split_outside_quotes(branch, "&&") {
            let raw_clause = raw_clause.trim();
            if raw_clause.is_empty() {
                continue;
            }
            conjunction.push(parse_clause(raw_clause)?);
        }
        if !conjunction.is_empty() {
            disjunction.push(conjunction);
        }
    }
    Ok(disjunction)
}

fn parse_clause(raw: &str) -> Result<Clause, String> {
    let (negated, body) = match raw.strip_prefix('!') {
        // `!=` at the very front means a malformed clause, not negation.
        Some(rest) if !rest.starts_with('=') => (true, rest.trim_start()),
        _ => (false, raw),
    };

    let (key, op, value) = split_operator(body)
        .ok_or_else(|| format!("condition clause '{raw}' has no operator"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("condition clause '{raw}' has empty key"));
    }
    let value = unquote(value.trim());
    if value.is_empty() && matches!(op, CompareOp::Eq | CompareOp::Ne) {
        return Err(format!("condition clause '{raw}' has empty value"));
    }

    Ok(Clause {
        negated,
        key: key.to_string(),
        op,
        value,
    })
}

/// Finds the first operator occurrence outside quotes. Symbolic operators are
/// checked longest-first so `<=` never reads as `<`; the word operators must
/// stand alone between whitespace.
fn split_operator(body: &str) -> Option<(&str, CompareOp, &str)> {
    let symbolic: [(&str, CompareOp); 6] = [
        ("!=", CompareOp::Ne),
        ("<=", CompareOp::Le),
        (">=", CompareOp::Ge),
        ("=", CompareOp::Eq),
        ("<", CompareOp::Lt),
        (">", CompareOp::Gt),
    ];
    let words: [(&str, CompareOp); 2] = [
        ("contains", CompareOp::Contains),
        ("matches", CompareOp::Matches),
    ];

    let mut best: Option<(usize, usize, CompareOp)> = None;
    let mut in_quote: Option<char> = None;
    let chars: Vec<char> = body.chars().collect();
    let mut byte_index = 0;

    for (char_index, ch) in chars.iter().enumerate() {
        match in_quote {
            Some(quote) => {
                if *ch == quote {
                    in_quote = None;
                }
            }
            None => {
                if *ch == '\'' || *ch == '"' {
                    in_quote = Some(*ch);
                } else {
                    let rest = &body[byte_index..];
                    for (token, op) in symbolic {
                        if rest.starts_with(token)
                            && best.is_none_or(|(index, _, _)| byte_index < index)
                        {
                            best = Some((byte_index, token.len(), op));
                            break;
                        }
                    }
                    for (token, op) in words {
                        let preceded_by_space =
                            char_index > 0 && chars[char_index - 1].is_whitespace();
                        let followed = rest
                            .get(token.len()..)
                            .and_then(|tail| tail.chars().next());
                        if preceded_by_space
                            && rest.starts_with(token)
                            && followed.is_none_or(char::is_whitespace)
                            && best.is_none_or(|(index, _, _)| byte_index < index)
                        {
                            best = Some((byte_index, token.len(), op));
                        }
                    }
                }
            }
        }
        byte_index += ch.len_utf8();
    }

    best.map(|(index, len, op)| (&body[..index], op, &body[index + len..]))
}

fn split_outside_quotes<'a>(input: &'a str, separator: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut in_quote: Option<char> = None;
    let mut start = 0;
    let mut skip_until = 0;

    for (index, ch) in input.char_indices() {
        if index < skip_until {
            continue;
        }
        match in_quote {
            Some(quote) => {
                if ch == quote {
                    in_quote = None;
                }
            }
            None => {
                if ch == '\'' || ch == '"' {
                    in_quote = Some(ch);
                } else if input[index..].starts_with(separator) {
                    parts.push(&input[start..index]);
                    skip_until = index + separator.len();
                    start = skip_until;
                }
            }
        }
    }
    parts.push(&input[start..]);
    parts
}

fn unquote(raw: &str) -> String {
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return raw[1..raw.len() - 1].to_string();
        }
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn success_outcome() -> StageOutcome {
        let mut outcome = StageOutcome::success();
        outcome.preferred_label = Some("Yes".to_string());
        outcome
    }

    fn eval(expression: &str, context: &ContextMap) -> bool {
        evaluate_condition(expression, &success_outcome(), context)
            .expect("evaluation should succeed")
    }

    #[test]
    fn empty_expression_is_true() {
        assert!(eval("", &ContextMap::new()));
        assert!(eval("   ", &ContextMap::new()));
    }

    #[test]
    fn equality_and_inequality_compare_coerced_strings() {
        let context = ContextMap::from([("count".to_string(), json!(3))]);
        assert!(eval("outcome=success", &context));
        assert!(!eval("outcome!=success", &context));
        assert!(eval("context.count=3", &context));
        assert!(eval("context.missing!=anything", &context));
    }

    #[test]
    fn quoted_values_keep_spaces_and_separators() {
        let context = ContextMap::from([("note".to_string(), json!("a && b"))]);
        assert!(eval("context.note=\"a && b\"", &context));
        assert!(eval("context.note contains '&&'", &context));
    }

    #[test]
    fn contains_empty_substring_always_matches() {
        let context = ContextMap::from([("note".to_string(), json!("anything"))]);
        assert!(eval("context.note contains \"\"", &context));
        assert!(eval("context.missing contains ''", &context));
    }

    #[test]
    fn matches_uses_regex_semantics() {
        let context = ContextMap::from([("branch".to_string(), json!("feature/retry-42"))]);
        assert!(eval("context.branch matches \"retry-[0-9]+\"", &context));
        assert!(!eval("context.branch matches \"^release/\"", &context));
    }

    #[test]
    fn numeric_operators_fail_closed_on_non_numbers() {
        let context = ContextMap::from([
            ("score".to_string(), json!(7)),
            ("ratio".to_string(), json!(0.25)),
            ("word".to_string(), json!("seven")),
        ]);
        assert!(eval("context.score > 5", &context));
        assert!(eval("context.score <= 7", &context));
        assert!(eval("context.ratio < 0.5", &context));
        assert!(!eval("context.word > 5", &context));
        assert!(!eval("context.missing < 1", &context));
    }

    #[test]
    fn negation_wraps_the_whole_clause() {
        let context = ContextMap::from([("score".to_string(), json!(7))]);
        assert!(eval("!context.score > 100", &context));
        assert!(!eval("!outcome=success", &context));
        assert!(eval("!context.note contains err", &context));
    }

    #[test]
    fn precedence_and_binds_tighter_than_or() {
        let context = ContextMap::from([("flag".to_string(), json!("on"))]);
        // (outcome=fail && flag=on) || outcome=success
        assert!(eval(
            "outcome=fail && context.flag=on || outcome=success",
            &context
        ));
        // outcome=fail || (flag=off && outcome=success)
        assert!(!eval(
            "outcome=fail || context.flag=off && outcome=success",
            &context
        ));
    }

    #[test]
    fn preferred_label_key_resolves_from_outcome() {
        assert!(eval("preferred_label=Yes", &ContextMap::new()));
        assert!(!eval("preferred_label=No", &ContextMap::new()));
    }

    #[test]
    fn validate_condition_rejects_bad_keys_and_regexes() {
        assert!(validate_condition("outcome=success && context.ready=true").is_ok());
        assert!(validate_condition("bogus=1").is_err());
        assert!(validate_condition("context.x matches \"(\"").is_err());
        assert!(validate_condition("context.x ??? 1").is_err());
    }
}
