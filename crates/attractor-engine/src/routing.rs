use crate::condition::evaluate_condition;
use crate::context::ContextMap;
use crate::graph::{Edge, Graph};
use crate::outcome::StageOutcome;

/// Picks at most one outgoing edge for the cursor to follow.
///
/// Conditional edges that evaluate true are preferred over everything else;
/// within a candidate set the outcome's preferred label (exact,
/// case-sensitive) narrows first, then any suggested next id, then the
/// greatest weight with declaration order breaking ties.
pub fn choose_edge<'a>(
    graph: &'a Graph,
    from: &'a str,
    outcome: &StageOutcome,
    context: &ContextMap,
) -> Option<&'a Edge> {
    let edges: Vec<&Edge> = graph.outgoing(from).collect();
    if edges.is_empty() {
        return None;
    }

    let matched_conditional: Vec<&Edge> = edges
        .iter()
        .copied()
        .filter(|edge| {
            let condition = edge.condition();
            !condition.is_empty()
                && evaluate_condition(condition, outcome, context).unwrap_or(false)
        })
        .collect();

    if !matched_conditional.is_empty() {
        return pick(matched_conditional, outcome);
    }

    let unconditional: Vec<&Edge> = edges
        .iter()
        .copied()
        .filter(|edge| edge.condition().is_empty())
        .collect();
    if unconditional.is_empty() {
        return None;
    }
    pick(unconditional, outcome)
}

fn pick<'a>(candidates: Vec<&'a Edge>, outcome: &StageOutcome) -> Option<&'a Edge> {
    if let Some(preferred) = outcome
        .preferred_label
        .as_deref()
        .filter(|label| !label.is_empty())
    {
        let labeled: Vec<&Edge> = candidates
            .iter()
            .copied()
            .filter(|edge| edge.label() == preferred)
            .collect();
        if !labeled.is_empty() {
            return best_by_weight(labeled);
        }
    }

    for suggested in &outcome.suggested_next_ids {
        if let Some(edge) = candidates.iter().find(|edge| edge.to == *suggested) {
            return Some(edge);
        }
    }

    best_by_weight(candidates)
}

fn best_by_weight(candidates: Vec<&Edge>) -> Option<&Edge> {
    // max_by keeps the later of equal elements; declaration order must win,
    // so equal weights compare by reversed position.
    candidates
        .into_iter()
        .enumerate()
        .max_by(|(left_pos, left), (right_pos, right)| {
            left.weight()
                .cmp(&right.weight())
                .then(right_pos.cmp(left_pos))
        })
        .map(|(_, edge)| edge)
}
