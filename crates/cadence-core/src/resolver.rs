// Pipeline graph resolution
// Topological ordering over always/on_pass links with loop tolerance. The
// executor picks steps dynamically at runtime; this order is used for display,
// the initial step choice, and pending-step skeletons on recovery.

use std::collections::{HashMap, HashSet};

use cadence_types::{Link, LinkCondition, Step};

/// Compute a stable ordering of step ids.
///
/// `on_fail` links are ignored for ordering. Cycles are permitted: when no
/// node is free the remaining node with the smallest original index is emitted
/// next, which places the head of a strongly-connected component first.
pub fn resolution_order(steps: &[Step], links: &[Link]) -> Vec<String> {
    let index_of: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut indegree: HashMap<&str, usize> = steps.iter().map(|s| (s.id.as_str(), 0)).collect();
    let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut seen_edges: HashSet<(&str, &str)> = HashSet::new();

    for link in links {
        if link.condition == LinkCondition::OnFail {
            continue;
        }
        let src = link.source_step_id.as_str();
        let dst = link.target_step_id.as_str();
        // Ignore links to unknown steps and duplicate edges.
        if !index_of.contains_key(src) || !index_of.contains_key(dst) || src == dst {
            continue;
        }
        if !seen_edges.insert((src, dst)) {
            continue;
        }
        outgoing.entry(src).or_default().push(dst);
        *indegree.entry(dst).or_default() += 1;
    }

    let mut emitted: Vec<String> = Vec::with_capacity(steps.len());
    let mut done: HashSet<&str> = HashSet::new();

    while emitted.len() < steps.len() {
        // Free nodes first, original order breaking ties; otherwise break the
        // cycle at the earliest remaining step.
        let next = steps
            .iter()
            .filter(|s| !done.contains(s.id.as_str()))
            .find(|s| indegree.get(s.id.as_str()).copied().unwrap_or(0) == 0)
            .or_else(|| steps.iter().find(|s| !done.contains(s.id.as_str())));

        let Some(step) = next else { break };
        let id = step.id.as_str();
        done.insert(id);
        emitted.push(step.id.clone());

        if let Some(targets) = outgoing.get(id) {
            for target in targets {
                if let Some(d) = indegree.get_mut(target) {
                    *d = d.saturating_sub(1);
                }
            }
        }
    }

    emitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::{OutputFormat, StepRole};

    fn step(id: &str) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            role: StepRole::Executor,
            prompt: String::new(),
            provider_id: "claude".to_string(),
            model: "sonnet".to_string(),
            reasoning_effort: None,
            fast_mode: false,
            wide_context: false,
            context_window_tokens: None,
            context_template: String::new(),
            enable_delegation: false,
            delegation_count: 1,
            store_isolated: false,
            store_shared: false,
            mcp_server_ids: Vec::new(),
            output_format: OutputFormat::Markdown,
            required_output_fields: Vec::new(),
            required_output_files: Vec::new(),
        }
    }

    fn link(src: &str, dst: &str, condition: LinkCondition) -> Link {
        Link {
            id: format!("{src}->{dst}"),
            source_step_id: src.to_string(),
            target_step_id: dst.to_string(),
            condition,
        }
    }

    #[test]
    fn orders_linear_chain() {
        let steps = vec![step("c"), step("a"), step("b")];
        let links = vec![
            link("a", "b", LinkCondition::Always),
            link("b", "c", LinkCondition::Always),
        ];
        assert_eq!(resolution_order(&steps, &links), vec!["a", "b", "c"]);
    }

    #[test]
    fn on_fail_links_do_not_constrain_order() {
        let steps = vec![step("a"), step("b")];
        let links = vec![link("b", "a", LinkCondition::OnFail)];
        assert_eq!(resolution_order(&steps, &links), vec!["a", "b"]);
    }

    #[test]
    fn ties_break_by_original_index() {
        let steps = vec![step("x"), step("y"), step("z")];
        assert_eq!(resolution_order(&steps, &[]), vec!["x", "y", "z"]);
    }

    #[test]
    fn cycle_emits_earliest_member_first() {
        let steps = vec![step("a"), step("b"), step("c")];
        let links = vec![
            link("a", "b", LinkCondition::Always),
            link("b", "c", LinkCondition::Always),
            link("c", "b", LinkCondition::Always),
        ];
        assert_eq!(resolution_order(&steps, &links), vec!["a", "b", "c"]);
    }

    #[test]
    fn full_cycle_starts_at_first_step() {
        let steps = vec![step("a"), step("b")];
        let links = vec![
            link("a", "b", LinkCondition::Always),
            link("b", "a", LinkCondition::Always),
        ];
        assert_eq!(resolution_order(&steps, &links), vec!["a", "b"]);
    }
}
