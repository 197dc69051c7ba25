//! Static step graph: predecessors, join arity, back edges.
//!
//! Join arity is the number of distinct predecessors reached over forward
//! edges. Edges that close a cycle (found by depth-first search from the root
//! steps) are back edges; a token arriving over one activates its target on
//! its own instead of waiting at the join.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use crate::playbook::types::Playbook;

/// Name of the step that receives the initial token when present.
pub const START_STEP: &str = "start";

#[derive(Debug, Clone)]
pub struct StepGraph {
    order: Vec<String>,
    successors: BTreeMap<String, Vec<String>>,
    predecessors: BTreeMap<String, Vec<String>>,
    back_edges: BTreeSet<(String, String)>,
    roots: Vec<String>,
}

impl StepGraph {
    pub fn new(playbook: &Playbook) -> Self {
        let order: Vec<String> = playbook.workflow.iter().map(|s| s.step.clone()).collect();

        let mut successors: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for step in &playbook.workflow {
            let mut targets: Vec<String> = Vec::new();
            for target in step.transitions() {
                if !targets.contains(&target.step) {
                    targets.push(target.step);
                }
            }
            successors.insert(step.step.clone(), targets);
        }

        let roots = find_roots(&order, &successors);
        let back_edges = find_back_edges(&order, &roots, &successors);

        let mut predecessors: BTreeMap<String, Vec<String>> =
            order.iter().map(|s| (s.clone(), Vec::new())).collect();
        for from in &order {
            for to in successors.get(from).into_iter().flatten() {
                if back_edges.contains(&(from.clone(), to.clone())) {
                    continue;
                }
                if let Some(preds) = predecessors.get_mut(to) {
                    if !preds.contains(from) {
                        preds.push(from.clone());
                    }
                }
            }
        }

        Self {
            order,
            successors,
            predecessors,
            back_edges,
            roots,
        }
    }

    /// Steps that receive a token when an execution starts.
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Distinct forward predecessors in declaration order.
    pub fn predecessors(&self, step: &str) -> &[String] {
        self.predecessors
            .get(step)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn successors(&self, step: &str) -> &[String] {
        self.successors.get(step).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn join_arity(&self, step: &str) -> usize {
        self.predecessors(step).len().max(1)
    }

    pub fn is_join(&self, step: &str) -> bool {
        self.predecessors(step).len() > 1
    }

    pub fn is_back_edge(&self, from: &str, to: &str) -> bool {
        self.back_edges
            .contains(&(from.to_string(), to.to_string()))
    }

    pub fn back_edges(&self) -> impl Iterator<Item = &(String, String)> {
        self.back_edges.iter()
    }

    /// Forward edges in declaration order of their source.
    pub fn forward_edges(&self) -> Vec<(String, String)> {
        let mut edges = Vec::new();
        for from in &self.order {
            for to in self.successors(from) {
                if !self.is_back_edge(from, to) {
                    edges.push((from.clone(), to.clone()));
                }
            }
        }
        edges
    }

    /// Steps reachable from the roots over forward edges.
    pub fn reachable(&self) -> HashSet<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = self.roots.iter().cloned().collect();
        while let Some(step) = queue.pop_front() {
            if !seen.insert(step.clone()) {
                continue;
            }
            for next in self.successors(&step) {
                if !self.is_back_edge(&step, next) {
                    queue.push_back(next.clone());
                }
            }
        }
        seen
    }

    /// Join edges that can no longer be satisfied once `skipped` is dead.
    ///
    /// Successors with a single predecessor are never created; the walk
    /// continues through them and stops at joins, returning one
    /// `(predecessor, join)` pair per join edge reached.
    pub fn dead_join_edges(&self, skipped: &str) -> Vec<(String, String)> {
        let mut edges = Vec::new();
        let mut visited: HashSet<&str> = HashSet::from([skipped]);
        let mut queue: VecDeque<&str> = VecDeque::from([skipped]);

        while let Some(step) = queue.pop_front() {
            for next in self.successors(step) {
                if self.is_back_edge(step, next) {
                    continue;
                }
                if self.is_join(next) {
                    let edge = (step.to_string(), next.clone());
                    if !edges.contains(&edge) {
                        edges.push(edge);
                    }
                } else if visited.insert(next.as_str()) {
                    queue.push_back(next.as_str());
                }
            }
        }
        edges
    }
}

fn find_roots(order: &[String], successors: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    if order.iter().any(|s| s == START_STEP) {
        return vec![START_STEP.to_string()];
    }
    let targets: HashSet<&String> = successors.values().flatten().collect();
    let roots: Vec<String> = order
        .iter()
        .filter(|s| !targets.contains(s))
        .cloned()
        .collect();
    if roots.is_empty() {
        order.first().cloned().into_iter().collect()
    } else {
        roots
    }
}

fn find_back_edges(
    order: &[String],
    roots: &[String],
    successors: &BTreeMap<String, Vec<String>>,
) -> BTreeSet<(String, String)> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    fn visit(
        step: &str,
        successors: &BTreeMap<String, Vec<String>>,
        marks: &mut BTreeMap<String, Mark>,
        back: &mut BTreeSet<(String, String)>,
    ) {
        marks.insert(step.to_string(), Mark::OnStack);
        for next in successors.get(step).into_iter().flatten() {
            match marks.get(next.as_str()).copied().unwrap_or(Mark::Unvisited) {
                Mark::OnStack => {
                    back.insert((step.to_string(), next.clone()));
                }
                Mark::Unvisited => visit(next, successors, marks, back),
                Mark::Done => {}
            }
        }
        marks.insert(step.to_string(), Mark::Done);
    }

    let mut marks: BTreeMap<String, Mark> =
        order.iter().map(|s| (s.clone(), Mark::Unvisited)).collect();
    let mut back = BTreeSet::new();
    for start in roots.iter().chain(order.iter()) {
        if marks.get(start.as_str()).copied() == Some(Mark::Unvisited) {
            visit(start, successors, &mut marks, &mut back);
        }
    }
    back
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::parser::parse_playbook;

    fn graph(workflow: &str) -> StepGraph {
        let yaml = format!(
            "apiVersion: noetl.io/v2\nkind: Playbook\nmetadata:\n  name: g\nworkflow:\n{}",
            workflow
        );
        StepGraph::new(&parse_playbook(&yaml).unwrap())
    }

    #[test]
    fn test_diamond_join_arity() {
        let g = graph(
            r#"
  - step: start
    next: [b, c]
  - step: b
    next: d
  - step: c
    next: d
  - step: d
"#,
        );
        assert_eq!(g.roots(), &["start".to_string()]);
        assert_eq!(g.join_arity("d"), 2);
        assert_eq!(g.predecessors("d"), &["b".to_string(), "c".to_string()]);
        assert_eq!(g.join_arity("b"), 1);
        assert!(!g.is_join("start"));
    }

    #[test]
    fn test_back_edge_excluded_from_arity() {
        let g = graph(
            r#"
  - step: start
    next: poll
  - step: poll
    next:
      - step: poll
        when: "{{ not result.done }}"
      - step: finish
        when: "{{ result.done }}"
  - step: finish
"#,
        );
        assert!(g.is_back_edge("poll", "poll"));
        assert_eq!(g.join_arity("poll"), 1);
        assert_eq!(g.forward_edges().len(), 2);
    }

    #[test]
    fn test_roots_without_start() {
        let g = graph(
            r#"
  - step: a
    next: c
  - step: b
    next: c
  - step: c
"#,
        );
        assert_eq!(g.roots(), &["a".to_string(), "b".to_string()]);
        assert!(g.is_join("c"));
    }

    #[test]
    fn test_dead_join_edges_walk_through_chains() {
        let g = graph(
            r#"
  - step: start
    next: [b, d]
  - step: b
    next: c
  - step: c
    next: d
  - step: d
"#,
        );
        assert_eq!(
            g.dead_join_edges("b"),
            vec![("c".to_string(), "d".to_string())]
        );
        assert!(graph("  - step: start\n    next: x\n  - step: x\n").dead_join_edges("start").is_empty());
    }
}
