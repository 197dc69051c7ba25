//! Offline projected schedule.
//!
//! List scheduling over whole milliseconds: every edge is assumed taken,
//! back edges are dropped, and a step starts once all nodes of all its
//! predecessors have finished and its pools have room. Nothing here touches
//! the event log.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::engine::TransitionEvaluator;
use crate::error::{AppError, AppResult};
use crate::playbook::{Playbook, StepGraph};
use crate::scheduler::admission::PoolLedger;
use crate::scheduler::pools::{PoolCapacity, PoolSet};
use crate::template::Context;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedNode {
    /// `step` or `step/<iteration>`.
    pub id: String,
    pub step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration_index: Option<usize>,
    pub pools: Vec<String>,
    pub start_ms: u64,
    pub end_ms: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedSchedule {
    pub playbook: String,
    pub nodes: Vec<PlannedNode>,
    pub edges: Vec<PlannedEdge>,
    pub capacities: BTreeMap<String, PoolCapacity>,
    pub makespan_ms: u64,
    pub ignored_back_edges: Vec<PlannedEdge>,
    pub unreachable: Vec<String>,
}

struct SimNode {
    id: String,
    step: String,
    iteration_index: Option<usize>,
    pools: Vec<String>,
    duration_ms: u64,
    declaration_index: usize,
    ready_at: Option<u64>,
    start_ms: Option<u64>,
    end_ms: Option<u64>,
}

/// Project a schedule for `playbook` under the given capacity overrides.
pub fn plan_schedule(
    playbook: &Playbook,
    overrides: &BTreeMap<String, i64>,
    evaluator: &TransitionEvaluator,
) -> AppResult<ProjectedSchedule> {
    let pools = PoolSet::from_declarations(&playbook.resources, overrides)?;
    pools.validate_requirements(playbook)?;

    let graph = StepGraph::new(playbook);
    let reachable = graph.reachable();

    let mut workload_context: Context = playbook.workload.clone();
    workload_context.insert(
        "workload".to_string(),
        Value::Object(playbook.workload.clone()),
    );

    let mut nodes: Vec<SimNode> = Vec::new();
    let mut nodes_of: HashMap<String, Vec<usize>> = HashMap::new();
    for (declaration_index, step) in playbook.workflow.iter().enumerate() {
        if !reachable.contains(&step.step) {
            continue;
        }
        let duration_ms = step
            .estimated_duration_ms
            .unwrap_or_else(|| step.tool.kind().default_duration_ms());
        let step_pools = step.requested_pools(&playbook.resources);

        let iterations = step
            .r#loop
            .as_ref()
            .and_then(|lp| evaluator.evaluate_loop(lp, &workload_context).ok())
            .map(|items| items.len());

        let mut make = |id: String, iteration_index: Option<usize>, duration_ms: u64| {
            nodes_of.entry(step.step.clone()).or_default().push(nodes.len());
            nodes.push(SimNode {
                id,
                step: step.step.clone(),
                iteration_index,
                pools: step_pools.clone(),
                duration_ms,
                declaration_index,
                ready_at: None,
                start_ms: None,
                end_ms: None,
            });
        };

        match iterations {
            Some(0) => make(step.step.clone(), None, 0),
            Some(count) => {
                for i in 0..count {
                    make(format!("{}/{}", step.step, i), Some(i), duration_ms);
                }
            }
            None => make(step.step.clone(), None, duration_ms),
        }
    }

    let edges: Vec<PlannedEdge> = graph
        .forward_edges()
        .into_iter()
        .filter(|(from, to)| reachable.contains(from) && reachable.contains(to))
        .map(|(from, to)| PlannedEdge { from, to })
        .collect();

    let mut waiting_on: HashMap<String, usize> = HashMap::new();
    for edge in &edges {
        *waiting_on.entry(edge.to.clone()).or_insert(0) += 1;
    }
    for (step, indexes) in &nodes_of {
        if waiting_on.get(step).copied().unwrap_or(0) == 0 {
            for &i in indexes {
                nodes[i].ready_at = Some(0);
            }
        }
    }
    let mut remaining_nodes: HashMap<String, usize> =
        nodes_of.iter().map(|(s, n)| (s.clone(), n.len())).collect();

    let mut ledger = PoolLedger::new(&pools);
    let mut running: Vec<usize> = Vec::new();
    let mut now: u64 = 0;

    loop {
        let mut progressed = false;

        // Finish everything due at `now`.
        let (done, still): (Vec<usize>, Vec<usize>) = running
            .iter()
            .copied()
            .partition(|&i| nodes[i].end_ms.is_some_and(|end| end <= now));
        running = still;
        for i in done {
            progressed = true;
            let pools_held: Vec<String> = nodes[i].pools.clone();
            release(&mut ledger, &pools_held);

            let step = nodes[i].step.clone();
            let left = remaining_nodes.entry(step.clone()).or_insert(1);
            *left -= 1;
            if *left == 0 {
                for next in edges.iter().filter(|e| e.from == step).map(|e| e.to.clone()) {
                    let count = waiting_on.entry(next.clone()).or_insert(1);
                    *count -= 1;
                    if *count == 0 {
                        for &j in nodes_of.get(&next).into_iter().flatten() {
                            nodes[j].ready_at = Some(now);
                        }
                    }
                }
            }
        }

        // Start ready nodes in order.
        let mut ready: Vec<usize> = (0..nodes.len())
            .filter(|&i| nodes[i].start_ms.is_none() && nodes[i].ready_at.is_some_and(|t| t <= now))
            .collect();
        ready.sort_by_key(|&i| (nodes[i].ready_at, nodes[i].declaration_index, nodes[i].iteration_index));
        for i in ready {
            if ledger.has_room(&nodes[i].pools) {
                ledger.acquire(&nodes[i].pools);
                nodes[i].start_ms = Some(now);
                nodes[i].end_ms = Some(now + nodes[i].duration_ms);
                running.push(i);
                progressed = true;
            }
        }

        if progressed {
            continue;
        }

        match running.iter().filter_map(|&i| nodes[i].end_ms).min() {
            Some(next) => now = next,
            None => break,
        }
    }

    if let Some(stuck) = nodes.iter().find(|n| n.start_ms.is_none()) {
        return Err(AppError::CapacityDeadlock(format!(
            "node '{}' can never be scheduled",
            stuck.id
        )));
    }

    let mut planned: Vec<PlannedNode> = nodes
        .into_iter()
        .map(|n| {
            let start_ms = n.start_ms.unwrap_or(0);
            PlannedNode {
                id: n.id,
                step: n.step,
                iteration_index: n.iteration_index,
                pools: n.pools,
                start_ms,
                end_ms: n.end_ms.unwrap_or(start_ms),
                duration_ms: n.duration_ms,
            }
        })
        .collect();
    planned.sort_by(|a, b| (a.start_ms, &a.id).cmp(&(b.start_ms, &b.id)));

    let makespan_ms = planned.iter().map(|n| n.end_ms).max().unwrap_or(0);
    let id = playbook.id();
    debug!(playbook = %id, nodes = planned.len(), makespan_ms, "Projected schedule");

    Ok(ProjectedSchedule {
        playbook: id.to_string(),
        nodes: planned,
        edges,
        capacities: pools.capacities(),
        makespan_ms,
        ignored_back_edges: graph
            .back_edges()
            .map(|(from, to)| PlannedEdge {
                from: from.clone(),
                to: to.clone(),
            })
            .collect(),
        unreachable: playbook
            .step_names()
            .into_iter()
            .filter(|s| !reachable.contains(*s))
            .map(str::to_string)
            .collect(),
    })
}

fn release(ledger: &mut PoolLedger, pools: &[String]) {
    let mut usage = BTreeMap::new();
    for pool in pools {
        *usage.entry(pool.clone()).or_insert(0) -= 1;
    }
    ledger.record(&usage);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::parse_playbook;

    const ETL: &str = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: etl
workload:
  cities: [a, b, c]
resources:
  - name: http_pool
    capacity: 2
  - name: duckdb_host
    capacity: 1
    mode: exclusive
workflow:
  - step: start
    next: [fetch, load]
  - step: fetch
    tool:
      kind: http
      url: "https://example.com/{{ city }}"
    loop:
      in: "{{ workload.cities }}"
      iterator: city
    next: merge
  - step: load
    tool:
      kind: duckdb
      query: select 1
    next: merge
  - step: merge
    tool:
      kind: duckdb
      query: select 2
    next:
      - step: merge
        when: "{{ false }}"
  - step: orphan
"#;

    #[test]
    fn test_plan_schedule_respects_capacity() {
        let playbook = parse_playbook(ETL).unwrap();
        let schedule = plan_schedule(&playbook, &BTreeMap::new(), &TransitionEvaluator::new()).unwrap();

        let node = |id: &str| schedule.nodes.iter().find(|n| n.id == id).unwrap().clone();
        assert_eq!(node("start").end_ms, 0);
        assert_eq!(node("fetch/0").start_ms, 0);
        assert_eq!(node("fetch/1").start_ms, 0);
        assert_eq!(node("fetch/2").start_ms, 1000);
        assert_eq!(node("load").start_ms, 0);
        assert_eq!(node("merge").start_ms, 3000);
        assert_eq!(schedule.makespan_ms, 6000);

        assert_eq!(schedule.unreachable, vec!["orphan"]);
        assert_eq!(
            schedule.ignored_back_edges,
            vec![PlannedEdge {
                from: "merge".to_string(),
                to: "merge".to_string()
            }]
        );
    }

    #[test]
    fn test_overrides_change_plan() {
        let playbook = parse_playbook(ETL).unwrap();
        let overrides = BTreeMap::from([("http_pool".to_string(), 3)]);
        let schedule = plan_schedule(&playbook, &overrides, &TransitionEvaluator::new()).unwrap();
        assert!(schedule
            .nodes
            .iter()
            .filter(|n| n.step == "fetch")
            .all(|n| n.start_ms == 0));
        assert_eq!(schedule.capacities["http_pool"].capacity, 3);
    }

    #[test]
    fn test_invalid_pool_fails_plan() {
        let yaml = ETL.replace("    capacity: 1\n    mode: exclusive", "    capacity: 2\n    mode: exclusive");
        let playbook = parse_playbook(&yaml).unwrap();
        let err = plan_schedule(&playbook, &BTreeMap::new(), &TransitionEvaluator::new()).unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
    }
}
