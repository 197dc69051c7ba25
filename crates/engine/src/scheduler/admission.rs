//! Online admission: which ready steps may be dispatched now.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::playbook::PoolMode;
use crate::scheduler::pools::PoolSet;

/// A pending step instance waiting for capacity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadyStep {
    pub execution_id: Uuid,
    pub step_instance_id: u64,
    pub step_name: String,
    pub pools: Vec<String>,
    /// Arrival of the token that enabled the step.
    pub arrived_at: DateTime<Utc>,
    pub arrival_event: u64,
    pub declaration_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration_index: Option<usize>,
}

impl ReadyStep {
    fn order_key(&self) -> (DateTime<Utc>, u64, usize, Option<usize>, Uuid, u64) {
        (
            self.arrived_at,
            self.arrival_event,
            self.declaration_index,
            self.iteration_index,
            self.execution_id,
            self.step_instance_id,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolUsage {
    pub capacity: i64,
    pub mode: PoolMode,
    pub in_use: i64,
}

impl PoolUsage {
    fn has_room(&self) -> bool {
        match self.mode {
            PoolMode::Shared => self.in_use < self.capacity,
            PoolMode::Exclusive => self.in_use == 0,
        }
    }
}

/// Capacity in use per pool, derived from execution projections.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolLedger {
    pools: BTreeMap<String, PoolUsage>,
}

impl PoolLedger {
    pub fn new(pools: &PoolSet) -> Self {
        Self {
            pools: pools
                .iter()
                .map(|(name, cap)| {
                    (
                        name.clone(),
                        PoolUsage {
                            capacity: cap.capacity,
                            mode: cap.mode,
                            in_use: 0,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Add usage reported by one execution (see `ExecutionInstance::pools_in_use`).
    pub fn record(&mut self, in_use: &BTreeMap<String, i64>) {
        for (name, count) in in_use {
            if let Some(usage) = self.pools.get_mut(name) {
                usage.in_use += count;
            }
        }
    }

    pub fn usage(&self, pool: &str) -> Option<PoolUsage> {
        self.pools.get(pool).copied()
    }

    pub fn in_use(&self, pool: &str) -> i64 {
        self.pools.get(pool).map_or(0, |u| u.in_use)
    }

    /// Whether every requested pool can take one more holder.
    pub fn has_room(&self, pools: &[String]) -> bool {
        pools
            .iter()
            .all(|p| self.pools.get(p).is_some_and(PoolUsage::has_room))
    }

    pub fn acquire(&mut self, pools: &[String]) {
        for pool in pools {
            if let Some(usage) = self.pools.get_mut(pool) {
                usage.in_use += 1;
            }
        }
    }

    /// Pools whose usage breaks `0 <= in_use <= capacity` (or `<= 1` when
    /// exclusive).
    pub fn violations(&self) -> Vec<String> {
        self.pools
            .iter()
            .filter(|(_, u)| {
                u.in_use < 0
                    || u.in_use > u.capacity
                    || (u.mode == PoolMode::Exclusive && u.in_use > 1)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Outcome of one admission pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchOrder {
    pub admitted: Vec<ReadyStep>,
    pub deferred: Vec<ReadyStep>,
}

/// Greedy admission in arrival order.
///
/// Admissions earlier in the pass count against capacity for later ones.
/// Deferred steps stay pending and are offered again on the next pass.
pub fn plan(mut ready: Vec<ReadyStep>, ledger: &PoolLedger) -> DispatchOrder {
    ready.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

    let mut tentative = ledger.clone();
    let mut order = DispatchOrder::default();
    for step in ready {
        if tentative.has_room(&step.pools) {
            tentative.acquire(&step.pools);
            order.admitted.push(step);
        } else {
            order.deferred.push(step);
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::ResourceDecl;
    use chrono::Duration;

    fn ledger() -> PoolLedger {
        let decls = vec![
            ResourceDecl {
                name: "duckdb_host".to_string(),
                capacity: 1,
                mode: PoolMode::Exclusive,
            },
            ResourceDecl {
                name: "http_pool".to_string(),
                capacity: 2,
                mode: PoolMode::Shared,
            },
        ];
        PoolLedger::new(&PoolSet::from_declarations(&decls, &BTreeMap::new()).unwrap())
    }

    fn ready(name: &str, pools: &[&str], at: DateTime<Utc>, index: usize) -> ReadyStep {
        ReadyStep {
            execution_id: Uuid::nil(),
            step_instance_id: index as u64 + 1,
            step_name: name.to_string(),
            pools: pools.iter().map(|p| p.to_string()).collect(),
            arrived_at: at,
            arrival_event: 1,
            declaration_index: index,
            iteration_index: None,
        }
    }

    #[test]
    fn test_exclusive_pool_serializes() {
        let now = Utc::now();
        let order = plan(
            vec![
                ready("Y", &["duckdb_host"], now, 1),
                ready("X", &["duckdb_host"], now, 0),
            ],
            &ledger(),
        );
        assert_eq!(order.admitted.len(), 1);
        assert_eq!(order.admitted[0].step_name, "X");
        assert_eq!(order.deferred[0].step_name, "Y");
    }

    #[test]
    fn test_shared_capacity_counts_current_use() {
        let now = Utc::now();
        let mut ledger = ledger();
        ledger.record(&BTreeMap::from([("http_pool".to_string(), 1)]));

        let order = plan(
            vec![
                ready("a", &["http_pool"], now + Duration::milliseconds(5), 0),
                ready("b", &["http_pool"], now, 1),
                ready("c", &[], now, 2),
            ],
            &ledger,
        );
        let admitted: Vec<&str> = order.admitted.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(admitted, vec!["b", "c"]);
        assert_eq!(order.deferred[0].step_name, "a");
    }

    #[test]
    fn test_unknown_pool_never_admitted() {
        let order = plan(vec![ready("z", &["gpu"], Utc::now(), 0)], &ledger());
        assert!(order.admitted.is_empty());
    }

    #[test]
    fn test_violations() {
        let mut ledger = ledger();
        assert!(ledger.violations().is_empty());
        ledger.acquire(&["duckdb_host".to_string(), "duckdb_host".to_string()]);
        assert_eq!(ledger.violations(), vec!["duckdb_host"]);
    }
}
