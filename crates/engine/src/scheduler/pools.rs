//! Resource pool declarations and plan-time validation.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{AppError, AppResult};
use crate::playbook::{Playbook, PoolMode, ResourceDecl};

/// Validated capacity of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolCapacity {
    pub capacity: i64,
    pub mode: PoolMode,
}

/// Every pool known to the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolSet {
    pools: BTreeMap<String, PoolCapacity>,
    #[serde(skip)]
    overrides: BTreeMap<String, i64>,
    /// Pools some playbook has declared.
    #[serde(skip)]
    declared: BTreeSet<String>,
}

fn check(name: &str, capacity: PoolCapacity) -> AppResult<()> {
    if capacity.capacity < 1 {
        return Err(AppError::Configuration(format!(
            "pool '{}' capacity must be at least 1, got {}",
            name, capacity.capacity
        )));
    }
    if capacity.mode == PoolMode::Exclusive && capacity.capacity != 1 {
        return Err(AppError::Configuration(format!(
            "exclusive pool '{}' must have capacity 1, got {}",
            name, capacity.capacity
        )));
    }
    Ok(())
}

impl PoolSet {
    /// Pools from deployment overrides only; each is a shared pool.
    pub fn with_overrides(overrides: &BTreeMap<String, i64>) -> AppResult<Self> {
        let mut set = Self {
            pools: BTreeMap::new(),
            overrides: overrides.clone(),
            declared: BTreeSet::new(),
        };
        for (name, capacity) in overrides {
            let pool = PoolCapacity {
                capacity: *capacity,
                mode: PoolMode::Shared,
            };
            check(name, pool)?;
            set.pools.insert(name.clone(), pool);
        }
        Ok(set)
    }

    pub fn from_declarations(decls: &[ResourceDecl], overrides: &BTreeMap<String, i64>) -> AppResult<Self> {
        let mut set = Self::with_overrides(overrides)?;
        set.declare(decls)?;
        Ok(set)
    }

    /// Add a playbook's declarations.
    ///
    /// An override replaces a declared capacity. Two playbooks declaring the
    /// same pool differently is a configuration error.
    pub fn declare(&mut self, decls: &[ResourceDecl]) -> AppResult<()> {
        let mut staged = BTreeMap::new();
        for decl in decls {
            let pool = PoolCapacity {
                capacity: self.overrides.get(&decl.name).copied().unwrap_or(decl.capacity),
                mode: decl.mode,
            };
            check(&decl.name, pool)?;

            if self.declared.contains(&decl.name) {
                if let Some(existing) = self.pools.get(&decl.name) {
                    if *existing != pool {
                        return Err(AppError::Configuration(format!(
                            "pool '{}' declared as {:?}/{} conflicts with {:?}/{}",
                            decl.name, pool.mode, pool.capacity, existing.mode, existing.capacity
                        )));
                    }
                }
            }
            staged.insert(decl.name.clone(), pool);
        }
        self.declared.extend(staged.keys().cloned());
        self.pools.extend(staged);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<PoolCapacity> {
        self.pools.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PoolCapacity)> {
        self.pools.iter()
    }

    pub fn capacities(&self) -> BTreeMap<String, PoolCapacity> {
        self.pools.clone()
    }

    /// Every pool a step can request must exist, or the step could never be
    /// admitted.
    pub fn validate_requirements(&self, playbook: &Playbook) -> AppResult<()> {
        for step in &playbook.workflow {
            for pool in step.requested_pools(&playbook.resources) {
                if !self.pools.contains_key(&pool) {
                    return Err(AppError::CapacityDeadlock(format!(
                        "step '{}' requests undeclared pool '{}'",
                        step.step, pool
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(name: &str, capacity: i64, mode: PoolMode) -> ResourceDecl {
        ResourceDecl {
            name: name.to_string(),
            capacity,
            mode,
        }
    }

    #[test]
    fn test_invalid_capacities() {
        let none = BTreeMap::new();
        let err = PoolSet::from_declarations(&[decl("p", 0, PoolMode::Shared)], &none).unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));

        let err =
            PoolSet::from_declarations(&[decl("duck", 2, PoolMode::Exclusive)], &none).unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[test]
    fn test_override_replaces_capacity() {
        let overrides = BTreeMap::from([("http_pool".to_string(), 8), ("gpu".to_string(), 2)]);
        let set =
            PoolSet::from_declarations(&[decl("http_pool", 4, PoolMode::Shared)], &overrides).unwrap();
        assert_eq!(set.get("http_pool").unwrap().capacity, 8);
        assert_eq!(set.get("gpu").unwrap().mode, PoolMode::Shared);
    }

    #[test]
    fn test_conflicting_declarations() {
        let mut set = PoolSet::default();
        set.declare(&[decl("pg_pool", 4, PoolMode::Shared)]).unwrap();
        set.declare(&[decl("pg_pool", 4, PoolMode::Shared)]).unwrap();
        let err = set.declare(&[decl("pg_pool", 2, PoolMode::Shared)]).unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[test]
    fn test_undeclared_pool_is_deadlock() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: p
workflow:
  - step: start
    resources: [gpu]
"#;
        let playbook = crate::playbook::parse_playbook(yaml).unwrap();
        let set = PoolSet::from_declarations(&playbook.resources, &BTreeMap::new()).unwrap();
        let err = set.validate_requirements(&playbook).unwrap_err();
        assert!(matches!(err, AppError::CapacityDeadlock(_)));
    }
}
