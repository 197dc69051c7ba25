//! Capacity-aware scheduling.
//!
//! `plan` admits ready steps online against the pool ledger derived from
//! the event logs; `plan_schedule` projects a whole playbook offline.

pub mod admission;
pub mod planner;
pub mod pools;

pub use admission::{plan, DispatchOrder, PoolLedger, PoolUsage, ReadyStep};
pub use planner::{plan_schedule, PlannedEdge, PlannedNode, ProjectedSchedule};
pub use pools::{PoolCapacity, PoolSet};
