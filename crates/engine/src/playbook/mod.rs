//! Playbook model.
//!
//! - Type definitions for playbook structure
//! - YAML parsing and reference validation
//! - Static step graph (join arity, back edges)

pub mod graph;
pub mod parser;
pub mod types;

pub use graph::{StepGraph, START_STEP};
pub use parser::{parse_playbook, validate_playbook};
pub use types::{
    Backoff, Loop, Metadata, NextItem, NextSpec, NextTarget, Playbook, PlaybookId, PoolMode,
    ResourceDecl, RetryPolicy, Step, ToolKind, ToolSpec,
};
