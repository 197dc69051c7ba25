//! Workflow execution engine.
//!
//! - **State**: the `ExecutionInstance` projection folded from events
//! - **Machine**: decisions that turn a projection into the next event
//! - **Evaluator**: guards, iterators and transition rules
//! - **Retry**: attempt accounting and backoff

pub mod context;
pub mod evaluator;
pub mod machine;
pub mod retry;
pub mod state;

pub use context::{deep_merge, merge_workload};
pub use evaluator::{RuleDecision, TransitionEvaluator};
pub use machine::{Decision, StateMachine, StepOutcome};
pub use retry::RetryDecision;
pub use state::{Activation, ExecutionInstance, StepInstance, StepState, TokenRecord};
