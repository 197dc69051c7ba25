//! Event model for execution event sourcing.
//!
//! Every state change of an execution is one of these events. The projection
//! in `engine::state` is derived from them and nothing else.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ErrorKind, StepError};
use crate::sanitize::Redactor;

/// Execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Aggregate outcome of an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationOutcome {
    Succeeded,
    Failed,
    Skipped,
}

/// Marker that enables one step activation.
///
/// A dead token (`live == false`) carries no data; it only tells a join
/// that the edge it travelled will never deliver a live token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub token_id: u64,

    /// Step this token enables.
    pub target: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_index: Option<usize>,

    #[serde(default)]
    pub context: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_token_id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_step: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_activation: Option<u64>,

    pub live: bool,
}

/// Instance created by an activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSeed {
    pub step_instance_id: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_index: Option<usize>,

    /// Iterator element bound to this instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Value>,
}

/// Event payload; the `type` tag names the event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    ExecutionStarted {
        path: String,
        version: String,
        workload: Map<String, Value>,
        tokens: Vec<Token>,
    },

    /// A step fired for one token or one satisfied join.
    ///
    /// With `skip_reason` every instance starts skipped. With `error` the
    /// activation failed before any instance existed. With neither and no
    /// instances it is an empty iteration and succeeds with `[]`.
    ActivationCreated {
        activation_id: u64,
        step_name: String,
        consumed_tokens: Vec<u64>,
        context: Map<String, Value>,
        instances: Vec<InstanceSeed>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skip_reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<StepError>,
    },

    StepScheduled {
        attempt: u32,
        pools: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline: Option<DateTime<Utc>>,
    },

    StepStarted {
        attempt: u32,
        worker_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline: Option<DateTime<Utc>>,
    },

    StepSucceeded {
        attempt: u32,
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },

    StepRetrying {
        attempt: u32,
        error: StepError,
        next_eligible_at: DateTime<Utc>,
    },

    StepFailed {
        attempt: u32,
        error: StepError,
    },

    StepSkipped {
        reason: String,
    },

    /// A result for a superseded attempt or a cancelled execution.
    LateResultRecorded {
        attempt: u32,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_kind: Option<ErrorKind>,
    },

    TransitionsEvaluated {
        activation_id: u64,
        outcome: ActivationOutcome,
        tokens: Vec<Token>,
    },

    ExecutionCancelled {
        reason: String,
    },

    ExecutionCompleted {
        status: ExecutionStatus,
        failed_steps: Vec<String>,
    },
}

impl EventPayload {
    pub fn kind_name(&self) -> &'static str {
        match self {
            EventPayload::ExecutionStarted { .. } => "execution_started",
            EventPayload::ActivationCreated { .. } => "activation_created",
            EventPayload::StepScheduled { .. } => "step_scheduled",
            EventPayload::StepStarted { .. } => "step_started",
            EventPayload::StepSucceeded { .. } => "step_succeeded",
            EventPayload::StepRetrying { .. } => "step_retrying",
            EventPayload::StepFailed { .. } => "step_failed",
            EventPayload::StepSkipped { .. } => "step_skipped",
            EventPayload::LateResultRecorded { .. } => "late_result_recorded",
            EventPayload::TransitionsEvaluated { .. } => "transitions_evaluated",
            EventPayload::ExecutionCancelled { .. } => "execution_cancelled",
            EventPayload::ExecutionCompleted { .. } => "execution_completed",
        }
    }

    /// Redact user data in place. Structural fields (ids, names, states)
    /// are left alone.
    pub fn redact(&mut self, redactor: &Redactor) {
        let redact_map = |map: &mut Map<String, Value>| {
            if let Value::Object(clean) = redactor.redact(&Value::Object(std::mem::take(map))) {
                *map = clean;
            }
        };

        match self {
            EventPayload::ExecutionStarted {
                workload, tokens, ..
            } => {
                redact_map(workload);
                tokens.iter_mut().for_each(|t| redact_map(&mut t.context));
            }
            EventPayload::ActivationCreated {
                context,
                instances,
                skip_reason,
                error,
                ..
            } => {
                redact_map(context);
                for seed in instances.iter_mut() {
                    if let Some(item) = seed.item.as_mut() {
                        *item = redactor.redact(item);
                    }
                }
                if let Some(reason) = skip_reason.as_mut() {
                    *reason = redactor.redact_text(reason);
                }
                if let Some(error) = error.as_mut() {
                    error.message = redactor.redact_text(&error.message);
                }
            }
            EventPayload::StepSucceeded { result, .. } => {
                *result = redactor.redact(result);
            }
            EventPayload::StepRetrying { error, .. } | EventPayload::StepFailed { error, .. } => {
                error.message = redactor.redact_text(&error.message);
            }
            EventPayload::StepSkipped { reason } | EventPayload::ExecutionCancelled { reason } => {
                *reason = redactor.redact_text(reason);
            }
            EventPayload::TransitionsEvaluated { tokens, .. } => {
                tokens.iter_mut().for_each(|t| redact_map(&mut t.context));
            }
            EventPayload::StepScheduled { .. }
            | EventPayload::StepStarted { .. }
            | EventPayload::LateResultRecorded { .. }
            | EventPayload::ExecutionCompleted { .. } => {}
        }
    }
}

/// One entry of an execution's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the execution's log, starting at 1.
    pub event_id: u64,
    pub execution_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_instance_id: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(
        event_id: u64,
        execution_id: Uuid,
        step_instance_id: Option<u64>,
        timestamp: DateTime<Utc>,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id,
            execution_id,
            step_instance_id,
            timestamp,
            payload,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        self.payload.kind_name()
    }
}

/// A page of events returned by paginated queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<Event>,
    /// Pass as `after` to fetch the next page; `None` when exhausted.
    pub next_after: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_tagging() {
        let payload = EventPayload::StepSkipped {
            reason: "when_false".to_string(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], "step_skipped");
        assert_eq!(payload.kind_name(), "step_skipped");

        let back: EventPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_redact_touches_only_user_data() {
        let redactor = Redactor::new();
        let mut payload = EventPayload::StepSucceeded {
            attempt: 1,
            result: json!({"rows": 3, "password": "hunter2"}),
            duration_ms: Some(12),
        };
        payload.redact(&redactor);
        match payload {
            EventPayload::StepSucceeded { attempt, result, .. } => {
                assert_eq!(attempt, 1);
                assert_eq!(result["rows"], 3);
                assert_eq!(result["password"], "<redacted:password>");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_redact_error_message() {
        let redactor = Redactor::new();
        let mut payload = EventPayload::StepFailed {
            attempt: 2,
            error: StepError::new(ErrorKind::Permanent, "Bearer abc.def"),
        };
        payload.redact(&redactor);
        match payload {
            EventPayload::StepFailed { error, .. } => {
                assert_eq!(error.kind, ErrorKind::Permanent);
                assert_eq!(error.message, "<redacted:pattern>");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
