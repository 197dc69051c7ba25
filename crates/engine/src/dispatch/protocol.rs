//! Wire protocol between the coordinator and workers.
//!
//! All messages are JSON. Commands go out on `noetl.commands.<tool_kind>`;
//! workers answer on `noetl.acks` and `noetl.results`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::credentials::ResolvedCredential;
use crate::error::{ErrorKind, StepError};
use crate::playbook::ToolSpec;

/// JetStream stream holding command messages.
pub const COMMAND_STREAM: &str = "noetl_commands";

/// JetStream stream holding acks, results and triggers.
pub const RESULT_STREAM: &str = "noetl_results";

/// Prefix of per-kind command subjects.
pub const COMMAND_SUBJECT_PREFIX: &str = "noetl.commands";

pub const ACK_SUBJECT: &str = "noetl.acks";
pub const RESULT_SUBJECT: &str = "noetl.results";
pub const CANCEL_SUBJECT: &str = "noetl.cancel";
pub const TRIGGER_SUBJECT: &str = "noetl.triggers";

/// `noetl.commands.<kind>`
pub fn command_subject(tool: &ToolSpec) -> String {
    format!("{}.{}", COMMAND_SUBJECT_PREFIX, tool.kind())
}

/// One attempt of one step instance, ready to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    pub execution_id: Uuid,
    pub step_instance_id: u64,
    pub step_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_index: Option<usize>,
    /// Tool descriptor with templates rendered.
    pub tool: ToolSpec,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Alias to credential material.
    #[serde(default)]
    pub credentials: BTreeMap<String, Value>,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl CommandMessage {
    /// Deduplication id: the same attempt is published at most once per
    /// JetStream duplicate window.
    pub fn message_id(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.execution_id, self.step_name, self.step_instance_id, self.attempt
        )
    }

    pub fn credentials_from(resolved: &BTreeMap<String, ResolvedCredential>) -> BTreeMap<String, Value> {
        resolved
            .iter()
            .map(|(alias, c)| (alias.clone(), c.material.expose().clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckMessage {
    pub execution_id: Uuid,
    pub step_instance_id: u64,
    pub attempt: u32,
    pub worker_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<WireError> for StepError {
    fn from(e: WireError) -> Self {
        StepError::new(e.kind, e.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub execution_id: Uuid,
    pub step_instance_id: u64,
    pub attempt: u32,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<Value>,
}

impl ResultMessage {
    pub fn success(command: &CommandMessage, result: Value, duration_ms: u64) -> Self {
        Self {
            execution_id: command.execution_id,
            step_instance_id: command.step_instance_id,
            attempt: command.attempt,
            status: ResultStatus::Success,
            result: Some(result),
            error: None,
            duration_ms: Some(duration_ms),
            resource_usage: None,
        }
    }

    pub fn failure(command: &CommandMessage, kind: ErrorKind, message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            execution_id: command.execution_id,
            step_instance_id: command.step_instance_id,
            attempt: command.attempt,
            status: ResultStatus::Failure,
            result: None,
            error: Some(WireError {
                kind,
                message: message.into(),
            }),
            duration_ms: Some(duration_ms),
            resource_usage: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelMessage {
    pub execution_id: Uuid,
    pub step_instance_ids: Vec<u64>,
}

/// Request to start an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMessage {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_subject_and_id() {
        let command = CommandMessage {
            execution_id: Uuid::nil(),
            step_instance_id: 4,
            step_name: "load".to_string(),
            iteration_index: None,
            tool: ToolSpec::Postgres {
                query: "select 1".to_string(),
                connection: None,
            },
            args: Map::new(),
            credentials: BTreeMap::new(),
            attempt: 2,
            deadline: None,
        };
        assert_eq!(command_subject(&command.tool), "noetl.commands.postgres");
        assert_eq!(
            command.message_id(),
            "00000000-0000-0000-0000-000000000000:load:4:2"
        );
    }

    #[test]
    fn test_result_with_unknown_error_kind() {
        let message: ResultMessage = serde_json::from_value(json!({
            "execution_id": Uuid::nil(),
            "step_instance_id": 1,
            "attempt": 1,
            "status": "failure",
            "error": {"kind": "disk_on_fire", "message": "no"}
        }))
        .unwrap();
        assert_eq!(message.error.unwrap().kind, ErrorKind::Permanent);
    }
}
