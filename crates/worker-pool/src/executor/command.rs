//! Command executor.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::{Duration, Instant};

use noetl_engine::dispatch::{CommandMessage, ResultMessage};
use noetl_engine::playbook::ToolSpec;

use crate::error::ToolError;
use crate::executor::shell::{self, ShellRun};

/// Environment variable carrying the rendered step args as JSON.
pub const ARGS_ENV: &str = "NOETL_ARGS";

/// Environment variable carrying resolved credentials as JSON.
pub const CREDENTIALS_ENV: &str = "NOETL_CREDENTIALS";

/// Runs the tool of a command; one `match` over the closed tool set.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    shell: String,
    default_timeout: Duration,
}

impl CommandExecutor {
    pub fn new(shell: impl Into<String>, default_timeout: Duration) -> Self {
        Self {
            shell: shell.into(),
            default_timeout,
        }
    }

    /// Execute a command and return the tool result.
    pub async fn execute(&self, command: &CommandMessage) -> Result<Value, ToolError> {
        tracing::debug!(
            execution_id = %command.execution_id,
            step = %command.step_name,
            step_instance_id = command.step_instance_id,
            attempt = command.attempt,
            tool = %command.tool.kind(),
            "Executing tool"
        );

        match &command.tool {
            ToolSpec::Noop => Ok(Value::Object(command.args.clone())),
            ToolSpec::Shell { command: script, cwd, env } => {
                let mut env = env.clone();
                env.insert(ARGS_ENV.to_string(), serde_json::to_string(&command.args)?);
                if !command.credentials.is_empty() {
                    env.insert(
                        CREDENTIALS_ENV.to_string(),
                        serde_json::to_string(&command.credentials)?,
                    );
                }
                shell::run(ShellRun {
                    shell: &self.shell,
                    command: script,
                    cwd: cwd.as_deref(),
                    env,
                    timeout: self.timeout_for(command, Utc::now()),
                })
                .await
            }
            other => Err(ToolError::NoAdapter(other.kind().to_string())),
        }
    }

    /// Execute and wrap the outcome in a result message.
    pub async fn run(&self, command: &CommandMessage) -> ResultMessage {
        let start = Instant::now();
        let outcome = self.execute(command).await;
        self.report(command, outcome, start)
    }

    /// Turn an outcome into a result message for `command`.
    pub fn report(
        &self,
        command: &CommandMessage,
        outcome: Result<Value, ToolError>,
        start: Instant,
    ) -> ResultMessage {
        let duration_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(result) => ResultMessage::success(command, result, duration_ms),
            Err(e) => {
                tracing::warn!(
                    execution_id = %command.execution_id,
                    step = %command.step_name,
                    attempt = command.attempt,
                    error = %e,
                    "Command failed"
                );
                ResultMessage::failure(command, e.kind(), e.to_string(), duration_ms)
            }
        }
    }

    /// Time left until the attempt deadline, or the default limit.
    pub fn timeout_for(&self, command: &CommandMessage, now: DateTime<Utc>) -> Duration {
        match command.deadline {
            Some(deadline) => (deadline - now).to_std().unwrap_or(Duration::ZERO),
            None => self.default_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use noetl_engine::dispatch::ResultStatus;
    use noetl_engine::ErrorKind;
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn command(tool: ToolSpec) -> CommandMessage {
        let mut args = serde_json::Map::new();
        args.insert("page".to_string(), json!(2));
        CommandMessage {
            execution_id: Uuid::new_v4(),
            step_instance_id: 4,
            step_name: "load".to_string(),
            iteration_index: None,
            tool,
            args,
            credentials: BTreeMap::new(),
            attempt: 1,
            deadline: None,
        }
    }

    fn executor() -> CommandExecutor {
        CommandExecutor::new("sh", Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_noop_echoes_args() {
        let result = executor().execute(&command(ToolSpec::Noop)).await.unwrap();
        assert_eq!(result, json!({"page": 2}));
    }

    #[tokio::test]
    async fn test_shell_sees_args() {
        let cmd = command(ToolSpec::Shell {
            command: "printf '%s' \"$NOETL_ARGS\"".to_string(),
            cwd: None,
            env: BTreeMap::new(),
        });
        let result = executor().execute(&cmd).await.unwrap();
        assert_eq!(result["data"], json!({"page": 2}));
    }

    #[tokio::test]
    async fn test_unsupported_kind_is_permanent() {
        let cmd = command(ToolSpec::Duckdb {
            query: "select 1".to_string(),
            database: None,
        });
        let message = executor().run(&cmd).await;
        assert_eq!(message.status, ResultStatus::Failure);
        let error = message.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Permanent);
        assert!(error.message.contains("duckdb"));
    }

    #[test]
    fn test_timeout_from_deadline() {
        let now = Utc::now();
        let mut cmd = command(ToolSpec::Noop);
        assert_eq!(executor().timeout_for(&cmd, now), Duration::from_secs(10));

        cmd.deadline = Some(now + chrono::Duration::seconds(3));
        assert_eq!(executor().timeout_for(&cmd, now), Duration::from_secs(3));

        cmd.deadline = Some(now - chrono::Duration::seconds(3));
        assert_eq!(executor().timeout_for(&cmd, now), Duration::ZERO);
    }
}
