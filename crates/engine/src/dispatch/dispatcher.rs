//! Turning a scheduled step instance into a command on the bus.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::credentials::CredentialResolver;
use crate::dispatch::protocol::{CancelMessage, CommandMessage};
use crate::engine::context::instance_context;
use crate::engine::ExecutionInstance;
use crate::error::{AppError, AppResult, ErrorKind, StepError};
use crate::playbook::{Playbook, ToolSpec};
use crate::sanitize::Redactor;
use crate::template::{Context, TemplateRenderer};

/// Outbound side of the bus.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish_command(&self, command: &CommandMessage) -> AppResult<()>;

    async fn publish_cancel(&self, cancel: &CancelMessage) -> AppResult<()>;
}

/// In-process publisher; the receiving ends play the worker in tests and
/// single-process runs.
pub struct ChannelPublisher {
    commands: mpsc::UnboundedSender<CommandMessage>,
    cancels: mpsc::UnboundedSender<CancelMessage>,
}

impl ChannelPublisher {
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<CommandMessage>,
        mpsc::UnboundedReceiver<CancelMessage>,
    ) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (cancels, cancel_rx) = mpsc::unbounded_channel();
        (Self { commands, cancels }, command_rx, cancel_rx)
    }
}

#[async_trait]
impl CommandPublisher for ChannelPublisher {
    async fn publish_command(&self, command: &CommandMessage) -> AppResult<()> {
        self.commands
            .send(command.clone())
            .map_err(|_| AppError::Nats("command channel closed".to_string()))
    }

    async fn publish_cancel(&self, cancel: &CancelMessage) -> AppResult<()> {
        self.cancels
            .send(cancel.clone())
            .map_err(|_| AppError::Nats("cancel channel closed".to_string()))
    }
}

/// Renders, resolves credentials and publishes one attempt.
pub struct Dispatcher {
    publisher: Arc<dyn CommandPublisher>,
    resolver: CredentialResolver,
    redactor: Arc<Redactor>,
    renderer: TemplateRenderer,
}

impl Dispatcher {
    pub fn new(
        publisher: Arc<dyn CommandPublisher>,
        resolver: CredentialResolver,
        redactor: Arc<Redactor>,
    ) -> Self {
        Self {
            publisher,
            resolver,
            redactor,
            renderer: TemplateRenderer::new(),
        }
    }

    pub fn publisher(&self) -> &Arc<dyn CommandPublisher> {
        &self.publisher
    }

    /// Build the command for the current attempt of a scheduled instance.
    ///
    /// Credential values are registered with the redactor before anything
    /// leaves the process.
    pub async fn prepare(
        &self,
        exec: &ExecutionInstance,
        playbook: &Playbook,
        step_instance_id: u64,
        now: DateTime<Utc>,
    ) -> Result<CommandMessage, StepError> {
        let internal = |e: AppError| StepError::new(ErrorKind::Permanent, e.to_string());
        let instance = exec.instance(step_instance_id).map_err(internal)?;
        let activation = exec.activations.get(&instance.activation_id).ok_or_else(|| {
            StepError::new(
                ErrorKind::Permanent,
                format!("activation {} missing", instance.activation_id),
            )
        })?;
        let step = playbook.get_step(&instance.step_name).ok_or_else(|| {
            StepError::new(
                ErrorKind::Configuration,
                format!("step '{}' not in playbook {}", instance.step_name, playbook.id()),
            )
        })?;

        let iterator = step.r#loop.as_ref().map(|lp| lp.iterator.as_str());
        let mut context = instance_context(exec, activation, instance, iterator);

        let configuration = |e: AppError| StepError::new(ErrorKind::Configuration, e.to_string());
        let mut args = serde_json::Map::new();
        for (key, value) in &step.args {
            args.insert(
                key.clone(),
                self.renderer.render_value(value, &context).map_err(configuration)?,
            );
        }
        context.insert("args".to_string(), Value::Object(args.clone()));

        let tool = render_tool(&step.tool, &context, &self.renderer).map_err(configuration)?;

        let resolved = self
            .resolver
            .resolve_step(step, &context, &self.renderer, now)
            .await
            .map_err(|e| StepError::new(e.kind(), e.to_string()))?;
        for credential in resolved.values() {
            self.redactor
                .register((exec.execution_id, step_instance_id), credential);
        }

        Ok(CommandMessage {
            execution_id: exec.execution_id,
            step_instance_id,
            step_name: instance.step_name.clone(),
            iteration_index: instance.iteration_index,
            tool,
            args,
            credentials: CommandMessage::credentials_from(&resolved),
            attempt: instance.attempt,
            deadline: instance.deadline,
        })
    }

    /// Prepare and publish. Publish failures are transient.
    pub async fn dispatch(
        &self,
        exec: &ExecutionInstance,
        playbook: &Playbook,
        step_instance_id: u64,
        now: DateTime<Utc>,
    ) -> Result<CommandMessage, StepError> {
        let command = self.prepare(exec, playbook, step_instance_id, now).await?;
        self.publish(&command).await?;
        Ok(command)
    }

    pub async fn publish(&self, command: &CommandMessage) -> Result<(), StepError> {
        self.publisher
            .publish_command(command)
            .await
            .map_err(|e| StepError::new(ErrorKind::Transient, e.to_string()))?;
        info!(
            execution_id = %command.execution_id,
            step = %command.step_name,
            step_instance_id = command.step_instance_id,
            attempt = command.attempt,
            "Dispatched command"
        );
        Ok(())
    }

    pub async fn cancel(&self, cancel: &CancelMessage) -> AppResult<()> {
        debug!(execution_id = %cancel.execution_id, instances = cancel.step_instance_ids.len(), "Publishing cancel");
        self.publisher.publish_cancel(cancel).await
    }
}

/// Render every string of a tool descriptor as text, keeping its shape.
fn render_tool(tool: &ToolSpec, context: &Context, renderer: &TemplateRenderer) -> AppResult<ToolSpec> {
    fn walk(value: &Value, context: &Context, renderer: &TemplateRenderer) -> AppResult<Value> {
        Ok(match value {
            Value::String(s) => Value::String(renderer.render(s, context)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| walk(v, context, renderer))
                    .collect::<AppResult<_>>()?,
            ),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), walk(v, context, renderer)?);
                }
                Value::Object(out)
            }
            other => other.clone(),
        })
    }

    let rendered = walk(&serde_json::to_value(tool)?, context, renderer)?;
    Ok(serde_json::from_value(rendered)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialRecord, InMemoryCredentialStore};
    use crate::engine::{Decision, StateMachine, TransitionEvaluator};
    use crate::events::Event;
    use crate::playbook::{parse_playbook, StepGraph};
    use serde_json::json;
    use uuid::Uuid;

    const PLAYBOOK: &str = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: dispatch
workload:
  base: "https://example.com"
workflow:
  - step: fetch
    tool:
      kind: http
      url: "{{ workload.base }}/items/{{ args.page }}"
    args:
      page: "{{ 1 + 1 }}"
    auth: api_key_store
"#;

    fn scheduled(playbook: &Playbook, now: DateTime<Utc>) -> ExecutionInstance {
        let graph = StepGraph::new(playbook);
        let evaluator = TransitionEvaluator::new();
        let machine = StateMachine::new(playbook, &graph, &evaluator);
        let mut exec = ExecutionInstance::new(Uuid::new_v4());
        let apply = |exec: &mut ExecutionInstance, d: Decision| {
            let event = Event::new(exec.next_event_id(), exec.execution_id, d.step_instance_id, now, d.payload);
            exec.apply(&event).unwrap();
        };
        apply(&mut exec, Decision { step_instance_id: None, payload: machine.start(playbook.workload.clone()) });
        while let Some(d) = machine.decide(&exec, now) {
            apply(&mut exec, d);
        }
        let d = machine.schedule(&exec, 1, Vec::new(), now).unwrap();
        apply(&mut exec, d);
        exec
    }

    fn dispatcher(records: Vec<CredentialRecord>) -> (Dispatcher, mpsc::UnboundedReceiver<CommandMessage>, Arc<Redactor>) {
        let (publisher, commands, _cancels) = ChannelPublisher::new();
        let redactor = Arc::new(Redactor::new());
        let resolver = CredentialResolver::new(Arc::new(InMemoryCredentialStore::with_records(records)));
        (
            Dispatcher::new(Arc::new(publisher), resolver, redactor.clone()),
            commands,
            redactor,
        )
    }

    #[tokio::test]
    async fn test_dispatch_renders_and_registers_secrets() {
        let playbook = parse_playbook(PLAYBOOK).unwrap();
        let now = Utc::now();
        let exec = scheduled(&playbook, now);
        let (dispatcher, mut commands, redactor) =
            dispatcher(vec![CredentialRecord::new("api_key_store", json!({"header": "k-123456"}))]);

        let command = dispatcher.dispatch(&exec, &playbook, 1, now).await.unwrap();
        match &command.tool {
            ToolSpec::Http { url, .. } => assert_eq!(url, "https://example.com/items/2"),
            other => panic!("unexpected tool {:?}", other),
        }
        assert_eq!(command.args["page"], json!(2));
        assert_eq!(command.credentials["default"]["header"], "k-123456");
        assert_eq!(command.attempt, 1);

        let published = commands.recv().await.unwrap();
        assert_eq!(published.message_id(), command.message_id());
        assert_eq!(
            redactor.redact(&json!({"echo": "k-123456"}))["echo"],
            "<redacted:api_key_store>"
        );
    }

    #[tokio::test]
    async fn test_missing_credential_fails_with_kind() {
        let playbook = parse_playbook(PLAYBOOK).unwrap();
        let now = Utc::now();
        let exec = scheduled(&playbook, now);
        let (dispatcher, _commands, _redactor) = dispatcher(vec![]);

        let err = dispatcher.dispatch(&exec, &playbook, 1, now).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CredentialNotFound);
    }

    #[tokio::test]
    async fn test_closed_channel_is_transient() {
        let playbook = parse_playbook(PLAYBOOK).unwrap();
        let now = Utc::now();
        let exec = scheduled(&playbook, now);
        let (dispatcher, commands, _redactor) =
            dispatcher(vec![CredentialRecord::new("api_key_store", json!("k"))]);
        drop(commands);

        let err = dispatcher.dispatch(&exec, &playbook, 1, now).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transient);
    }
}
