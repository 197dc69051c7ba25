//! Command publisher backed by JetStream.

use async_nats::jetstream::{self, Context};
use async_trait::async_trait;

use crate::dispatch::protocol::{
    command_subject, CancelMessage, CommandMessage, CANCEL_SUBJECT, COMMAND_SUBJECT_PREFIX,
};
use crate::dispatch::CommandPublisher;
use crate::error::{AppError, AppResult};
use crate::nats::{ensure_stream, publish_json};

/// Publishes commands to `noetl.commands.<kind>` and cancels to
/// `noetl.cancel`.
#[derive(Clone)]
pub struct NatsCommandPublisher {
    client: async_nats::Client,
    js: Context,
}

impl NatsCommandPublisher {
    /// Wrap a connected client; creates the command stream when missing.
    pub async fn new(client: async_nats::Client, command_stream: &str) -> AppResult<Self> {
        let js = jetstream::new(client.clone());
        let subjects = format!("{}.>", COMMAND_SUBJECT_PREFIX);
        ensure_stream(
            &js,
            command_stream,
            &[subjects.as_str()],
            jetstream::stream::RetentionPolicy::WorkQueue,
        )
        .await?;

        Ok(Self { client, js })
    }
}

#[async_trait]
impl CommandPublisher for NatsCommandPublisher {
    async fn publish_command(&self, command: &CommandMessage) -> AppResult<()> {
        let subject = command_subject(&command.tool);
        let message_id = command.message_id();
        publish_json(&self.js, subject.clone(), Some(&message_id), command).await?;

        tracing::debug!(
            subject = %subject,
            message_id = %message_id,
            execution_id = %command.execution_id,
            "Published command"
        );
        Ok(())
    }

    async fn publish_cancel(&self, cancel: &CancelMessage) -> AppResult<()> {
        let payload = serde_json::to_vec(cancel)?;
        self.client
            .publish(CANCEL_SUBJECT, payload.into())
            .await
            .map_err(|e| AppError::Nats(e.to_string()))?;
        self.client
            .flush()
            .await
            .map_err(|e| AppError::Nats(e.to_string()))?;
        Ok(())
    }
}
