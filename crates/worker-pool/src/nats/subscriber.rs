//! Command consumer and cancel subscription.

use async_nats::jetstream::{self, Context};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

use noetl_engine::dispatch::protocol::{CANCEL_SUBJECT, COMMAND_SUBJECT_PREFIX};
use noetl_engine::dispatch::{CancelMessage, CommandMessage};
use noetl_engine::nats::{ensure_stream, subscriber::ack, NatsConsumer};
use noetl_engine::{AppError, AppResult};

use crate::worker::InFlight;

/// Subject filter covering every tool kind.
pub fn command_filter() -> String {
    format!("{}.>", COMMAND_SUBJECT_PREFIX)
}

/// Durable pull consumer of command messages, shared by the pool.
pub struct CommandSource {
    consumer: NatsConsumer,
}

impl CommandSource {
    /// Create the command stream when missing and attach the consumer.
    pub async fn connect(js: &Context, stream: &str, consumer: &str) -> AppResult<Self> {
        let filter = command_filter();
        ensure_stream(
            js,
            stream,
            &[filter.as_str()],
            jetstream::stream::RetentionPolicy::WorkQueue,
        )
        .await?;
        let consumer = NatsConsumer::durable(js, stream, consumer, vec![filter]).await?;
        Ok(Self { consumer })
    }

    /// Receive the next command, waiting at most `wait`.
    ///
    /// The JetStream message is acknowledged on receipt; from then on the
    /// coordinator owns redelivery through attempt deadlines. Payloads that
    /// do not decode are acknowledged and dropped.
    pub async fn receive(&self, wait: Duration) -> AppResult<Option<CommandMessage>> {
        let Some(message) = self.consumer.fetch(1, wait).await?.into_iter().next() else {
            return Ok(None);
        };

        let decoded = decode_command(&message.payload);
        ack(&message).await?;
        match decoded {
            Ok(command) => Ok(Some(command)),
            Err(e) => {
                tracing::warn!(
                    subject = %message.subject,
                    consumer = %self.consumer.name(),
                    error = %e,
                    "Dropping malformed command"
                );
                Ok(None)
            }
        }
    }
}

pub fn decode_command(payload: &[u8]) -> AppResult<CommandMessage> {
    Ok(serde_json::from_slice(payload)?)
}

/// Forward cancel messages to the in-flight registry until the
/// subscription ends.
pub async fn listen_for_cancels(client: async_nats::Client, inflight: Arc<InFlight>) -> AppResult<()> {
    let mut subscriber = client
        .subscribe(CANCEL_SUBJECT)
        .await
        .map_err(|e| AppError::Nats(e.to_string()))?;

    while let Some(message) = subscriber.next().await {
        match serde_json::from_slice::<CancelMessage>(&message.payload) {
            Ok(cancel) => {
                let stopped = inflight.cancel(&cancel);
                if stopped > 0 {
                    tracing::info!(
                        execution_id = %cancel.execution_id,
                        stopped,
                        "Cancelled running commands"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring malformed cancel message"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_filter() {
        assert_eq!(command_filter(), "noetl.commands.>");
    }

    #[test]
    fn test_decode_command() {
        let payload = json!({
            "execution_id": "5f0c6f0e-1c7a-4a57-9a43-0d1f8a3c2b11",
            "step_instance_id": 3,
            "step_name": "extract",
            "tool": {"kind": "shell", "command": "echo ok"},
            "attempt": 2
        });
        let command = decode_command(payload.to_string().as_bytes()).unwrap();
        assert_eq!(command.step_name, "extract");
        assert_eq!(command.attempt, 2);
        assert!(command.args.is_empty());
        assert!(command.deadline.is_none());
    }

    #[test]
    fn test_decode_command_rejects_garbage() {
        assert!(decode_command(b"{\"step_name\": 1}").is_err());
    }
}
