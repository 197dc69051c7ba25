//! Durable pull consumers and inbound message decoding.

use async_nats::jetstream::{self, consumer::pull::Config as ConsumerConfig, Context};
use futures::StreamExt;
use std::time::Duration;

use crate::dispatch::protocol::{
    AckMessage, ResultMessage, TriggerMessage, ACK_SUBJECT, RESULT_SUBJECT, TRIGGER_SUBJECT,
};
use crate::error::{AppError, AppResult};
use crate::nats::ensure_stream;

/// Message read from the result stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ack(AckMessage),
    Result(ResultMessage),
    Trigger(TriggerMessage),
}

impl Inbound {
    /// Decode by subject.
    pub fn decode(subject: &str, payload: &[u8]) -> AppResult<Self> {
        match subject {
            ACK_SUBJECT => Ok(Inbound::Ack(serde_json::from_slice(payload)?)),
            RESULT_SUBJECT => Ok(Inbound::Result(serde_json::from_slice(payload)?)),
            TRIGGER_SUBJECT => Ok(Inbound::Trigger(serde_json::from_slice(payload)?)),
            other => Err(AppError::Validation(format!(
                "unexpected subject '{}'",
                other
            ))),
        }
    }
}

/// Durable pull consumer on one stream.
pub struct NatsConsumer {
    consumer: jetstream::consumer::Consumer<ConsumerConfig>,
    name: String,
}

impl NatsConsumer {
    /// Consumer of acks, results and triggers for the coordinator.
    pub async fn inbound(js: &Context, stream: &str, name: &str) -> AppResult<Self> {
        let subjects = [ACK_SUBJECT, RESULT_SUBJECT, TRIGGER_SUBJECT];
        ensure_stream(js, stream, &subjects, jetstream::stream::RetentionPolicy::Limits).await?;
        Self::durable(js, stream, name, subjects.iter().map(|s| s.to_string()).collect()).await
    }

    /// Create or get a durable consumer filtered to `subjects`.
    pub async fn durable(
        js: &Context,
        stream: &str,
        name: &str,
        subjects: Vec<String>,
    ) -> AppResult<Self> {
        let stream = js
            .get_stream(stream)
            .await
            .map_err(|e| AppError::Nats(e.to_string()))?;

        let consumer = match stream.get_consumer(name).await {
            Ok(consumer) => consumer,
            Err(_) => {
                let config = ConsumerConfig {
                    durable_name: Some(name.to_string()),
                    filter_subjects: subjects,
                    ack_wait: Duration::from_secs(30),
                    ..Default::default()
                };
                let consumer = stream
                    .create_consumer(config)
                    .await
                    .map_err(|e| AppError::Nats(e.to_string()))?;
                tracing::info!(consumer = %name, "Created NATS consumer");
                consumer
            }
        };

        Ok(Self {
            consumer,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetch up to `max` messages, waiting at most `wait`.
    pub async fn fetch(&self, max: usize, wait: Duration) -> AppResult<Vec<jetstream::Message>> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(max)
            .expires(wait)
            .messages()
            .await
            .map_err(|e| AppError::Nats(e.to_string()))?;

        let mut batch = Vec::new();
        while let Some(message) = messages.next().await {
            match message {
                Ok(message) => batch.push(message),
                Err(e) => {
                    tracing::warn!(consumer = %self.name, error = %e, "Failed to receive message");
                    break;
                }
            }
        }
        Ok(batch)
    }
}

/// Acknowledge a processed message.
pub async fn ack(message: &jetstream::Message) -> AppResult<()> {
    message
        .ack()
        .await
        .map_err(|e| AppError::Nats(format!("Failed to ack message: {}", e)))
}

/// Negatively acknowledge a message so it is redelivered.
pub async fn nack(message: &jetstream::Message) -> AppResult<()> {
    message
        .ack_with(jetstream::AckKind::Nak(None))
        .await
        .map_err(|e| AppError::Nats(format!("Failed to nack message: {}", e)))
}
