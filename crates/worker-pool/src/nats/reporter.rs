//! Acks and results back to the coordinator.

use async_nats::jetstream::{self, Context};
use async_trait::async_trait;

use noetl_engine::dispatch::protocol::{ACK_SUBJECT, RESULT_SUBJECT, TRIGGER_SUBJECT};
use noetl_engine::dispatch::{AckMessage, ResultMessage};
use noetl_engine::nats::{ensure_stream, publish_json};
use noetl_engine::AppResult;

/// Sink for the messages a worker sends about an attempt.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn ack(&self, ack: &AckMessage) -> AppResult<()>;

    async fn result(&self, result: &ResultMessage) -> AppResult<()>;
}

/// Publishes to `noetl.acks` / `noetl.results` with per-attempt message
/// ids, so a retried publish is dropped by the stream.
#[derive(Clone)]
pub struct NatsReporter {
    js: Context,
}

impl NatsReporter {
    pub async fn new(js: Context, result_stream: &str) -> AppResult<Self> {
        ensure_stream(
            &js,
            result_stream,
            &[ACK_SUBJECT, RESULT_SUBJECT, TRIGGER_SUBJECT],
            jetstream::stream::RetentionPolicy::Limits,
        )
        .await?;
        Ok(Self { js })
    }
}

pub fn ack_message_id(ack: &AckMessage) -> String {
    format!("ack:{}:{}:{}", ack.execution_id, ack.step_instance_id, ack.attempt)
}

pub fn result_message_id(result: &ResultMessage) -> String {
    format!(
        "result:{}:{}:{}",
        result.execution_id, result.step_instance_id, result.attempt
    )
}

#[async_trait]
impl Reporter for NatsReporter {
    async fn ack(&self, ack: &AckMessage) -> AppResult<()> {
        let id = ack_message_id(ack);
        publish_json(&self.js, ACK_SUBJECT.to_string(), Some(&id), ack).await
    }

    async fn result(&self, result: &ResultMessage) -> AppResult<()> {
        let id = result_message_id(result);
        publish_json(&self.js, RESULT_SUBJECT.to_string(), Some(&id), result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_message_ids_differ_per_attempt() {
        let mut ack = AckMessage {
            execution_id: Uuid::nil(),
            step_instance_id: 9,
            attempt: 1,
            worker_id: "w".to_string(),
        };
        let first = ack_message_id(&ack);
        ack.attempt = 2;
        assert_ne!(first, ack_message_id(&ack));
        assert!(first.starts_with("ack:00000000-0000-0000-0000-000000000000:9:"));
    }
}
