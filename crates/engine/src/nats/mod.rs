//! NATS JetStream transport for the dispatch protocol.
//!
//! Commands are published on a work-queue stream; acks, results and triggers
//! come back on a second stream read through a durable pull consumer.
//! Cancellations are best-effort core NATS messages.

pub mod publisher;
pub mod subscriber;

use async_nats::jetstream::{self, Context};
use serde::Serialize;

use crate::error::{AppError, AppResult};

pub use publisher::NatsCommandPublisher;
pub use subscriber::{Inbound, NatsConsumer};

/// Ensure a JetStream stream exists with the given subjects.
pub async fn ensure_stream(
    js: &Context,
    stream: &str,
    subjects: &[&str],
    retention: jetstream::stream::RetentionPolicy,
) -> AppResult<()> {
    match js.get_stream(stream).await {
        Ok(_) => {
            tracing::debug!(stream = %stream, "Using existing NATS stream");
            Ok(())
        }
        Err(_) => {
            let config = jetstream::stream::Config {
                name: stream.to_string(),
                subjects: subjects.iter().map(|s| s.to_string()).collect(),
                retention,
                max_age: std::time::Duration::from_secs(24 * 3600),
                storage: jetstream::stream::StorageType::File,
                duplicate_window: std::time::Duration::from_secs(120),
                ..Default::default()
            };

            js.create_stream(config)
                .await
                .map_err(|e| AppError::Nats(e.to_string()))?;

            tracing::info!(stream = %stream, subjects = ?subjects, "Created NATS stream");
            Ok(())
        }
    }
}

/// Publish a JSON message to JetStream and wait for the stream ack.
///
/// With a message id, the server drops duplicates inside the stream's
/// duplicate window.
pub async fn publish_json<T: Serialize>(
    js: &Context,
    subject: String,
    message_id: Option<&str>,
    message: &T,
) -> AppResult<()> {
    let payload = serde_json::to_vec(message)?;
    let mut headers = async_nats::HeaderMap::new();
    if let Some(id) = message_id {
        headers.insert(async_nats::header::NATS_MESSAGE_ID, id);
    }

    js.publish_with_headers(subject, headers, payload.into())
        .await
        .map_err(|e| AppError::Nats(e.to_string()))?
        .await
        .map_err(|e| AppError::Nats(e.to_string()))?;
    Ok(())
}
