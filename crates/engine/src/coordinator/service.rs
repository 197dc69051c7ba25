//! The coordinator's event loop: bus messages plus a periodic tick.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::coordinator::Coordinator;
use crate::error::AppError;
use crate::nats::subscriber::{ack, nack};
use crate::nats::{Inbound, NatsConsumer};
use crate::result_ext::ResultExt;

/// Messages fetched per pull.
const FETCH_BATCH: usize = 64;

/// Drive the coordinator until `shutdown` resolves.
///
/// Messages are acknowledged once handled, or when they can never be
/// handled (malformed, unknown ids). Infrastructure errors nack the message
/// so it is redelivered after recovery.
pub async fn run(
    coordinator: Arc<Coordinator>,
    consumer: NatsConsumer,
    tick_interval: Duration,
    shutdown: impl Future<Output = ()>,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    info!(
        coordinator = %coordinator.id(),
        consumer = %consumer.name(),
        tick_ms = tick_interval.as_millis() as u64,
        "Coordinator loop started"
    );

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Coordinator loop stopping");
                break;
            }
            _ = ticker.tick() => {
                match coordinator.tick(Utc::now()).await {
                    Ok(0) => {}
                    Ok(admitted) => debug!(admitted, "Tick scheduled steps"),
                    Err(AppError::NotLeader(_)) => debug!("Standing by, another coordinator is active"),
                    Err(e) => warn!(error = %e, "Tick failed"),
                }
            }
            fetched = consumer.fetch(FETCH_BATCH, tick_interval) => {
                let messages = match fetched {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!(error = %e, "Fetch failed");
                        tokio::time::sleep(tick_interval).await;
                        continue;
                    }
                };
                for message in messages {
                    handle(&coordinator, &message).await;
                }
            }
        }
    }
}

async fn handle(coordinator: &Coordinator, message: &async_nats::jetstream::Message) {
    let inbound = match Inbound::decode(message.subject.as_str(), &message.payload) {
        Ok(inbound) => inbound,
        Err(e) => {
            warn!(subject = %message.subject, error = %e, "Dropping malformed message");
            ack(message).await.warn_on_err("ack malformed message");
            return;
        }
    };

    let outcome = coordinator.ingest(inbound, Utc::now()).await;
    let settled = match outcome {
        Ok(()) => ack(message).await,
        Err(e) if e.is_infrastructure() || matches!(e, AppError::NotLeader(_)) => {
            warn!(subject = %message.subject, error = %e, "Deferring message");
            nack(message).await
        }
        Err(e) => {
            error!(subject = %message.subject, error = %e, "Message rejected");
            ack(message).await
        }
    };
    settled.warn_on_err("settle message");
}
