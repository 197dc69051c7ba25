//! Event store contract and the in-memory backend.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::events::types::{Event, EventPage};

/// Append-only, per-execution ordered log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event. `event_id` must be exactly one past the last stored
    /// id of its execution, otherwise `AppError::Conflict`.
    async fn append(&self, event: Event) -> AppResult<u64>;

    /// Events with `event_id > since` (all when `None`), in order.
    async fn read(&self, execution_id: Uuid, since: Option<u64>) -> AppResult<Vec<Event>>;

    /// At most `limit` events with `event_id > after`.
    async fn read_page(&self, execution_id: Uuid, after: u64, limit: usize) -> AppResult<EventPage> {
        let mut events = self.read(execution_id, Some(after)).await?;
        let more = events.len() > limit;
        events.truncate(limit);
        let next_after = if more {
            events.last().map(|e| e.event_id)
        } else {
            None
        };
        Ok(EventPage { events, next_after })
    }

    /// Executions with at least one event, oldest first.
    async fn list_executions(&self) -> AppResult<Vec<Uuid>>;

    /// Try to become the active coordinator.
    async fn try_acquire_leadership(&self, holder: &str) -> AppResult<bool>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    logs: RwLock<BTreeMap<Uuid, Vec<Event>>>,
    order: RwLock<Vec<Uuid>>,
    unavailable: AtomicBool,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the backend were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Internal("event store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: Event) -> AppResult<u64> {
        self.check_available()?;
        let mut logs = self.logs.write().await;
        let log = logs.entry(event.execution_id).or_default();
        let expected = log.last().map(|e| e.event_id).unwrap_or(0) + 1;
        if event.event_id != expected {
            return Err(AppError::Conflict(format!(
                "execution {} expected event {} but got {}",
                event.execution_id, expected, event.event_id
            )));
        }
        if expected == 1 {
            self.order.write().await.push(event.execution_id);
        }
        let event_id = event.event_id;
        log.push(event);
        Ok(event_id)
    }

    async fn read(&self, execution_id: Uuid, since: Option<u64>) -> AppResult<Vec<Event>> {
        self.check_available()?;
        let logs = self.logs.read().await;
        let since = since.unwrap_or(0);
        Ok(logs
            .get(&execution_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.event_id > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_executions(&self) -> AppResult<Vec<Uuid>> {
        self.check_available()?;
        Ok(self.order.read().await.clone())
    }

    async fn try_acquire_leadership(&self, _holder: &str) -> AppResult<bool> {
        self.check_available()?;
        Ok(true)
    }
}
