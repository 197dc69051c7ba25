//! The single write path into the event store.

use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::engine::ExecutionInstance;
use crate::error::AppResult;
use crate::events::store::EventStore;
use crate::events::types::{Event, EventPage};
use crate::sanitize::Redactor;

/// Redacts every event, then appends it.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn EventStore>,
    redactor: Arc<Redactor>,
}

impl EventLog {
    pub fn new(store: Arc<dyn EventStore>, redactor: Arc<Redactor>) -> Self {
        Self { store, redactor }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn redactor(&self) -> &Arc<Redactor> {
        &self.redactor
    }

    /// Redact and append; returns the event as stored.
    pub async fn append(&self, mut event: Event) -> AppResult<Event> {
        event.payload.redact(&self.redactor);
        self.store.append(event.clone()).await?;
        debug!(
            execution_id = %event.execution_id,
            event_id = event.event_id,
            kind = event.kind_name(),
            "Appended event"
        );
        Ok(event)
    }

    pub async fn read(&self, execution_id: Uuid, since: Option<u64>) -> AppResult<Vec<Event>> {
        self.store.read(execution_id, since).await
    }

    pub async fn read_page(&self, execution_id: Uuid, after: u64, limit: usize) -> AppResult<EventPage> {
        self.store.read_page(execution_id, after, limit).await
    }

    /// Rebuild an execution's projection from its full log.
    pub async fn replay(&self, execution_id: Uuid) -> AppResult<ExecutionInstance> {
        let events = self.store.read(execution_id, None).await?;
        ExecutionInstance::from_events(execution_id, &events)
    }
}
