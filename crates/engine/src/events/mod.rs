//! Event-sourced execution log.

pub mod log;
pub mod postgres;
pub mod store;
pub mod types;

pub use log::EventLog;
pub use postgres::PgEventStore;
pub use store::{EventStore, InMemoryEventStore};
pub use types::{
    ActivationOutcome, Event, EventPage, EventPayload, ExecutionStatus, InstanceSeed, Token,
};
