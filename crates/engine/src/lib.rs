//! NoETL Execution Engine
//!
//! The runtime core of NoETL:
//!
//! - **Execution state machine**: step lifecycle, transition evaluation,
//!   iterator fan-out/fan-in, retry and backoff
//! - **Scheduler**: capacity-aware admission onto resource pools, plus an
//!   offline projected schedule
//! - **Event store**: append-only log; every projection is rebuilt by replay
//! - **Credential resolution**: store, environment and inline references
//!   resolved at dispatch time and never persisted
//!
//! ## Architecture
//!
//! A single active [`coordinator::Coordinator`] serializes every
//! capacity-affecting decision. Commands go to workers over NATS JetStream;
//! acks and results come back the same way and become events. Payloads are
//! redacted before append, so the log never holds secret material.
//!
//! ## Example
//!
//! ```ignore
//! use noetl_engine::{coordinator::Coordinator, events::{EventLog, InMemoryEventStore}};
//!
//! let log = EventLog::new(Arc::new(InMemoryEventStore::new()), redactor.clone());
//! let coordinator = Coordinator::new("engine-1", log, dispatcher, overrides)?;
//! coordinator.register_playbook(parse_playbook(&yaml)?).await?;
//! let execution_id = coordinator.start_execution("etl/daily", None, payload, Utc::now()).await?;
//! ```

pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod crypto;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod nats;
pub mod playbook;
pub mod result_ext;
pub mod sanitize;
pub mod scheduler;
pub mod template;

pub use error::{AppError, AppResult, ErrorKind, StepError};
pub use result_ext::ResultExt;
