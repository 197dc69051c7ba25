//! NoETL Worker
//!
//! Executes step commands published by the engine coordinator.
//!
//! This crate provides:
//! - a durable JetStream consumer of `noetl.commands.*`
//! - acks and results published back to the coordinator
//! - a command executor over the closed tool set (`noop`, `shell`)
//! - cooperative cancellation from `noetl.cancel`

pub mod config;
pub mod error;
pub mod executor;
pub mod nats;
pub mod worker;

pub use config::WorkerConfig;
pub use error::ToolError;
pub use worker::Worker;
