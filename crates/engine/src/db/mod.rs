//! PostgreSQL connectivity shared by the event and credential stores.

pub mod pool;

pub use pool::{create_pool, DbPool};
