//! Configuration loading for the engine.
//!
//! Values come from the environment (after `.env` is loaded by `dotenvy`)
//! and are parsed with `envy`.

mod app;
mod database;

pub use app::{parse_capacities, AppConfig};
pub use database::DatabaseConfig;
