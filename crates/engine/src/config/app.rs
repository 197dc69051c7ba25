//! Engine configuration.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::dispatch::protocol::{COMMAND_STREAM, RESULT_STREAM};
use crate::error::{AppError, AppResult};

/// Engine configuration loaded from environment variables.
///
/// Environment variables are prefixed with `NOETL_`:
/// - `NOETL_NATS_URL`: NATS server URL (required by `serve`)
/// - `NOETL_COMMAND_STREAM` / `NOETL_RESULT_STREAM`: JetStream stream names
/// - `NOETL_CONSUMER`: durable consumer name for acks, results and triggers
/// - `NOETL_TICK_INTERVAL_MS`: timer resolution for retries and timeouts
/// - `NOETL_PLAYBOOK_DIR`: directory of playbooks registered at startup
/// - `NOETL_POOL_CAPACITIES`: capacity overrides, e.g. `http_pool=4,pg_pool=5`
/// - `NOETL_COORDINATOR_ID`: identity used when acquiring leadership
/// - `NOETL_USE_POSTGRES`: use the Postgres stores instead of in-memory ones
/// - `NOETL_ENCRYPTION_KEY`: base64 AES-256 key for stored credentials
/// - `NOETL_LOG_JSON`: emit JSON logs
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub nats_url: Option<String>,

    #[serde(default = "default_command_stream")]
    pub command_stream: String,

    #[serde(default = "default_result_stream")]
    pub result_stream: String,

    #[serde(default = "default_consumer")]
    pub consumer: String,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default)]
    pub playbook_dir: Option<String>,

    #[serde(default)]
    pub pool_capacities: Option<String>,

    #[serde(default = "default_coordinator_id")]
    pub coordinator_id: String,

    #[serde(default)]
    pub use_postgres: bool,

    #[serde(default)]
    pub encryption_key: Option<String>,

    #[serde(default)]
    pub log_json: bool,
}

fn default_command_stream() -> String {
    COMMAND_STREAM.to_string()
}

fn default_result_stream() -> String {
    RESULT_STREAM.to_string()
}

fn default_consumer() -> String {
    "noetl-engine".to_string()
}

fn default_tick_interval_ms() -> u64 {
    500
}

fn default_coordinator_id() -> String {
    "noetl-engine".to_string()
}

impl AppConfig {
    /// Load configuration from `NOETL_`-prefixed environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("NOETL_").from_env::<AppConfig>()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(10))
    }

    /// Pool capacity overrides, empty when none are configured.
    pub fn capacity_overrides(&self) -> AppResult<BTreeMap<String, i64>> {
        match self.pool_capacities.as_deref() {
            Some(spec) => parse_capacities(spec),
            None => Ok(BTreeMap::new()),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            nats_url: None,
            command_stream: default_command_stream(),
            result_stream: default_result_stream(),
            consumer: default_consumer(),
            tick_interval_ms: default_tick_interval_ms(),
            playbook_dir: None,
            pool_capacities: None,
            coordinator_id: default_coordinator_id(),
            use_postgres: false,
            encryption_key: None,
            log_json: false,
        }
    }
}

/// Parse `name=capacity` pairs separated by commas.
pub fn parse_capacities(spec: &str) -> AppResult<BTreeMap<String, i64>> {
    let mut capacities = BTreeMap::new();
    for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').ok_or_else(|| {
            AppError::Configuration(format!("Expected name=capacity, got '{}'", pair))
        })?;
        let capacity: i64 = value.trim().parse().map_err(|_| {
            AppError::Configuration(format!("Invalid capacity for pool '{}': {}", name, value))
        })?;
        capacities.insert(name.trim().to_string(), capacity);
    }
    Ok(capacities)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.command_stream, "noetl_commands");
        assert_eq!(config.tick_interval(), Duration::from_millis(500));
        assert!(!config.use_postgres);
    }

    #[test]
    fn test_parse_capacities() {
        let caps = parse_capacities("http_pool=4, pg_pool=5,duckdb_host=1").unwrap();
        assert_eq!(caps.get("http_pool"), Some(&4));
        assert_eq!(caps.get("pg_pool"), Some(&5));
        assert_eq!(caps.get("duckdb_host"), Some(&1));
    }

    #[test]
    fn test_parse_capacities_rejects_garbage() {
        assert!(parse_capacities("http_pool").is_err());
        assert!(parse_capacities("http_pool=many").is_err());
        assert!(parse_capacities("").unwrap().is_empty());
    }
}
