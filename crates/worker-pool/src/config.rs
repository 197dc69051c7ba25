//! Worker configuration.

use serde::Deserialize;
use std::time::Duration;

use noetl_engine::dispatch::protocol::{COMMAND_STREAM, RESULT_STREAM};

/// Worker settings read from `WORKER_*` variables.
#[derive(Debug, Clone, Deserialize)]
struct WorkerVars {
    #[serde(default = "new_worker_id")]
    id: String,

    #[serde(default = "default_pool_name")]
    pool_name: String,

    #[serde(default = "default_max_concurrent")]
    max_concurrent: usize,

    #[serde(default = "default_shell")]
    shell: String,

    #[serde(default = "default_timeout_secs")]
    default_timeout_secs: u64,

    #[serde(default)]
    log_json: bool,
}

/// Connection settings read from `NATS_*` variables.
#[derive(Debug, Clone, Deserialize)]
struct NatsVars {
    #[serde(default = "default_nats_url")]
    url: String,

    #[serde(default = "default_command_stream")]
    stream: String,

    #[serde(default = "default_result_stream")]
    result_stream: String,

    #[serde(default = "default_consumer")]
    consumer: String,

    #[serde(default = "default_fetch_wait_ms")]
    fetch_wait_ms: u64,
}

fn new_worker_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_pool_name() -> String {
    "default".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_shell() -> String {
    "bash".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_command_stream() -> String {
    COMMAND_STREAM.to_string()
}

fn default_result_stream() -> String {
    RESULT_STREAM.to_string()
}

fn default_consumer() -> String {
    "noetl-worker".to_string()
}

fn default_fetch_wait_ms() -> u64 {
    1000
}

/// Worker configuration.
///
/// - `WORKER_ID`, `WORKER_POOL_NAME`, `WORKER_MAX_CONCURRENT`
/// - `WORKER_SHELL`: interpreter for `shell` tools (`<shell> -c <command>`)
/// - `WORKER_DEFAULT_TIMEOUT_SECS`: limit for commands without a deadline
/// - `WORKER_LOG_JSON`
/// - `NATS_URL`, `NATS_STREAM`, `NATS_RESULT_STREAM`, `NATS_CONSUMER`,
///   `NATS_FETCH_WAIT_MS`
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier, reported in acks.
    pub worker_id: String,

    pub pool_name: String,

    pub nats_url: String,

    /// Stream holding command messages.
    pub command_stream: String,

    /// Stream acks and results are published to.
    pub result_stream: String,

    /// Durable consumer shared by all workers of the pool.
    pub consumer: String,

    pub fetch_wait: Duration,

    /// Maximum concurrent commands.
    pub max_concurrent_tasks: usize,

    pub shell: String,

    pub default_timeout: Duration,

    pub log_json: bool,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        let worker = envy::prefixed("WORKER_").from_env::<WorkerVars>()?;
        let nats = envy::prefixed("NATS_").from_env::<NatsVars>()?;
        Ok(Self::assemble(worker, nats))
    }

    /// Load configuration from explicit `(name, value)` pairs.
    pub fn from_vars<I>(vars: I) -> Result<Self, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: Vec<(String, String)> = vars.into_iter().collect();
        let worker = envy::prefixed("WORKER_").from_iter::<_, WorkerVars>(vars.clone())?;
        let nats = envy::prefixed("NATS_").from_iter::<_, NatsVars>(vars)?;
        Ok(Self::assemble(worker, nats))
    }

    fn assemble(worker: WorkerVars, nats: NatsVars) -> Self {
        Self {
            worker_id: worker.id,
            pool_name: worker.pool_name,
            nats_url: nats.url,
            command_stream: nats.stream,
            result_stream: nats.result_stream,
            consumer: nats.consumer,
            fetch_wait: Duration::from_millis(nats.fetch_wait_ms.max(10)),
            max_concurrent_tasks: worker.max_concurrent.max(1),
            shell: worker.shell,
            default_timeout: Duration::from_secs(worker.default_timeout_secs),
            log_json: worker.log_json,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::assemble(
            WorkerVars {
                id: new_worker_id(),
                pool_name: default_pool_name(),
                max_concurrent: default_max_concurrent(),
                shell: default_shell(),
                default_timeout_secs: default_timeout_secs(),
                log_json: false,
            },
            NatsVars {
                url: default_nats_url(),
                stream: default_command_stream(),
                result_stream: default_result_stream(),
                consumer: default_consumer(),
                fetch_wait_ms: default_fetch_wait_ms(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.pool_name, "default");
        assert_eq!(config.max_concurrent_tasks, 4);
        assert_eq!(config.command_stream, "noetl_commands");
        assert!(!config.worker_id.is_empty());
    }

    #[test]
    fn test_config_from_vars() {
        let config = tokio_test::assert_ok!(WorkerConfig::from_vars(vars(&[
            ("WORKER_ID", "worker-7"),
            ("WORKER_MAX_CONCURRENT", "0"),
            ("WORKER_SHELL", "sh"),
            ("NATS_URL", "nats://bus:4222"),
            ("NATS_CONSUMER", "shell-workers"),
            ("UNRELATED", "ignored"),
        ])));

        assert_eq!(config.worker_id, "worker-7");
        assert_eq!(config.max_concurrent_tasks, 1);
        assert_eq!(config.shell, "sh");
        assert_eq!(config.nats_url, "nats://bus:4222");
        assert_eq!(config.consumer, "shell-workers");
        assert_eq!(config.result_stream, "noetl_results");
        assert_eq!(config.default_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_config_rejects_bad_number() {
        tokio_test::assert_err!(WorkerConfig::from_vars(vars(&[("WORKER_MAX_CONCURRENT", "many")])));
    }
}
