//! Worker lifecycle management.

use async_nats::jetstream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{oneshot, Semaphore};
use uuid::Uuid;

use noetl_engine::dispatch::{AckMessage, CancelMessage, CommandMessage};
use noetl_engine::{AppError, AppResult};

use crate::config::WorkerConfig;
use crate::error::ToolError;
use crate::executor::CommandExecutor;
use crate::nats::{listen_for_cancels, CommandSource, NatsReporter, Reporter};

/// Attempts currently executing on this worker, keyed by
/// `(execution_id, step_instance_id)`.
#[derive(Debug, Default)]
pub struct InFlight {
    attempts: Mutex<HashMap<(Uuid, u64), oneshot::Sender<()>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an attempt; the receiver fires when it is cancelled.
    pub fn register(&self, execution_id: Uuid, step_instance_id: u64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.insert((execution_id, step_instance_id), tx);
        rx
    }

    pub fn finish(&self, execution_id: Uuid, step_instance_id: u64) {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.remove(&(execution_id, step_instance_id));
    }

    /// Signal every listed attempt running here. Returns how many were found.
    pub fn cancel(&self, message: &CancelMessage) -> usize {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let mut stopped = 0;
        for id in &message.step_instance_ids {
            if let Some(tx) = attempts.remove(&(message.execution_id, *id)) {
                if tx.send(()).is_ok() {
                    stopped += 1;
                }
            }
        }
        stopped
    }

    pub fn len(&self) -> usize {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ack, execute and report one command.
///
/// A cancel for the attempt drops the running tool (killing any child
/// process) and reports a `cancelled` failure.
pub async fn process(
    executor: &CommandExecutor,
    reporter: &dyn Reporter,
    inflight: &InFlight,
    worker_id: &str,
    command: CommandMessage,
) {
    let ack = AckMessage {
        execution_id: command.execution_id,
        step_instance_id: command.step_instance_id,
        attempt: command.attempt,
        worker_id: worker_id.to_string(),
    };
    if let Err(e) = reporter.ack(&ack).await {
        tracing::warn!(
            execution_id = %command.execution_id,
            step = %command.step_name,
            error = %e,
            "Failed to publish ack"
        );
    }

    let cancelled = inflight.register(command.execution_id, command.step_instance_id);
    let start = Instant::now();
    let outcome = tokio::select! {
        result = executor.execute(&command) => result,
        Ok(()) = cancelled => Err(ToolError::Cancelled),
    };
    inflight.finish(command.execution_id, command.step_instance_id);

    let result = executor.report(&command, outcome, start);
    if let Err(e) = reporter.result(&result).await {
        tracing::error!(
            execution_id = %command.execution_id,
            step = %command.step_name,
            attempt = command.attempt,
            error = %e,
            "Failed to publish result"
        );
    }
}

/// Worker that processes commands.
pub struct Worker {
    config: WorkerConfig,

    client: async_nats::Client,

    source: CommandSource,

    reporter: Arc<dyn Reporter>,

    executor: Arc<CommandExecutor>,

    inflight: Arc<InFlight>,

    /// Bounds concurrently executing commands.
    semaphore: Arc<Semaphore>,
}

impl Worker {
    /// Connect to NATS and attach to the command stream.
    pub async fn connect(config: WorkerConfig) -> AppResult<Self> {
        let client = async_nats::connect(&config.nats_url)
            .await
            .map_err(|e| AppError::Nats(e.to_string()))?;
        let js = jetstream::new(client.clone());

        let source = CommandSource::connect(&js, &config.command_stream, &config.consumer).await?;
        let reporter = NatsReporter::new(js, &config.result_stream).await?;
        let executor = CommandExecutor::new(config.shell.clone(), config.default_timeout);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_tasks));

        Ok(Self {
            config,
            client,
            source,
            reporter: Arc::new(reporter),
            executor: Arc::new(executor),
            inflight: Arc::new(InFlight::new()),
            semaphore,
        })
    }

    /// Run until the command stream fails.
    pub async fn run(&self) -> AppResult<()> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        tracing::info!(
            worker_id = %self.config.worker_id,
            pool_name = %self.config.pool_name,
            hostname = %hostname,
            max_concurrent = self.config.max_concurrent_tasks,
            "Worker started"
        );

        let cancels = tokio::spawn(listen_for_cancels(self.client.clone(), self.inflight.clone()));
        let result = self.process_commands().await;
        cancels.abort();
        result
    }

    async fn process_commands(&self) -> AppResult<()> {
        loop {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::Internal(e.to_string()))?;

            let Some(command) = self.source.receive(self.config.fetch_wait).await? else {
                continue;
            };

            tracing::debug!(
                execution_id = %command.execution_id,
                step = %command.step_name,
                attempt = command.attempt,
                "Received command"
            );

            let executor = self.executor.clone();
            let reporter = self.reporter.clone();
            let inflight = self.inflight.clone();
            let worker_id = self.config.worker_id.clone();
            tokio::spawn(async move {
                let _permit = permit;
                process(&executor, reporter.as_ref(), &inflight, &worker_id, command).await;
            });
        }
    }
}
