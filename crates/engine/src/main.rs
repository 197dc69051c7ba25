//! NoETL Execution Engine
//!
//! `serve` runs the coordinator against NATS; `plan` prints the projected
//! schedule of a playbook file without executing anything.

use anyhow::{anyhow, Context as _};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use noetl_engine::{
    config::{parse_capacities, AppConfig, DatabaseConfig},
    coordinator::{load_playbooks, service, Coordinator},
    credentials::{CredentialResolver, CredentialStore, InMemoryCredentialStore, PgCredentialStore},
    crypto::SecretCipher,
    db::create_pool,
    dispatch::Dispatcher,
    engine::TransitionEvaluator,
    events::{EventLog, EventStore, InMemoryEventStore, PgEventStore},
    nats::{NatsCommandPublisher, NatsConsumer},
    playbook::parse_playbook,
    sanitize::Redactor,
    scheduler::plan_schedule,
    ResultExt,
};

/// Default encryption key for development (should be overridden in production).
const DEFAULT_ENCRYPTION_KEY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

#[derive(Parser)]
#[command(name = "noetl-engine")]
#[command(version, about = "NoETL execution engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator
    Serve {
        /// Directory of playbooks to register at startup
        #[arg(long, value_name = "DIR")]
        playbooks: Option<PathBuf>,
    },

    /// Print the projected schedule of a playbook as JSON
    Plan {
        /// Playbook YAML file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Pool capacity overrides, e.g. http_pool=4,duckdb_host=1
        #[arg(long, value_name = "POOL=N,...")]
        resources: Option<String>,
    },
}

/// Initialize tracing/logging.
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,noetl_engine=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = AppConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Failed to load engine config ({}), using defaults", e);
        AppConfig::default()
    });
    init_tracing(config.log_json);

    match cli.command {
        Commands::Serve { playbooks } => serve(config, playbooks).await,
        Commands::Plan { file, resources } => plan(&config, &file, resources.as_deref()),
    }
}

fn plan(config: &AppConfig, file: &Path, resources: Option<&str>) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let playbook = parse_playbook(&text)?;

    let mut overrides: BTreeMap<String, i64> = config.capacity_overrides()?;
    if let Some(spec) = resources {
        overrides.extend(parse_capacities(spec)?);
    }

    let schedule = plan_schedule(&playbook, &overrides, &TransitionEvaluator::new())?;
    println!("{}", serde_json::to_string_pretty(&schedule)?);
    Ok(())
}

async fn serve(config: AppConfig, playbook_dir: Option<PathBuf>) -> anyhow::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        coordinator = %config.coordinator_id,
        "Starting NoETL engine"
    );

    let nats_url = config
        .nats_url
        .clone()
        .ok_or_else(|| anyhow!("NOETL_NATS_URL is required to serve"))?;

    let (event_store, credential_store): (Arc<dyn EventStore>, Arc<dyn CredentialStore>) =
        if config.use_postgres {
            let db_config = DatabaseConfig::from_env().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to load database config, using defaults");
                DatabaseConfig::default()
            });
            let pool = create_pool(&db_config).await?;

            let events = PgEventStore::new(pool.clone());
            events.init_schema().await?;
            let credentials = PgCredentialStore::new(pool, SecretCipher::from_base64(&encryption_key(&config))?);
            credentials.init_schema().await?;
            let events: Arc<dyn EventStore> = Arc::new(events);
            let credentials: Arc<dyn CredentialStore> = Arc::new(credentials);
            (events, credentials)
        } else {
            tracing::warn!("NOETL_USE_POSTGRES not set, event log is in memory only");
            let events: Arc<dyn EventStore> = Arc::new(InMemoryEventStore::new());
            let credentials: Arc<dyn CredentialStore> = Arc::new(InMemoryCredentialStore::new());
            (events, credentials)
        };

    let client = async_nats::connect(&nats_url)
        .await
        .with_context(|| format!("connecting to NATS at {}", nats_url))?;
    tracing::info!(url = %nats_url, "Connected to NATS");

    let publisher = NatsCommandPublisher::new(client.clone(), &config.command_stream).await?;
    let js = async_nats::jetstream::new(client);
    let consumer = NatsConsumer::inbound(&js, &config.result_stream, &config.consumer).await?;

    let redactor = Arc::new(Redactor::new());
    let dispatcher = Dispatcher::new(
        Arc::new(publisher),
        CredentialResolver::new(credential_store),
        redactor.clone(),
    );
    let coordinator = Arc::new(Coordinator::new(
        config.coordinator_id.clone(),
        EventLog::new(event_store, redactor),
        dispatcher,
        config.capacity_overrides()?,
    )?);

    let dir = playbook_dir.or_else(|| config.playbook_dir.as_ref().map(PathBuf::from));
    if let Some(dir) = dir {
        for playbook in load_playbooks(&dir)? {
            let id = playbook.id();
            let _ = coordinator
                .register_playbook(playbook)
                .await
                .log(format!("registering {}", id));
        }
    }

    let _ = coordinator.recover(Utc::now()).await.log("initial recovery");

    service::run(coordinator, consumer, config.tick_interval(), shutdown_signal()).await;

    tracing::info!("Engine shutdown complete");
    Ok(())
}

/// Get encryption key from environment or use default.
fn encryption_key(config: &AppConfig) -> String {
    config.encryption_key.clone().unwrap_or_else(|| {
        tracing::warn!("NOETL_ENCRYPTION_KEY not set, using default (not secure for production)");
        DEFAULT_ENCRYPTION_KEY.to_string()
    })
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
