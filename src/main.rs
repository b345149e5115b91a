use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod admin;
mod config;
mod cron_expr;
mod db;
mod dispatcher;
mod error;
mod handler;
mod handlers;
mod id;
mod model;
mod queue;
mod tx;
mod worker;

use config::{AdminConfig, DatabaseConfig, DispatcherConfig, QueueDispatcherConfig, WorkerConfig};
use error::SchedulerResult;

#[derive(Debug, Parser)]
#[command(version, about, subcommand_required = false)]
struct Cli {
    /// Path to the database configuration document (spec §6 "database").
    #[arg(long, env = "CADENCE_DATABASE_CONFIG")]
    database_config: Option<PathBuf>,

    /// Convenience for local/dev use: a single sqlite file instead of a
    /// full database configuration document.
    #[arg(long, env = "CADENCE_SQLITE_PATH")]
    sqlite: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Runs the cron dispatcher only.
    Dispatcher {
        #[arg(long, env = "CADENCE_DISPATCHER_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Runs the worker pool only.
    Worker {
        #[arg(long, env = "CADENCE_WORKER_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Runs the admin HTTP surface only.
    Admin {
        #[arg(long, env = "CADENCE_ADMIN_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Runs the queue dispatcher only.
    QueueDispatcher {
        #[arg(long, env = "CADENCE_QUEUE_DISPATCHER_CONFIG")]
        config: Option<PathBuf>,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();
}

async fn load_registry(cli: &Cli) -> SchedulerResult<db::Registry> {
    let database_config = match (&cli.database_config, &cli.sqlite) {
        (Some(path), _) => DatabaseConfig::from_file(path)?,
        (None, Some(url)) => DatabaseConfig::single_sqlite(url.clone()),
        (None, None) => DatabaseConfig::single_sqlite("cadence.db"),
    };

    let registry = db::Registry::connect(&database_config).await?;
    registry.migrate_all().await?;
    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv_override();
    init_tracing();

    let cli = Cli::parse();
    let registry = load_registry(&cli).await?;
    let handlers = handlers::registry()?;
    let shutdown = CancellationToken::new();

    match cli.command {
        None => {
            let dispatcher_config: DispatcherConfig = config::load(None, "CADENCE_DISPATCHER_")?;
            let worker_config: WorkerConfig = config::load(None, "CADENCE_WORKER_")?;
            let admin_config: AdminConfig = config::load(None, "CADENCE_ADMIN_")?;

            let dispatcher = dispatcher::Dispatcher::new(registry.clone(), dispatcher_config);
            let worker_pool = worker::WorkerPool::new(registry.clone(), worker_config, handlers);
            let admin_db = registry.get(&admin_config.database)?.clone();

            let admin_listener = tokio::net::TcpListener::bind(&admin_config.bind_address).await?;
            let admin_shutdown = shutdown.clone();

            select! {
                res = dispatcher.run(shutdown.clone()) => res?,
                res = worker_pool.run(shutdown.clone()) => res?,
                res = axum::serve(admin_listener, admin::router(admin_db))
                    .with_graceful_shutdown(async move { admin_shutdown.cancelled().await }) => {
                    res?;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received shutdown signal");
                    shutdown.cancel();
                }
            }
        }
        Some(Commands::Dispatcher { config }) => {
            let dispatcher_config: DispatcherConfig = config::load(config.as_deref(), "CADENCE_DISPATCHER_")?;
            let dispatcher = dispatcher::Dispatcher::new(registry, dispatcher_config);

            select! {
                res = dispatcher.run(shutdown.clone()) => res?,
                _ = tokio::signal::ctrl_c() => shutdown.cancel(),
            }
        }
        Some(Commands::Worker { config }) => {
            let worker_config: WorkerConfig = config::load(config.as_deref(), "CADENCE_WORKER_")?;
            let worker_pool = worker::WorkerPool::new(registry, worker_config, handlers);

            select! {
                res = worker_pool.run(shutdown.clone()) => res?,
                _ = tokio::signal::ctrl_c() => shutdown.cancel(),
            }
        }
        Some(Commands::Admin { config }) => {
            let admin_config: AdminConfig = config::load(config.as_deref(), "CADENCE_ADMIN_")?;
            let admin_db = registry.get(&admin_config.database)?.clone();
            let listener = tokio::net::TcpListener::bind(&admin_config.bind_address).await?;

            select! {
                res = axum::serve(listener, admin::router(admin_db)) => res?,
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Some(Commands::QueueDispatcher { config }) => {
            let queue_config: QueueDispatcherConfig =
                config::load_required(config.as_deref(), "CADENCE_QUEUE_DISPATCHER_")?;
            let database = queue_config.database.clone();
            let adapter = queue::kafka::KafkaAdapter::new(queue_config);
            let mut queue_dispatcher = queue::QueueDispatcher::new(registry, database, adapter);

            select! {
                res = queue_dispatcher.run(shutdown.clone()) => res?,
                _ = tokio::signal::ctrl_c() => shutdown.cancel(),
            }
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}
