#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod collaborator;
mod config;

use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use surveyor_core::{MemoryResultStore, MemoryTaskStore, ResultStore, TaskStore};
use surveyor_flow::Monitor;
use surveyor_pipeline::{PipelineDeps, SurveyPipeline};
use surveyor_postgres::{PgClient, PgConfig, PgResultStore, PgTaskStore};
use surveyor_redis::RedisTaskStore;
use surveyor_server::{PipelineTaskManager, ServiceState, handler};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::collaborator::{ExtractiveComposer, ExtractiveDigester, ExtractiveOutliner};
use crate::config::{Cli, TaskStoreBackend};

/// Tracing target for server startup.
const TRACING_TARGET_STARTUP: &str = "surveyor_cli::startup";

/// Tracing target for server shutdown.
const TRACING_TARGET_SHUTDOWN: &str = "surveyor_cli::shutdown";

fn main() {
    // Load .env before clap reads the environment.
    let _ = dotenvy::dotenv();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    let Err(error) = runtime.block_on(run()) else {
        process::exit(0);
    };

    if tracing::enabled!(tracing::Level::ERROR) {
        tracing::error!(
            target: TRACING_TARGET_SHUTDOWN,
            error = %error,
            "Server terminated with error"
        );
    } else {
        eprintln!("Error: {error:#}");
    }
    process::exit(1);
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    tracing::info!(
        target: TRACING_TARGET_STARTUP,
        version = env!("CARGO_PKG_VERSION"),
        bind = %cli.server.bind_addr(),
        task_store = ?cli.store.task_store,
        "Starting surveyor server"
    );

    // Stores.
    let (tasks, results) = create_stores(&cli).await?;

    // The process-scoped pipeline.
    let deps = PipelineDeps {
        results: results.clone(),
        outliner: Arc::new(ExtractiveOutliner),
        digester: Arc::new(ExtractiveDigester),
        composer: Arc::new(ExtractiveComposer),
    };
    let pipeline = Arc::new(
        SurveyPipeline::init(cli.pipeline.survey_pipeline_config(), deps)
            .context("failed to assemble the survey pipeline")?,
    );
    pipeline.start().context("failed to start the survey pipeline")?;

    // Periodic node status reports.
    let monitor_token = CancellationToken::new();
    let mut monitor = Monitor::new(cli.pipeline.monitor_interval());
    {
        let pipeline = pipeline.clone();
        monitor.register("survey", Arc::new(move || pipeline.metrics()));
    }
    let monitor_handle = monitor.spawn(monitor_token.clone());

    // Task lifecycle manager. Topic submissions stay disabled until a
    // search/crawl processor is wired in.
    let manager = PipelineTaskManager::new(
        tasks.clone(),
        results.clone(),
        pipeline.clone(),
        None,
        cli.pipeline.manager_config(),
    );

    let state = ServiceState::new(tasks.clone(), results, pipeline.clone(), manager);
    let router = handler::router(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(cli.server.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", cli.server.bind_addr()))?;
    tracing::info!(
        target: TRACING_TARGET_STARTUP,
        addr = %cli.server.bind_addr(),
        "HTTP server listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    // Shutdown: stop the pipeline, then sweep and report the registry.
    tracing::info!(
        target: TRACING_TARGET_SHUTDOWN,
        "Shutting down"
    );
    monitor_token.cancel();
    let _ = monitor_handle.await;
    pipeline
        .shutdown()
        .await
        .context("failed to shut the pipeline down")?;

    match tasks.cleanup_expired().await {
        Ok(0) => {}
        Ok(swept) => tracing::info!(
            target: TRACING_TARGET_SHUTDOWN,
            swept,
            "Removed expired tasks"
        ),
        Err(err) => tracing::warn!(
            target: TRACING_TARGET_SHUTDOWN,
            error = %err,
            "Expiration sweep failed"
        ),
    }
    match tasks.active_count().await {
        Ok(0) => {}
        Ok(active) => tracing::warn!(
            target: TRACING_TARGET_SHUTDOWN,
            active,
            "Active tasks remain; their records stay in the registry"
        ),
        Err(_) => {}
    }

    tracing::info!(
        target: TRACING_TARGET_SHUTDOWN,
        "Server stopped"
    );
    Ok(())
}

/// Builds the task registry and result store per configuration.
async fn create_stores(
    cli: &Cli,
) -> anyhow::Result<(Arc<dyn TaskStore>, Arc<dyn ResultStore>)> {
    let pg_client = match &cli.store.postgres_url {
        Some(url) => Some(
            PgClient::new_with_test(PgConfig::new(url.clone()))
                .await
                .context("failed to connect to PostgreSQL")?,
        ),
        None => None,
    };
    if let Some(client) = &pg_client {
        client
            .run_migrations()
            .await
            .context("failed to apply database migrations")?;
    }

    let expire_seconds = cli.store.redis.redis_expire_seconds;
    let tasks: Arc<dyn TaskStore> = match cli.store.task_store {
        TaskStoreBackend::Redis => Arc::new(
            RedisTaskStore::connect(cli.store.redis.clone())
                .await
                .context("failed to connect to Redis")?,
        ),
        TaskStoreBackend::Postgres => {
            let client = pg_client
                .clone()
                .context("--postgres-url is required for the postgres task store")?;
            Arc::new(PgTaskStore::new(client, expire_seconds))
        }
        TaskStoreBackend::Memory => {
            tracing::warn!(
                target: TRACING_TARGET_STARTUP,
                "Using the in-memory task store; records will not survive restarts"
            );
            Arc::new(MemoryTaskStore::new(expire_seconds))
        }
    };

    let results: Arc<dyn ResultStore> = match pg_client {
        Some(client) => Arc::new(PgResultStore::new(client)),
        None => {
            tracing::warn!(
                target: TRACING_TARGET_STARTUP,
                "No PostgreSQL URL configured; results are stored in memory only"
            );
            Arc::new(MemoryResultStore::new())
        }
    };

    Ok((tasks, results))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(
            target: TRACING_TARGET_SHUTDOWN,
            error = %err,
            "Failed to install the interrupt handler"
        );
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
