//! Task Queue Worker Service
//!
//! A standalone process that serves a distributed task queue over Redis:
//! submits and schedules tasks, runs one or more group engines, claims and
//! executes tasks against registered handlers, and serves liveness,
//! readiness, and Prometheus metrics endpoints.
//!
//! ## Architecture
//!
//! ```text
//! Redis (store)
//!   ↕
//! QueueManager  (queues, groups, metrics + health loops)
//!   ↕
//! Worker        (claims tasks, dispatches to Handler, retries/DLQs)
//!   ↓
//! Handler registry ("echo", ...)
//! ```
//!
//! ## Features
//!
//! - Group-aware scheduling (FIFO/LIFO/priority/round-robin)
//! - Automatic retry with fixed or exponential backoff
//! - Dead letter queue for exhausted or permanently failed tasks
//! - Graceful shutdown handling across every background loop
//! - Health check endpoints for Kubernetes probes

use axum::Router;
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use task_queue::{
    health_router, FnHandler, Handler, HealthState, QueueManager, RuntimeConfig, Store, Worker,
    WorkerConfig,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Start the health/metrics HTTP server.
///
/// Provides:
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Prometheus metrics: `/metrics`
async fn start_health_server(health_state: HealthState, port: u16) -> Result<()> {
    let app: Router = health_router(health_state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

fn builtin_handlers() -> HashMap<String, Arc<dyn Handler>> {
    let mut handlers: HashMap<String, Arc<dyn Handler>> = HashMap::new();
    handlers.insert(
        "echo".to_string(),
        Arc::new(FnHandler(|task: &task_queue::Task| {
            let payload = task.handler_payload().clone();
            async move { Ok(json!({ "echoed": payload })) }
        })),
    );
    handlers
}

/// Run the task queue worker.
///
/// This is the main entry point for the process. It:
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Connects to the Redis-compatible store
/// 3. Starts the queue manager's background loops and a worker pool
/// 4. Serves health/metrics endpoints until shutdown
///
/// # Errors
///
/// Returns an error if the runtime configuration is invalid, the store
/// connection fails, or the worker loop returns a fatal error.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    task_queue::metrics::init_metrics();

    let app_name = env!("CARGO_PKG_NAME");
    let app_version = env!("CARGO_PKG_VERSION");
    info!(name = app_name, version = app_version, "Starting task queue worker");
    info!("Environment: {:?}", environment);

    let health_port: u16 = std::env::var("TASK_QUEUE_HEALTH_PORT")
        .or_else(|_| std::env::var("HEALTH_PORT"))
        .unwrap_or_else(|_| "8082".to_string())
        .parse()
        .unwrap_or(8082);

    let config = RuntimeConfig::from_env().wrap_err("Failed to load task queue configuration")?;
    info!(instance_id = %config.instance_id, "Runtime configuration loaded");

    info!("Connecting to store...");
    let store = Store::connect(&config.store.uri, config.store.key_prefix.clone())
        .await
        .wrap_err("Failed to connect to store")?;
    info!("Connected to store successfully");

    let queue_name = std::env::var("TASK_QUEUE_DEFAULT_QUEUE").unwrap_or_else(|_| "default".to_string());
    let concurrency: usize = std::env::var("TASK_QUEUE_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(config.queue_defaults.concurrency);

    let manager = Arc::new(QueueManager::new(store.clone(), config.clone()));
    manager.create_queue(&queue_name, config.queue_defaults.clone()).await?;
    manager.spawn_background_loops();

    let worker = Worker::new(
        store.clone(),
        WorkerConfig {
            queue: queue_name.clone(),
            concurrency,
            heartbeat_interval_ms: config.heartbeat_interval_ms,
        },
        config.queue_defaults.clone(),
        manager.observer(),
        manager.groups(),
        config.dlq.alert_threshold,
        builtin_handlers(),
    );
    info!(queue = %queue_name, concurrency, worker_id = worker.id(), "Worker configured");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let health_state = HealthState::new(store.clone(), app_name, app_version);
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    info!("Starting task worker loop...");
    worker
        .run(shutdown_rx)
        .await
        .map_err(|e| eyre::eyre!("{}", e))?;

    manager.close().await.map_err(|e| eyre::eyre!("{}", e))?;
    info!("Task queue worker stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
