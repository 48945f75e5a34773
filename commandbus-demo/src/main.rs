//! Composition root wiring the queue adapter, command bus, worker, and
//! process engine together for the `reporting` domain (`spec.md` §8
//! scenario 6). Not a product CLI — see `SPEC_FULL.md`'s Non-goals.

mod handlers;
mod process;

use std::sync::Arc;

use tokio::signal;
use tracing::info;

use commandbus_core::{AuditLog, BatchEngine, CommandBus, CommandBusConfig, CommandRepository};
use commandbus_process::{ManagerRegistry, ProcessEngine, ProcessRepository, ReplyRouter};
use commandbus_queue::QueueAdapter;
use commandbus_worker::{HandlerRegistry, Watchdog, Worker};
use sqlx::postgres::PgPoolOptions;

const DOMAIN: &str = "reporting";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = CommandBusConfig::load(None)?;
    info!(domain = DOMAIN, "starting commandbus-demo composition root");

    let pool = PgPoolOptions::new()
        .min_connections(config.pool_min)
        .max_connections(config.pool_max)
        .connect(&config.database_url)
        .await?;

    commandbus_core::ensure_schema_version(&pool).await?;

    let queue = QueueAdapter::new_with_pool(pool.clone()).await?;
    queue.ensure_domain_queues(DOMAIN).await?;

    let repository = CommandRepository::new(pool.clone());
    let audit = AuditLog::new(pool.clone());
    let batches = BatchEngine::new(pool.clone());
    let bus = CommandBus::new(queue.clone(), repository.clone(), audit.clone(), batches.clone());

    let mut handler_registry = HandlerRegistry::new();
    handler_registry.register(DOMAIN, "StatementQuery", Arc::new(handlers::StatementQueryHandler));
    handler_registry.register(
        DOMAIN,
        "StatementDataAggregation",
        Arc::new(handlers::StatementDataAggregationHandler),
    );
    handler_registry.register(DOMAIN, "StatementRender", Arc::new(handlers::StatementRenderHandler));
    let handler_registry = Arc::new(handler_registry);

    let worker = Arc::new(Worker::new(
        DOMAIN,
        queue.clone(),
        repository.clone(),
        audit.clone(),
        batches.clone(),
        handler_registry,
        &config,
    ));

    let process_repo = ProcessRepository::new(pool.clone());
    let mut managers = ManagerRegistry::new();
    managers.register(Arc::new(process::StatementReportProcess));
    let managers = Arc::new(managers);

    let engine = Arc::new(ProcessEngine::new(
        DOMAIN,
        config.max_attempts as i32,
        bus,
        process_repo,
        audit,
        batches,
        managers,
    ));
    let router = Arc::new(ReplyRouter::new(
        DOMAIN,
        queue,
        engine.clone(),
        config.poll_interval_ms,
        config.router_concurrency,
    ));

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    let watchdog = Arc::new(Watchdog::new(worker.health(), std::time::Duration::from_secs(10)));
    let watchdog_stop_tx = stop_tx.clone();
    watchdog
        .set_recovery_callback(Arc::new(move || {
            tracing::error!(domain = DOMAIN, "worker health CRITICAL; signalling shutdown for external supervisor restart");
            let _ = watchdog_stop_tx.send(true);
        }))
        .await;

    let worker_handle = tokio::spawn(worker.clone().run(stop_rx.clone()));
    let router_handle = tokio::spawn(router.clone().run(stop_rx.clone()));
    let watchdog_handle = tokio::spawn({
        let watchdog = watchdog.clone();
        let stop_rx = stop_rx.clone();
        async move { watchdog.run(stop_rx).await }
    });

    let process_id = engine
        .start(
            "StatementReportProcess",
            serde_json::json!({
                "from_date": "2026-07-01",
                "to_date": "2026-07-31",
                "accounts": ["acct-1", "acct-2"],
                "output_type": "pdf",
            }),
            None,
        )
        .await?;
    info!(%process_id, "started demo statement report process");

    shutdown_signal().await;
    info!("shutdown signal received, stopping worker and reply router");
    let _ = stop_tx.send(true);

    let _ = worker_handle.await;
    let _ = router_handle.await;
    let _ = watchdog_handle.await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C"); }
        _ = terminate => { info!("received SIGTERM"); }
    }
}
