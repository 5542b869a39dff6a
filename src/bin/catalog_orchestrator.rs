//! # Catalog Orchestrator
//!
//! Long-running worker: consumes the events queue and dispatches every
//! event until interrupted. Several workers may share one database.

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

use catalog_orchestrator::config::ConfigManager;
use catalog_orchestrator::database::{DatabaseConnection, PgBackend};
use catalog_orchestrator::logging::init_structured_logging;
use catalog_orchestrator::messaging::PgmqQueue;
use catalog_orchestrator::orchestration::{EventConsumer, EventDispatcher};
use catalog_orchestrator::storage::LocalStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let manager = ConfigManager::load().context("loading configuration")?;
    let config = manager.config();
    init_structured_logging(Some(&config.logging));
    info!(
        environment = %manager.environment(),
        config = %manager.debug_config(),
        "🚀 Starting catalog orchestrator"
    );

    let connection = DatabaseConnection::connect(&config.database)
        .await
        .context("connecting to the database")?;
    if config.database.run_migrations {
        connection.migrate().await.context("running migrations")?;
    }
    if !connection.pgmq_available().await? {
        anyhow::bail!("the pgmq extension is not installed in the catalog database");
    }
    let pool = connection.pool().clone();

    let events = PgmqQueue::new(pool.clone(), &config.messaging.events_queue)?;
    let orders = PgmqQueue::new(pool.clone(), &config.messaging.orders_queue)?;
    events.ensure_queue().await?;
    orders.ensure_queue().await?;

    let storage = Arc::new(LocalStorage::new(&config.storage.root));
    let dispatcher = EventDispatcher::new(
        Arc::new(PgBackend::new(pool)),
        Arc::new(events.clone()),
        Arc::new(orders),
        storage,
        &config.storage.cancellation_prefix,
    )
    .with_execution_config(config.execution.clone());
    let consumer = EventConsumer::new(events, Arc::new(dispatcher), config.messaging.clone());

    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Interrupt received, shutting down");
        }
        signal.notify_one();
    });

    consumer.run(shutdown).await?;
    connection.close().await;
    info!("✅ Catalog orchestrator stopped");
    Ok(())
}
