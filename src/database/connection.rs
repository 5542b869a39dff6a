//! Pool setup for the PostgreSQL backend and the pgmq queues, which share it.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::DatabaseConfig;

pub struct DatabaseConnection {
    pool: PgPool,
}

impl DatabaseConnection {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.url)
            .await?;
        info!(max_connections = config.max_connections, "✅ Database pool connected");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the embedded migrations. sqlx serializes concurrent runners
    /// with an advisory lock.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("✅ Catalog schema up to date");
        Ok(())
    }

    /// Whether the pgmq extension backing both queues is installed.
    pub async fn pgmq_available(&self) -> Result<bool, sqlx::Error> {
        let installed: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'pgmq')",
        )
        .fetch_one(&self.pool)
        .await?;
        if !installed {
            warn!("pgmq extension missing; queue creation will fail");
        }
        Ok(installed)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
