use anyhow::{Context, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;
use tracing::{debug, info};

use super::PostgresConfig;

const SCHEMA: &str = include_str!("../../migrations/postgres/00001_device_twin.sql");

/// PostgreSQL client wrapper with connection pooling
#[derive(Clone)]
pub struct PostgresClient {
    pool: Pool,
}

impl PostgresClient {
    /// Creates a pooled client from a DSN
    pub fn from_dsn(dsn: &str, max_pool_size: usize) -> Result<Self> {
        let pg_config: tokio_postgres::Config = dsn.parse().context("invalid PostgreSQL DSN")?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(max_pool_size)
            .build()
            .context("failed to build PostgreSQL pool")?;

        Ok(Self { pool })
    }

    pub fn from_config(config: &PostgresConfig) -> Result<Self> {
        Self::from_dsn(&config.dsn, config.max_pool_size)
    }

    /// Pings the database to verify connectivity
    pub async fn ping(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.execute("SELECT 1", &[]).await?;
        debug!("postgreSQL connection successful");
        Ok(())
    }

    /// Applies the bundled idempotent schema (the `Up` half of the migration)
    pub async fn ensure_schema(&self) -> Result<()> {
        let up = SCHEMA.split("-- +goose Down").next().unwrap_or_default();
        let client = self.pool.get().await?;
        client
            .batch_execute(up)
            .await
            .context("failed to apply device twin schema")?;
        info!("device twin schema applied");
        Ok(())
    }

    /// Gets a connection from the pool
    pub async fn get_connection(&self) -> Result<deadpool_postgres::Client> {
        Ok(self.pool.get().await?)
    }
}
