//! Central database pool construction

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

/// Connection pool sizing shared by the central pool and tenant pools
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    /// Upper bound on waiting for a connection; a timeout is reported as an unavailable store
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolSettings {
    pub fn options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
    }
}

/// Create the central database pool
pub async fn create_pool(database_url: &str, settings: PoolSettings) -> Result<PgPool, sqlx::Error> {
    let pool = settings.options().connect(database_url).await?;
    tracing::info!(
        max_connections = settings.max_connections,
        "Central database pool created"
    );
    Ok(pool)
}

/// Apply the central schema migrations embedded at build time
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations/central").run(pool).await?;
    tracing::info!("Central database migrations applied");
    Ok(())
}
