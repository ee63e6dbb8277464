//! Hotspot API Server
//!
//! Receives Campay payment callbacks and reconciles them against the
//! central billing store and each tenant's voucher store.

use hotspot_api::{create_router, AppState, Config};
use hotspot_shared::{create_pool, init_tracing, run_migrations, PoolSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing("info,hotspot_api=debug,hotspot_billing=debug");

    tracing::info!("Starting Hotspot API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!(bind_address = %config.bind_address, "Configuration loaded");

    tracing::info!("Connecting to central database...");
    let pool = create_pool(
        &config.database_url,
        PoolSettings {
            acquire_timeout: config.store_connect_timeout,
            ..PoolSettings::default()
        },
    )
    .await?;
    tracing::info!("Database connection established");

    if config.run_migrations {
        run_migrations(&pool).await?;
    } else {
        tracing::info!("Database migrations skipped (RUN_MIGRATIONS not set)");
    }

    let bind_address = config.bind_address;
    let state = AppState::new(pool, config)?;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    tracing::info!("Listening on {}", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
