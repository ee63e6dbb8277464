//! Application state

use std::sync::Arc;

use hotspot_billing::{
    BillingEmailService, CallbackJournal, ConnectionRouter, InvariantChecker, PgCentralStore,
    PgConnectionRouter, WebhookReconciler,
};
use hotspot_shared::PoolSettings;
use sqlx::PgPool;
use tokio::time::{interval, Duration};

use crate::config::Config;

const POOL_EVICTION_INTERVAL: Duration = Duration::from_secs(300);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub reconciler: Arc<WebhookReconciler>,
    pub invariants: Arc<InvariantChecker>,
    pub journal: Arc<dyn CallbackJournal>,
}

impl AppState {
    /// Wire the Postgres-backed stores and start tenant pool eviction.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let central = Arc::new(PgCentralStore::new(pool));

        let tenant_pools = PoolSettings {
            max_connections: config.tenant_pool_max_connections,
            acquire_timeout: config.store_connect_timeout,
        };
        let router = PgConnectionRouter::new(
            &config.tenant_database_url,
            tenant_pools,
            config.tenant_pool_idle,
        )?;

        let email = BillingEmailService::from_env();
        if email.is_enabled() {
            tracing::info!("Payment notification emails enabled");
        } else {
            tracing::warn!("RESEND_API_KEY not set - payment notification emails disabled");
        }

        // Close tenant pools nobody has used for a while
        let evictor = router.clone();
        tokio::spawn(async move {
            let mut ticker = interval(POOL_EVICTION_INTERVAL);
            loop {
                ticker.tick().await;
                let closed = evictor.evict_idle().await;
                if closed > 0 {
                    tracing::debug!(closed, "Evicted idle tenant pools");
                }
            }
        });

        let router: Arc<dyn ConnectionRouter> = Arc::new(router);
        let reconciler = WebhookReconciler::new(
            central.clone(),
            central.clone(),
            router,
            Arc::new(email),
            central.clone(),
        );

        Ok(Self::from_parts(
            config,
            Arc::new(reconciler),
            Arc::new(InvariantChecker::new(central.clone())),
            central,
        ))
    }

    pub fn from_parts(
        config: Config,
        reconciler: Arc<WebhookReconciler>,
        invariants: Arc<InvariantChecker>,
        journal: Arc<dyn CallbackJournal>,
    ) -> Self {
        Self {
            config,
            reconciler,
            invariants,
            journal,
        }
    }
}
