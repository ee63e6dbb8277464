use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hotspot_shared::PoolSettings;
use sqlx::postgres::PgConnectOptions;
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::error::{BillingError, BillingResult};
use crate::models::Tenant;
use crate::tenancy::{ConnectionRouter, TenantConnection};

use super::PgVoucherLedger;

struct CachedPool {
    pool: PgPool,
    last_used: Instant,
}

/// Routes tenants to their own database on a shared server.
///
/// Each tenant database gets a small lazily connected pool, cached by
/// `database_name` and closed after sitting idle for `idle_ttl`.
#[derive(Clone)]
pub struct PgConnectionRouter {
    base: PgConnectOptions,
    settings: PoolSettings,
    idle_ttl: Duration,
    pools: Arc<RwLock<HashMap<String, CachedPool>>>,
}

impl PgConnectionRouter {
    /// `base_url` points at the tenant database server; its database
    /// component is replaced by each tenant's `database_name`.
    pub fn new(base_url: &str, settings: PoolSettings, idle_ttl: Duration) -> BillingResult<Self> {
        let base = PgConnectOptions::from_str(base_url).map_err(|e| {
            BillingError::Configuration(format!("invalid tenant database url: {}", e))
        })?;
        Ok(Self {
            base,
            settings,
            idle_ttl,
            pools: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    async fn pool_for(&self, database_name: &str) -> PgPool {
        let mut pools = self.pools.write().await;
        let cached = pools
            .entry(database_name.to_string())
            .or_insert_with(|| {
                tracing::debug!(database = %database_name, "Opening tenant pool");
                CachedPool {
                    pool: self
                        .settings
                        .options()
                        .connect_lazy_with(self.base.clone().database(database_name)),
                    last_used: Instant::now(),
                }
            });
        cached.last_used = Instant::now();
        cached.pool.clone()
    }

    /// Close pools unused for longer than the idle TTL; returns how many were closed
    pub async fn evict_idle(&self) -> usize {
        let stale: Vec<(String, PgPool)> = {
            let mut pools = self.pools.write().await;
            let names: Vec<String> = pools
                .iter()
                .filter(|(_, cached)| cached.last_used.elapsed() >= self.idle_ttl)
                .map(|(name, _)| name.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|name| pools.remove(&name).map(|cached| (name, cached.pool)))
                .collect()
        };

        for (name, pool) in &stale {
            pool.close().await;
            tracing::debug!(database = %name, "Closed idle tenant pool");
        }
        stale.len()
    }

    pub async fn cached_pools(&self) -> usize {
        self.pools.read().await.len()
    }
}

#[async_trait]
impl ConnectionRouter for PgConnectionRouter {
    async fn switch_to(&self, tenant: &Tenant) -> BillingResult<TenantConnection> {
        let store = format!("tenant:{}", tenant.database_name);
        if tenant.database_name.trim().is_empty() {
            return Err(BillingError::store_unavailable(store, "tenant has no database"));
        }

        let pool = self.pool_for(&tenant.database_name).await;

        // Fail here rather than halfway through the transition
        if let Err(e) = pool.acquire().await {
            tracing::warn!(
                tenant_id = tenant.id,
                database = %tenant.database_name,
                error = %e,
                "Tenant store unreachable"
            );
            return Err(BillingError::store_unavailable(store, e));
        }

        Ok(TenantConnection::new(
            tenant.id,
            tenant.database_name.clone(),
            Arc::new(PgVoucherLedger::new(pool)),
        ))
    }
}
