//! Tenant Directory and Connection Router
//!
//! The router never keeps a process-wide "current tenant". `switch_to`
//! returns a [`TenantConnection`] that the caller threads through the rest of
//! the operation, so concurrent callbacks for different tenants cannot
//! observe each other's binding.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BillingResult;
use crate::models::{Tenant, TenantOwner};
use crate::vouchers::VoucherLedger;

/// Read access to the central tenant table
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn find_tenant(&self, tenant_id: i64) -> BillingResult<Option<Tenant>>;

    /// Registered owner, if the tenant has one
    async fn find_owner(&self, tenant: &Tenant) -> BillingResult<Option<TenantOwner>>;
}

/// Binds tenant-scoped operations to a tenant's isolated store.
///
/// Switching is a configuration change only: the store is assumed to be
/// provisioned already. An unreachable store yields
/// [`BillingError::StoreUnavailable`](crate::BillingError::StoreUnavailable)
/// and the caller must abandon the whole operation.
#[async_trait]
pub trait ConnectionRouter: Send + Sync {
    async fn switch_to(&self, tenant: &Tenant) -> BillingResult<TenantConnection>;
}

/// Tenant context for a single in-flight operation
#[derive(Clone)]
pub struct TenantConnection {
    tenant_id: i64,
    database_name: String,
    vouchers: Arc<dyn VoucherLedger>,
}

impl TenantConnection {
    pub fn new(tenant_id: i64, database_name: impl Into<String>, vouchers: Arc<dyn VoucherLedger>) -> Self {
        Self {
            tenant_id,
            database_name: database_name.into(),
            vouchers,
        }
    }

    pub fn tenant_id(&self) -> i64 {
        self.tenant_id
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Voucher ledger of the bound tenant store
    pub fn vouchers(&self) -> &dyn VoucherLedger {
        self.vouchers.as_ref()
    }
}

impl std::fmt::Debug for TenantConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantConnection")
            .field("tenant_id", &self.tenant_id)
            .field("database_name", &self.database_name)
            .finish()
    }
}
