//! Per-tenant voucher ledger

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::models::{PaymentAttempt, Voucher};
use crate::payload::{CallbackEntry, GatewayStatus};
use crate::transitions::InventorySkip;

/// What one callback did to a tenant store
#[derive(Debug, Clone)]
pub enum TenantTransition {
    AlreadyProcessed { attempt: PaymentAttempt },
    /// Attempt succeeded. `voucher` is the sold voucher; when the sale was
    /// skipped, `inventory_skip` says why and the attempt still committed.
    Succeeded {
        attempt: PaymentAttempt,
        voucher: Option<Voucher>,
        inventory_skip: Option<InventorySkip>,
    },
    Failed { attempt: PaymentAttempt },
    Recorded { attempt: PaymentAttempt },
    NotFound,
}

/// PaymentAttempt and Voucher records inside one tenant store
#[async_trait]
pub trait VoucherLedger: Send + Sync {
    async fn find_attempt(&self, reference: &str) -> BillingResult<Option<PaymentAttempt>>;

    /// Apply a gateway outcome to the attempt with `reference`.
    ///
    /// The attempt and its voucher are locked and written as one unit; a
    /// voucher that is missing or not available never blocks the attempt.
    async fn apply_attempt_outcome(
        &self,
        reference: &str,
        status: &GatewayStatus,
        reason: Option<&str>,
        entry: CallbackEntry,
        now: OffsetDateTime,
    ) -> BillingResult<TenantTransition>;
}
