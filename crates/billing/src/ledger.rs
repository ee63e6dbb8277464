//! Central billing ledger

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::models::{Payment, Subscription, Tenant};
use crate::payload::{CallbackEntry, GatewayStatus};

/// What one callback did to the central ledger
#[derive(Debug, Clone)]
pub enum CentralTransition {
    /// Payment was already completed; nothing written
    AlreadyProcessed { payment: Payment },
    /// Payment completed. For subscription payments the renewed subscription
    /// and the tenant carrying its plan are returned too.
    Completed {
        payment: Payment,
        subscription: Option<Subscription>,
        tenant: Option<Tenant>,
    },
    Failed { payment: Payment },
    /// Non-terminal gateway status logged on the payment
    Recorded { payment: Payment },
    /// No payment with that reference (it disappeared after resolution)
    NotFound,
}

/// Payment, Subscription and Tenant records in the central store
#[async_trait]
pub trait CentralLedger: Send + Sync {
    async fn find_payment(&self, reference: &str) -> BillingResult<Option<Payment>>;

    /// Apply a gateway outcome to the payment with `reference`.
    ///
    /// Implementations lock the payment, re-check the completed guard and
    /// write Payment, then Subscription, then Tenant as one atomic unit, so
    /// concurrent deliveries produce exactly one `Completed` transition.
    async fn apply_payment_outcome(
        &self,
        reference: &str,
        status: &GatewayStatus,
        entry: CallbackEntry,
        now: OffsetDateTime,
    ) -> BillingResult<CentralTransition>;
}
