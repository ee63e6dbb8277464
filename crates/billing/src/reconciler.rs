//! Gateway webhook reconciliation
//!
//! One inbound callback goes through three steps:
//!
//! 1. validate the payload ([`GatewayCallback::from_json`])
//! 2. resolve its scope ([`WebhookReconciler::resolve`]): a central Payment
//!    with that reference always wins; otherwise the `TENANT_<id>_...`
//!    external reference selects a tenant store, which must hold a
//!    PaymentAttempt with the same reference
//! 3. apply the gateway outcome inside the resolved store
//!
//! Every delivery, whatever its outcome, is written to the callback journal.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use time::OffsetDateTime;

use crate::correlation::CorrelationRef;
use crate::error::BillingResult;
use crate::journal::{CallbackJournal, CallbackOutcome, CallbackRecord};
use crate::ledger::{CentralLedger, CentralTransition};
use crate::models::{AttemptStatus, Payment, PaymentAttempt, PaymentStatus, Tenant};
use crate::notifications::PaymentNotifier;
use crate::payload::GatewayCallback;
use crate::tenancy::{ConnectionRouter, TenantConnection, TenantDirectory};
use crate::vouchers::TenantTransition;

/// Acknowledgement returned to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    AlreadyProcessed,
    ProcessedCentral,
    ProcessedTenant,
    /// Unresolvable; acknowledged so the gateway stops retrying
    NotFound,
}

impl ReconcileOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            ReconcileOutcome::AlreadyProcessed => "Already Processed",
            ReconcileOutcome::ProcessedCentral => "Processed Central Payment",
            ReconcileOutcome::ProcessedTenant => "Processed Tenant Payment",
            ReconcileOutcome::NotFound => "Payment Not Found",
        }
    }

    fn journal_outcome(&self) -> CallbackOutcome {
        match self {
            ReconcileOutcome::AlreadyProcessed => CallbackOutcome::AlreadyProcessed,
            ReconcileOutcome::ProcessedCentral => CallbackOutcome::ProcessedCentral,
            ReconcileOutcome::ProcessedTenant => CallbackOutcome::ProcessedTenant,
            ReconcileOutcome::NotFound => CallbackOutcome::NotFound,
        }
    }
}

/// Why a callback matched neither ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvedReason {
    NoExternalReference,
    MalformedExternalReference(String),
    UnknownTenant { tenant_id: i64 },
    AttemptNotFound { tenant_id: i64 },
}

impl UnresolvedReason {
    fn tenant_id(&self) -> Option<i64> {
        match self {
            UnresolvedReason::UnknownTenant { tenant_id }
            | UnresolvedReason::AttemptNotFound { tenant_id } => Some(*tenant_id),
            _ => None,
        }
    }
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnresolvedReason::NoExternalReference => {
                write!(f, "no central payment and no external reference")
            }
            UnresolvedReason::MalformedExternalReference(raw) => {
                write!(f, "malformed external reference '{}'", raw)
            }
            UnresolvedReason::UnknownTenant { tenant_id } => {
                write!(f, "tenant {} does not exist", tenant_id)
            }
            UnresolvedReason::AttemptNotFound { tenant_id } => {
                write!(f, "no payment attempt in tenant {} store", tenant_id)
            }
        }
    }
}

/// Scope a callback resolved to
#[derive(Debug)]
pub enum Resolution {
    Central(Payment),
    Tenant {
        tenant: Tenant,
        connection: TenantConnection,
        attempt: PaymentAttempt,
    },
    Unresolved(UnresolvedReason),
}

struct Processed {
    outcome: ReconcileOutcome,
    tenant_id: Option<i64>,
    detail: Option<String>,
}

impl Processed {
    fn new(outcome: ReconcileOutcome, tenant_id: i64) -> Self {
        Self {
            outcome,
            tenant_id: Some(tenant_id),
            detail: None,
        }
    }
}

/// Applies gateway callbacks to the central and tenant ledgers
pub struct WebhookReconciler {
    directory: Arc<dyn TenantDirectory>,
    central: Arc<dyn CentralLedger>,
    router: Arc<dyn ConnectionRouter>,
    notifier: Arc<dyn PaymentNotifier>,
    journal: Arc<dyn CallbackJournal>,
}

impl WebhookReconciler {
    pub fn new(
        directory: Arc<dyn TenantDirectory>,
        central: Arc<dyn CentralLedger>,
        router: Arc<dyn ConnectionRouter>,
        notifier: Arc<dyn PaymentNotifier>,
        journal: Arc<dyn CallbackJournal>,
    ) -> Self {
        Self {
            directory,
            central,
            router,
            notifier,
            journal,
        }
    }

    /// Process one raw callback body.
    ///
    /// `Err(BillingError::Validation)` means the payload was rejected before
    /// any store, the journal included, was touched. Any other error means processing was aborted and
    /// nothing was partially applied.
    pub async fn handle(&self, raw: Value) -> BillingResult<ReconcileOutcome> {
        let received_at = OffsetDateTime::now_utc();

        // Rejections are logged only; no store is touched for an invalid payload
        let callback = match GatewayCallback::from_json(raw, received_at) {
            Ok(callback) => callback,
            Err(e) => {
                tracing::warn!(error = %e, "Rejected gateway callback");
                return Err(e);
            }
        };

        tracing::info!(
            delivery_id = %callback.delivery_id,
            reference = %callback.reference,
            status = %callback.status,
            "Processing gateway callback"
        );

        let result = self.process(&callback).await;

        let (outcome, tenant_id, detail) = match &result {
            Ok(processed) => (
                processed.outcome.journal_outcome(),
                processed.tenant_id,
                processed.detail.clone(),
            ),
            Err(e) => {
                tracing::error!(
                    delivery_id = %callback.delivery_id,
                    reference = %callback.reference,
                    error = %e,
                    "Gateway callback processing aborted"
                );
                (CallbackOutcome::Failed, None, Some(e.to_string()))
            }
        };

        self.journal(CallbackRecord {
            delivery_id: callback.delivery_id,
            reference: Some(callback.reference.clone()),
            gateway_status: Some(callback.raw_status.clone()),
            outcome,
            tenant_id,
            detail,
            payload: callback.raw.clone(),
            received_at,
        })
        .await;

        result.map(|processed| processed.outcome)
    }

    /// Decide which ledger owns the callback, central first.
    ///
    /// Read-only. Fails with `StoreUnavailable` when the central store or the
    /// resolved tenant store cannot be reached.
    pub async fn resolve(&self, callback: &GatewayCallback) -> BillingResult<Resolution> {
        if let Some(payment) = self.central.find_payment(&callback.reference).await? {
            return Ok(Resolution::Central(payment));
        }

        let tenant_id = match CorrelationRef::parse(callback.external_reference.as_deref()) {
            CorrelationRef::Tenant { tenant_id, .. } => tenant_id,
            CorrelationRef::Malformed(raw) => {
                return Ok(Resolution::Unresolved(
                    UnresolvedReason::MalformedExternalReference(raw),
                ))
            }
            CorrelationRef::Absent => {
                return Ok(Resolution::Unresolved(UnresolvedReason::NoExternalReference))
            }
        };

        let Some(tenant) = self.directory.find_tenant(tenant_id).await? else {
            return Ok(Resolution::Unresolved(UnresolvedReason::UnknownTenant {
                tenant_id,
            }));
        };

        let connection = self.router.switch_to(&tenant).await?;
        match connection.vouchers().find_attempt(&callback.reference).await? {
            Some(attempt) => Ok(Resolution::Tenant {
                tenant,
                connection,
                attempt,
            }),
            None => Ok(Resolution::Unresolved(UnresolvedReason::AttemptNotFound {
                tenant_id,
            })),
        }
    }

    async fn process(&self, callback: &GatewayCallback) -> BillingResult<Processed> {
        match self.resolve(callback).await? {
            Resolution::Central(payment) => self.apply_central(callback, payment).await,
            Resolution::Tenant {
                tenant,
                connection,
                attempt,
            } => self.apply_tenant(callback, &tenant, &connection, attempt).await,
            Resolution::Unresolved(reason) => {
                tracing::info!(
                    delivery_id = %callback.delivery_id,
                    reference = %callback.reference,
                    reason = %reason,
                    "Unmatched gateway callback acknowledged"
                );
                Ok(Processed {
                    outcome: ReconcileOutcome::NotFound,
                    tenant_id: reason.tenant_id(),
                    detail: Some(reason.to_string()),
                })
            }
        }
    }

    async fn apply_central(
        &self,
        callback: &GatewayCallback,
        payment: Payment,
    ) -> BillingResult<Processed> {
        if payment.status == PaymentStatus::Completed {
            tracing::info!(
                reference = %callback.reference,
                tenant_id = payment.tenant_id,
                "Duplicate callback for completed payment"
            );
            return Ok(Processed::new(
                ReconcileOutcome::AlreadyProcessed,
                payment.tenant_id,
            ));
        }

        let previous_status = payment.status;
        let transition = self
            .central
            .apply_payment_outcome(
                &callback.reference,
                &callback.status,
                callback.entry(),
                callback.received_at,
            )
            .await?;

        match transition {
            CentralTransition::AlreadyProcessed { payment } => {
                // Lost the race to a concurrent delivery
                Ok(Processed::new(
                    ReconcileOutcome::AlreadyProcessed,
                    payment.tenant_id,
                ))
            }
            CentralTransition::Completed {
                payment,
                subscription,
                tenant,
            } => {
                if previous_status == PaymentStatus::Failed {
                    tracing::warn!(
                        reference = %payment.campay_reference,
                        tenant_id = payment.tenant_id,
                        "Payment previously marked failed was completed by a later callback"
                    );
                }
                tracing::info!(
                    reference = %payment.campay_reference,
                    tenant_id = payment.tenant_id,
                    subscription_id = ?subscription.as_ref().map(|s| s.id),
                    plan_id = ?subscription.as_ref().map(|s| s.plan_id),
                    "Central payment completed"
                );
                self.notify_payment_received(&payment, tenant).await;
                Ok(Processed::new(
                    ReconcileOutcome::ProcessedCentral,
                    payment.tenant_id,
                ))
            }
            CentralTransition::Failed { payment } => {
                tracing::info!(
                    reference = %payment.campay_reference,
                    tenant_id = payment.tenant_id,
                    gateway_status = %callback.status,
                    "Central payment failed"
                );
                Ok(Processed::new(
                    ReconcileOutcome::ProcessedCentral,
                    payment.tenant_id,
                ))
            }
            CentralTransition::Recorded { payment } => {
                tracing::info!(
                    reference = %payment.campay_reference,
                    gateway_status = %callback.status,
                    "Non-terminal gateway status recorded on central payment"
                );
                Ok(Processed::new(
                    ReconcileOutcome::ProcessedCentral,
                    payment.tenant_id,
                ))
            }
            CentralTransition::NotFound => Ok(Processed {
                outcome: ReconcileOutcome::NotFound,
                tenant_id: None,
                detail: Some("central payment disappeared during processing".to_string()),
            }),
        }
    }

    /// Best-effort payment-received notice. Never fails the committed transition.
    async fn notify_payment_received(&self, payment: &Payment, tenant: Option<Tenant>) {
        let tenant = match tenant {
            Some(tenant) => tenant,
            None => match self.directory.find_tenant(payment.tenant_id).await {
                Ok(Some(tenant)) => tenant,
                Ok(None) => {
                    tracing::warn!(
                        tenant_id = payment.tenant_id,
                        reference = %payment.campay_reference,
                        "Completed payment belongs to unknown tenant, no notification sent"
                    );
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to load tenant for payment notification");
                    return;
                }
            },
        };

        let owner = match self.directory.find_owner(&tenant).await {
            Ok(Some(owner)) => owner,
            Ok(None) => {
                tracing::debug!(tenant_id = tenant.id, "Tenant has no owner to notify");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to load tenant owner for payment notification");
                return;
            }
        };

        if let Err(e) = self.notifier.payment_received(payment, &tenant, &owner).await {
            tracing::error!(
                error = %e,
                tenant_id = tenant.id,
                reference = %payment.campay_reference,
                "Failed to send payment received notification"
            );
        }
    }

    async fn apply_tenant(
        &self,
        callback: &GatewayCallback,
        tenant: &Tenant,
        connection: &TenantConnection,
        attempt: PaymentAttempt,
    ) -> BillingResult<Processed> {
        if attempt.status == AttemptStatus::Success {
            tracing::info!(
                reference = %callback.reference,
                tenant_id = tenant.id,
                "Duplicate callback for successful payment attempt"
            );
            return Ok(Processed::new(ReconcileOutcome::AlreadyProcessed, tenant.id));
        }

        let transition = connection
            .vouchers()
            .apply_attempt_outcome(
                &callback.reference,
                &callback.status,
                callback.reason.as_deref(),
                callback.entry(),
                callback.received_at,
            )
            .await?;

        match transition {
            TenantTransition::AlreadyProcessed { .. } => {
                Ok(Processed::new(ReconcileOutcome::AlreadyProcessed, tenant.id))
            }
            TenantTransition::Succeeded {
                attempt,
                voucher,
                inventory_skip,
            } => {
                let mut processed = Processed::new(ReconcileOutcome::ProcessedTenant, tenant.id);
                match (voucher, inventory_skip) {
                    (Some(voucher), _) => {
                        tracing::info!(
                            reference = %attempt.reference,
                            tenant_id = tenant.id,
                            database = %connection.database_name(),
                            voucher_id = voucher.id,
                            "Voucher sold"
                        );
                    }
                    (None, Some(skip)) => {
                        tracing::warn!(
                            reference = %attempt.reference,
                            tenant_id = tenant.id,
                            database = %connection.database_name(),
                            skip = %skip,
                            "RECONCILIATION NEEDED: Payment attempt succeeded but voucher was not sold. \
                             The attempt is committed; inventory must be corrected manually."
                        );
                        processed.detail = Some(format!("inventory skipped: {}", skip));
                    }
                    (None, None) => {}
                }
                Ok(processed)
            }
            TenantTransition::Failed { attempt } => {
                tracing::info!(
                    reference = %attempt.reference,
                    tenant_id = tenant.id,
                    status = %attempt.status.as_str(),
                    reason = ?attempt.failure_reason,
                    "Payment attempt did not succeed"
                );
                Ok(Processed::new(ReconcileOutcome::ProcessedTenant, tenant.id))
            }
            TenantTransition::Recorded { attempt } => {
                tracing::info!(
                    reference = %attempt.reference,
                    tenant_id = tenant.id,
                    gateway_status = %callback.status,
                    "Non-terminal gateway status recorded on payment attempt"
                );
                Ok(Processed::new(ReconcileOutcome::ProcessedTenant, tenant.id))
            }
            TenantTransition::NotFound => Ok(Processed {
                outcome: ReconcileOutcome::NotFound,
                tenant_id: Some(tenant.id),
                detail: Some("payment attempt disappeared during processing".to_string()),
            }),
        }
    }

    async fn journal(&self, record: CallbackRecord) {
        if let Err(e) = self.journal.record(&record).await {
            tracing::warn!(
                delivery_id = %record.delivery_id,
                outcome = %record.outcome,
                error = %e,
                "Failed to journal gateway callback"
            );
        }
    }
}

