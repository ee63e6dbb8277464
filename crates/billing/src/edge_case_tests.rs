// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Webhook Reconciliation
//!
//! Tests critical boundary conditions and race conditions in:
//! - Payload validation
//! - Central payments and subscription renewal
//! - Tenant voucher purchases
//! - Idempotence under re-delivery and concurrent delivery
//! - Store outages and unresolvable callbacks

use std::sync::Arc;

use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::error::BillingError;
use crate::journal::CallbackOutcome;
use crate::memory::{
    MemoryCentralStore, MemoryConnectionRouter, MemoryJournal, MemoryVoucherLedger,
    RecordingNotifier,
};
use crate::models::{
    AttemptStatus, Payment, PaymentAttempt, PaymentStatus, PaymentType, Subscription,
    SubscriptionStatus, Tenant, TenantOwner, TenantStatus, Voucher, VoucherStatus,
};
use crate::payload::PaymentMeta;
use crate::reconciler::{ReconcileOutcome, WebhookReconciler};

struct Fixture {
    central: Arc<MemoryCentralStore>,
    router: Arc<MemoryConnectionRouter>,
    notifier: Arc<RecordingNotifier>,
    journal: Arc<MemoryJournal>,
    reconciler: Arc<WebhookReconciler>,
}

impl Fixture {
    fn new() -> Self {
        let central = Arc::new(MemoryCentralStore::new());
        let router = Arc::new(MemoryConnectionRouter::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let journal = Arc::new(MemoryJournal::new());
        let reconciler = Arc::new(WebhookReconciler::new(
            central.clone(),
            central.clone(),
            router.clone(),
            notifier.clone(),
            journal.clone(),
        ));
        Self {
            central,
            router,
            notifier,
            journal,
            reconciler,
        }
    }

    /// Tenant 42 with owner 7, suspended on no plan, subscription 5 for plan 3
    /// pending payment "R2"
    async fn with_subscription_payment(self) -> Self {
        self.central.insert_owner(owner(7)).await;
        self.central
            .insert_tenant(tenant(42, "cafe-central", None, TenantStatus::Suspended, Some(7)))
            .await;
        self.central
            .insert_subscription(subscription(5, 42, 3, SubscriptionStatus::PastDue))
            .await;
        self.central
            .insert_payment(payment("R2", 42, Some(5), PaymentType::Subscription))
            .await;
        self
    }

    /// Tenant 42 with its own store holding attempt "R1" for voucher 9
    async fn with_voucher_attempt(self, voucher_status: VoucherStatus) -> (Self, Arc<MemoryVoucherLedger>) {
        self.central
            .insert_tenant(tenant(42, "cafe-central", Some(3), TenantStatus::Active, None))
            .await;
        let store = self.router.provision("tenant_cafe_central").await;
        store.insert_attempt(attempt("R1", 1500, Some(9))).await;
        store.insert_voucher(voucher(9, voucher_status)).await;
        (self, store)
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

fn owner(id: i64) -> TenantOwner {
    TenantOwner {
        id,
        name: "Amina".to_string(),
        email: "amina@example.com".to_string(),
    }
}

fn tenant(
    id: i64,
    slug: &str,
    plan_id: Option<i64>,
    status: TenantStatus,
    owner_id: Option<i64>,
) -> Tenant {
    Tenant {
        id,
        slug: slug.to_string(),
        name: slug.to_string(),
        email: format!("{}@example.com", slug),
        database_name: Tenant::database_name_for(slug),
        plan_id,
        status,
        owner_id,
        created_at: now(),
        updated_at: now(),
    }
}

fn subscription(id: i64, tenant_id: i64, plan_id: i64, status: SubscriptionStatus) -> Subscription {
    Subscription {
        id,
        tenant_id,
        plan_id,
        status,
        starts_at: now(),
        current_period_start: None,
        current_period_end: None,
        next_payment_date: None,
        created_at: now(),
        updated_at: now(),
    }
}

fn payment(
    reference: &str,
    tenant_id: i64,
    subscription_id: Option<i64>,
    payment_type: PaymentType,
) -> Payment {
    Payment {
        id: 1,
        tenant_id,
        subscription_id,
        campay_reference: reference.to_string(),
        status: PaymentStatus::Pending,
        campay_status: None,
        payment_type,
        amount_fcfa: 10_000,
        meta: PaymentMeta::default(),
        paid_at: None,
        created_at: now(),
        updated_at: now(),
    }
}

fn attempt(reference: &str, amount_fcfa: i64, voucher_id: Option<i64>) -> PaymentAttempt {
    PaymentAttempt {
        id: 1,
        reference: reference.to_string(),
        status: AttemptStatus::Pending,
        amount_fcfa,
        meta: voucher_id.map(PaymentMeta::for_voucher).unwrap_or_default(),
        completed_at: None,
        failure_reason: None,
        created_at: now(),
        updated_at: now(),
    }
}

fn voucher(id: i64, status: VoucherStatus) -> Voucher {
    Voucher {
        id,
        code: format!("WIFI-{:04}", id),
        package_id: Some(1),
        status,
        purchased_at: None,
        purchase_amount_fcfa: None,
        payment_reference: None,
        created_at: now(),
        updated_at: now(),
    }
}

fn tenant_callback(reference: &str, status: &str) -> Value {
    json!({
        "reference": reference,
        "status": status,
        "external_reference": "TENANT_42_x",
        "operator": "MTN",
    })
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    // =========================================================================
    // Missing reference or status: rejected before any store, journal included
    // =========================================================================
    #[tokio::test]
    async fn test_incomplete_payload_rejected_without_store_access() {
        let fx = Fixture::new().with_subscription_payment().await;
        // An unreachable store would turn any lookup into StoreUnavailable
        fx.central.set_available(false);

        for body in [
            json!({"status": "SUCCESSFUL"}),
            json!({"reference": "R2"}),
            json!({"reference": "", "status": "SUCCESSFUL"}),
            json!("R2"),
        ] {
            let err = fx.reconciler.handle(body).await.unwrap_err();
            assert!(matches!(err, BillingError::Validation(_)), "got {err}");
        }

        fx.central.set_available(true);
        let payment = fx.central.payment("R2").await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert!(payment.meta.callbacks.is_empty());

        assert!(fx.journal.records().await.is_empty());
        assert_eq!(fx.router.switch_count(), 0);
    }
}

#[cfg(test)]
mod central_tests {
    use super::*;

    // =========================================================================
    // SUCCESSFUL subscription payment: payment, subscription, tenant, one notice
    // =========================================================================
    #[tokio::test]
    async fn test_subscription_payment_activates_tenant() {
        let fx = Fixture::new().with_subscription_payment().await;

        let outcome = fx
            .reconciler
            .handle(json!({"reference": "R2", "status": "SUCCESSFUL", "operator": "ORANGE"}))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::ProcessedCentral);
        assert_eq!(outcome.message(), "Processed Central Payment");

        let payment = fx.central.payment("R2").await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert!(payment.paid_at.is_some());
        assert_eq!(payment.campay_status.as_deref(), Some("SUCCESSFUL"));
        assert_eq!(payment.meta.callbacks.len(), 1);
        assert_eq!(payment.meta.callbacks[0].payload["operator"], "ORANGE");

        let sub = fx.central.subscription(5).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        let start = sub.current_period_start.unwrap();
        let end = sub.current_period_end.unwrap();
        assert!(end > start);
        assert_eq!(sub.next_payment_date, Some(end));

        let tenant = fx.central.tenant(42).await.unwrap();
        assert_eq!(tenant.plan_id, Some(sub.plan_id));
        assert_eq!(tenant.status, TenantStatus::Active);

        let sent = fx.notifier.sent().await;
        assert_eq!(sent, vec![("R2".to_string(), "amina@example.com".to_string())]);
    }

    // =========================================================================
    // Re-delivery of a completed payment: no mutation, no second notice
    // =========================================================================
    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let fx = Fixture::new().with_subscription_payment().await;
        let body = json!({"reference": "R2", "status": "SUCCESSFUL"});

        fx.reconciler.handle(body.clone()).await.unwrap();
        let before = fx.central.payment("R2").await.unwrap();
        let sub_before = fx.central.subscription(5).await.unwrap();

        let outcome = fx.reconciler.handle(body).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::AlreadyProcessed);
        assert_eq!(outcome.message(), "Already Processed");

        let after = fx.central.payment("R2").await.unwrap();
        assert_eq!(after.meta, before.meta);
        assert_eq!(after.updated_at, before.updated_at);
        let sub_after = fx.central.subscription(5).await.unwrap();
        assert_eq!(sub_after.current_period_end, sub_before.current_period_end);

        // A late FAILED cannot reopen a completed payment either
        let outcome = fx
            .reconciler
            .handle(json!({"reference": "R2", "status": "FAILED"}))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::AlreadyProcessed);
        assert_eq!(
            fx.central.payment("R2").await.unwrap().status,
            PaymentStatus::Completed
        );

        assert_eq!(fx.notifier.sent().await.len(), 1);
    }

    // =========================================================================
    // FAILED subscription payment: payment only
    // =========================================================================
    #[tokio::test]
    async fn test_failed_payment_leaves_subscription_and_tenant() {
        let fx = Fixture::new().with_subscription_payment().await;

        let outcome = fx
            .reconciler
            .handle(json!({"reference": "R2", "status": "FAILED"}))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::ProcessedCentral);

        let payment = fx.central.payment("R2").await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Failed);
        assert_eq!(payment.campay_status.as_deref(), Some("FAILED"));
        assert!(payment.paid_at.is_none());
        assert_eq!(payment.meta.callbacks.len(), 1);

        let sub = fx.central.subscription(5).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert!(sub.current_period_start.is_none());

        let tenant = fx.central.tenant(42).await.unwrap();
        assert_eq!(tenant.plan_id, None);
        assert_eq!(tenant.status, TenantStatus::Suspended);

        assert!(fx.notifier.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_lower_case_status_is_stored_as_sent() {
        let fx = Fixture::new().with_subscription_payment().await;
        fx.reconciler
            .handle(json!({"reference": "R2", "status": "failed"}))
            .await
            .unwrap();

        let payment = fx.central.payment("R2").await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Failed);
        assert_eq!(payment.campay_status.as_deref(), Some("failed"));
    }

    #[tokio::test]
    async fn test_cancelled_central_payment_is_failed() {
        let fx = Fixture::new().with_subscription_payment().await;
        fx.reconciler
            .handle(json!({"reference": "R2", "status": "CANCELLED"}))
            .await
            .unwrap();
        assert_eq!(
            fx.central.payment("R2").await.unwrap().status,
            PaymentStatus::Failed
        );
    }

    // =========================================================================
    // Non-terminal gateway status is logged, nothing transitions
    // =========================================================================
    #[tokio::test]
    async fn test_pending_status_only_recorded() {
        let fx = Fixture::new().with_subscription_payment().await;

        let outcome = fx
            .reconciler
            .handle(json!({"reference": "R2", "status": "PENDING"}))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::ProcessedCentral);

        let payment = fx.central.payment("R2").await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.campay_status.as_deref(), Some("PENDING"));
        assert_eq!(payment.meta.callbacks.len(), 1);
        assert!(fx.notifier.sent().await.is_empty());
    }

    // =========================================================================
    // A payment first reported FAILED can still complete later
    // =========================================================================
    #[tokio::test]
    async fn test_failed_payment_completes_on_later_success() {
        let fx = Fixture::new().with_subscription_payment().await;

        fx.reconciler
            .handle(json!({"reference": "R2", "status": "FAILED"}))
            .await
            .unwrap();
        let outcome = fx
            .reconciler
            .handle(json!({"reference": "R2", "status": "SUCCESSFUL"}))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::ProcessedCentral);

        let payment = fx.central.payment("R2").await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        let statuses: Vec<&str> = payment
            .meta
            .callbacks
            .iter()
            .map(|c| c.gateway_status.as_str())
            .collect();
        assert_eq!(statuses, vec!["FAILED", "SUCCESSFUL"]);
        assert_eq!(fx.notifier.sent().await.len(), 1);
    }

    // =========================================================================
    // Activating a subscription retires the tenant's other current one
    // =========================================================================
    #[tokio::test]
    async fn test_activation_supersedes_previous_subscription() {
        let fx = Fixture::new().with_subscription_payment().await;
        fx.central
            .insert_subscription(subscription(4, 42, 1, SubscriptionStatus::Active))
            .await;

        fx.reconciler
            .handle(json!({"reference": "R2", "status": "SUCCESSFUL"}))
            .await
            .unwrap();

        assert_eq!(
            fx.central.subscription(4).await.unwrap().status,
            SubscriptionStatus::Cancelled
        );
        assert_eq!(
            fx.central.subscription(5).await.unwrap().status,
            SubscriptionStatus::Active
        );

        let checker = crate::invariants::InvariantChecker::new(fx.central.clone());
        assert!(checker.run_all_checks().await.unwrap().healthy);
    }

    // =========================================================================
    // Non-subscription payments complete without touching subscriptions
    // =========================================================================
    #[tokio::test]
    async fn test_other_payment_type_only_completes_payment() {
        let fx = Fixture::new().with_subscription_payment().await;
        fx.central
            .insert_payment(payment("R3", 42, Some(5), PaymentType::Other))
            .await;

        fx.reconciler
            .handle(json!({"reference": "R3", "status": "SUCCESSFUL"}))
            .await
            .unwrap();

        assert_eq!(
            fx.central.payment("R3").await.unwrap().status,
            PaymentStatus::Completed
        );
        assert_eq!(
            fx.central.subscription(5).await.unwrap().status,
            SubscriptionStatus::PastDue
        );
        // Owner is still told about the payment
        assert_eq!(fx.notifier.sent().await.len(), 1);
    }

    // =========================================================================
    // Notification failure never rolls back the ledger
    // =========================================================================
    #[tokio::test]
    async fn test_notification_failure_keeps_transition() {
        let fx = Fixture::new().with_subscription_payment().await;
        fx.notifier.fail_deliveries(true);

        let outcome = fx
            .reconciler
            .handle(json!({"reference": "R2", "status": "SUCCESSFUL"}))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::ProcessedCentral);
        assert_eq!(
            fx.central.payment("R2").await.unwrap().status,
            PaymentStatus::Completed
        );
        assert_eq!(fx.notifier.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn test_tenant_without_owner_gets_no_notice() {
        let fx = Fixture::new();
        fx.central
            .insert_tenant(tenant(8, "market", None, TenantStatus::Active, None))
            .await;
        fx.central
            .insert_payment(payment("R8", 8, None, PaymentType::Subscription))
            .await;

        fx.reconciler
            .handle(json!({"reference": "R8", "status": "SUCCESSFUL"}))
            .await
            .unwrap();
        assert!(fx.notifier.sent().await.is_empty());
    }
}

#[cfg(test)]
mod tenant_tests {
    use super::*;

    // =========================================================================
    // R1 scenario: tenant attempt succeeds, voucher sold
    // =========================================================================
    #[tokio::test]
    async fn test_tenant_purchase_sells_voucher() {
        let (fx, store) = Fixture::new()
            .with_voucher_attempt(VoucherStatus::Available)
            .await;

        let outcome = fx
            .reconciler
            .handle(tenant_callback("R1", "SUCCESSFUL"))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::ProcessedTenant);
        assert_eq!(outcome.message(), "Processed Tenant Payment");

        let attempt = store.attempt("R1").await.unwrap();
        assert_eq!(attempt.status, AttemptStatus::Success);
        assert!(attempt.completed_at.is_some());
        assert_eq!(attempt.meta.callbacks.len(), 1);
        assert_eq!(attempt.meta.callbacks[0].payload["operator"], "MTN");

        let voucher = store.voucher(9).await.unwrap();
        assert_eq!(voucher.status, VoucherStatus::Sold);
        assert_eq!(voucher.purchase_amount_fcfa, Some(attempt.amount_fcfa));
        assert_eq!(voucher.payment_reference.as_deref(), Some("R1"));
        assert!(voucher.purchased_at.is_some());

        // Central ledger is never written for tenant purchases
        assert!(fx.central.payment("R1").await.is_none());
        assert!(fx.notifier.sent().await.is_empty());
    }

    // =========================================================================
    // Voucher already sold: attempt still succeeds, voucher untouched, audited
    // =========================================================================
    #[tokio::test]
    async fn test_already_sold_voucher_is_not_sold_twice() {
        let (fx, store) = Fixture::new()
            .with_voucher_attempt(VoucherStatus::Sold)
            .await;
        let before = store.voucher(9).await.unwrap();

        let outcome = fx
            .reconciler
            .handle(tenant_callback("R1", "SUCCESSFUL"))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::ProcessedTenant);

        let attempt = store.attempt("R1").await.unwrap();
        assert_eq!(attempt.status, AttemptStatus::Success);
        let note = attempt.meta.callbacks[0].note.as_deref().unwrap();
        assert!(note.contains("voucher 9 is sold"), "{note}");

        let after = store.voucher(9).await.unwrap();
        assert_eq!(after.payment_reference, before.payment_reference);
        assert_eq!(after.updated_at, before.updated_at);

        let records = fx.journal.records().await;
        let detail = records.last().unwrap().detail.as_deref().unwrap();
        assert!(detail.starts_with("inventory skipped"), "{detail}");
    }

    #[tokio::test]
    async fn test_missing_voucher_does_not_block_attempt() {
        let (fx, store) = Fixture::new()
            .with_voucher_attempt(VoucherStatus::Available)
            .await;
        store.insert_attempt(attempt("R4", 500, Some(404))).await;
        store.insert_attempt(attempt("R5", 500, None)).await;

        for reference in ["R4", "R5"] {
            let outcome = fx
                .reconciler
                .handle(tenant_callback(reference, "SUCCESSFUL"))
                .await
                .unwrap();
            assert_eq!(outcome, ReconcileOutcome::ProcessedTenant);
            assert_eq!(
                store.attempt(reference).await.unwrap().status,
                AttemptStatus::Success
            );
        }
        assert_eq!(store.voucher(9).await.unwrap().status, VoucherStatus::Available);
    }

    // =========================================================================
    // FAILED / CANCELLED: lower-cased status, reason stamped, voucher untouched
    // =========================================================================
    #[tokio::test]
    async fn test_failed_and_cancelled_attempts() {
        let (fx, store) = Fixture::new()
            .with_voucher_attempt(VoucherStatus::Reserved)
            .await;
        store.insert_attempt(attempt("R6", 500, Some(9))).await;

        let mut failed = tenant_callback("R1", "FAILED");
        failed["reason"] = json!("Insufficient balance");
        fx.reconciler.handle(failed).await.unwrap();
        fx.reconciler
            .handle(tenant_callback("R6", "CANCELLED"))
            .await
            .unwrap();

        let r1 = store.attempt("R1").await.unwrap();
        assert_eq!(r1.status, AttemptStatus::Failed);
        assert_eq!(r1.failure_reason.as_deref(), Some("Insufficient balance"));
        assert!(r1.completed_at.is_some());

        let r6 = store.attempt("R6").await.unwrap();
        assert_eq!(r6.status, AttemptStatus::Cancelled);
        assert_eq!(
            r6.failure_reason.as_deref(),
            Some(crate::transitions::DEFAULT_CANCEL_REASON)
        );

        assert_eq!(store.voucher(9).await.unwrap().status, VoucherStatus::Reserved);
    }

    #[tokio::test]
    async fn test_successful_attempt_redelivery_is_idempotent() {
        let (fx, store) = Fixture::new()
            .with_voucher_attempt(VoucherStatus::Available)
            .await;

        fx.reconciler
            .handle(tenant_callback("R1", "SUCCESSFUL"))
            .await
            .unwrap();
        let outcome = fx
            .reconciler
            .handle(tenant_callback("R1", "SUCCESSFUL"))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::AlreadyProcessed);
        assert_eq!(store.attempt("R1").await.unwrap().meta.callbacks.len(), 1);
    }
}

#[cfg(test)]
mod resolution_tests {
    use super::*;
    use crate::payload::GatewayCallback;
    use crate::reconciler::{Resolution, UnresolvedReason};

    // =========================================================================
    // Unresolvable callbacks are acknowledged, not retried
    // =========================================================================
    #[tokio::test]
    async fn test_unresolvable_callbacks_are_not_found() {
        let (fx, _store) = Fixture::new()
            .with_voucher_attempt(VoucherStatus::Available)
            .await;

        for body in [
            json!({"reference": "R404", "status": "SUCCESSFUL"}),
            json!({"reference": "R1", "status": "SUCCESSFUL", "external_reference": "ORDER_42_x"}),
            json!({"reference": "R1", "status": "SUCCESSFUL", "external_reference": "TENANT_abc_x"}),
            json!({"reference": "R1", "status": "SUCCESSFUL", "external_reference": "TENANT_99_x"}),
            json!({"reference": "R404", "status": "SUCCESSFUL", "external_reference": "TENANT_42_x"}),
        ] {
            let outcome = fx.reconciler.handle(body.clone()).await.unwrap();
            assert_eq!(outcome, ReconcileOutcome::NotFound, "{body}");
            assert_eq!(outcome.message(), "Payment Not Found");
        }

        let records = fx.journal.records().await;
        assert!(records.iter().all(|r| r.outcome == CallbackOutcome::NotFound));
        assert_eq!(records[3].tenant_id, Some(99));
    }

    // =========================================================================
    // Central match wins even when a tenant store holds the same reference
    // =========================================================================
    #[tokio::test]
    async fn test_central_match_takes_precedence() {
        let (fx, store) = Fixture::new()
            .with_voucher_attempt(VoucherStatus::Available)
            .await;
        fx.central
            .insert_payment(payment("R1", 42, None, PaymentType::Other))
            .await;

        let callback = GatewayCallback::from_json(tenant_callback("R1", "SUCCESSFUL"), now()).unwrap();
        let resolution = fx.reconciler.resolve(&callback).await.unwrap();
        assert!(matches!(resolution, Resolution::Central(ref p) if p.campay_reference == "R1"));
        assert_eq!(fx.router.switch_count(), 0);

        let outcome = fx
            .reconciler
            .handle(tenant_callback("R1", "SUCCESSFUL"))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::ProcessedCentral);
        assert_eq!(store.attempt("R1").await.unwrap().status, AttemptStatus::Pending);
        assert_eq!(store.voucher(9).await.unwrap().status, VoucherStatus::Available);
    }

    #[tokio::test]
    async fn test_resolution_reports_reason() {
        let (fx, _store) = Fixture::new()
            .with_voucher_attempt(VoucherStatus::Available)
            .await;

        let callback = GatewayCallback::from_json(
            json!({"reference": "R1", "status": "SUCCESSFUL", "external_reference": "TENANT_7_x"}),
            now(),
        )
        .unwrap();
        let resolution = fx.reconciler.resolve(&callback).await.unwrap();
        assert!(matches!(
            resolution,
            Resolution::Unresolved(UnresolvedReason::UnknownTenant { tenant_id: 7 })
        ));

        let callback = GatewayCallback::from_json(tenant_callback("R1", "SUCCESSFUL"), now()).unwrap();
        match fx.reconciler.resolve(&callback).await.unwrap() {
            Resolution::Tenant {
                tenant,
                connection,
                attempt,
            } => {
                assert_eq!(tenant.id, 42);
                assert_eq!(connection.database_name(), "tenant_cafe_central");
                assert_eq!(attempt.reference, "R1");
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }
}

#[cfg(test)]
mod outage_tests {
    use super::*;

    // =========================================================================
    // Central store down: processing fails, nothing acknowledged
    // =========================================================================
    #[tokio::test]
    async fn test_central_store_unavailable() {
        let fx = Fixture::new().with_subscription_payment().await;
        fx.central.set_available(false);

        let err = fx
            .reconciler
            .handle(json!({"reference": "R2", "status": "SUCCESSFUL"}))
            .await
            .unwrap_err();
        assert!(err.is_store_unavailable());

        fx.central.set_available(true);
        assert_eq!(
            fx.central.payment("R2").await.unwrap().status,
            PaymentStatus::Pending
        );
        assert!(fx.notifier.sent().await.is_empty());

        let records = fx.journal.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, CallbackOutcome::Failed);
    }

    // =========================================================================
    // Tenant store down: no tenant-scoped work attempted
    // =========================================================================
    #[tokio::test]
    async fn test_tenant_store_unavailable() {
        let (fx, store) = Fixture::new()
            .with_voucher_attempt(VoucherStatus::Available)
            .await;
        fx.router.set_unavailable("tenant_cafe_central", true).await;

        let err = fx
            .reconciler
            .handle(tenant_callback("R1", "SUCCESSFUL"))
            .await
            .unwrap_err();
        match err {
            BillingError::StoreUnavailable { store, .. } => {
                assert_eq!(store, "tenant:tenant_cafe_central")
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(store.attempt("R1").await.unwrap().status, AttemptStatus::Pending);
        assert_eq!(store.voucher(9).await.unwrap().status, VoucherStatus::Available);

        // Store back: the gateway retry goes through
        fx.router.set_unavailable("tenant_cafe_central", false).await;
        let outcome = fx
            .reconciler
            .handle(tenant_callback("R1", "SUCCESSFUL"))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::ProcessedTenant);
    }
}

#[cfg(test)]
mod concurrency_tests {
    use super::*;
    use tokio::sync::Barrier;

    const DELIVERIES: usize = 10;

    async fn deliver_concurrently(reconciler: Arc<WebhookReconciler>, body: Value) -> Vec<ReconcileOutcome> {
        let barrier = Arc::new(Barrier::new(DELIVERIES));
        let mut handles = vec![];

        for _ in 0..DELIVERIES {
            let reconciler = Arc::clone(&reconciler);
            let barrier = Arc::clone(&barrier);
            let body = body.clone();

            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                reconciler.handle(body).await.unwrap()
            }));
        }

        let mut outcomes = vec![];
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }
        outcomes
    }

    // =========================================================================
    // N identical central deliveries: one transition, one notification
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_central_deliveries() {
        let fx = Fixture::new().with_subscription_payment().await;

        let outcomes = deliver_concurrently(
            fx.reconciler.clone(),
            json!({"reference": "R2", "status": "SUCCESSFUL"}),
        )
        .await;

        let processed = outcomes
            .iter()
            .filter(|o| **o == ReconcileOutcome::ProcessedCentral)
            .count();
        let duplicates = outcomes
            .iter()
            .filter(|o| **o == ReconcileOutcome::AlreadyProcessed)
            .count();
        assert_eq!(processed, 1, "exactly one delivery should transition");
        assert_eq!(duplicates, DELIVERIES - 1);

        assert_eq!(fx.notifier.sent().await.len(), 1);
        assert_eq!(fx.central.payment("R2").await.unwrap().meta.callbacks.len(), 1);
    }

    // =========================================================================
    // N identical tenant deliveries: one transition, one voucher sale
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tenant_deliveries() {
        let (fx, store) = Fixture::new()
            .with_voucher_attempt(VoucherStatus::Available)
            .await;

        let outcomes =
            deliver_concurrently(fx.reconciler.clone(), tenant_callback("R1", "SUCCESSFUL")).await;

        let processed = outcomes
            .iter()
            .filter(|o| **o == ReconcileOutcome::ProcessedTenant)
            .count();
        assert_eq!(processed, 1);

        let attempt = store.attempt("R1").await.unwrap();
        assert_eq!(attempt.meta.callbacks.len(), 1);
        // No skip note: the only sale found the voucher available
        assert!(attempt.meta.callbacks[0].note.is_none());
        assert_eq!(store.voucher(9).await.unwrap().status, VoucherStatus::Sold);
    }

    // =========================================================================
    // Different tenants in flight at once never see each other's store
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tenants_are_isolated() {
        let fx = Fixture::new();
        let mut stores = vec![];
        for id in 1..=4_i64 {
            let slug = format!("site-{}", id);
            fx.central
                .insert_tenant(tenant(id, &slug, None, TenantStatus::Active, None))
                .await;
            let store = fx.router.provision(&Tenant::database_name_for(&slug)).await;
            store.insert_attempt(attempt("SAME-REF", 100 * id, Some(id))).await;
            store.insert_voucher(voucher(id, VoucherStatus::Available)).await;
            stores.push(store);
        }

        let mut handles = vec![];
        for id in 1..=4_i64 {
            let reconciler = fx.reconciler.clone();
            handles.push(tokio::spawn(async move {
                reconciler
                    .handle(json!({
                        "reference": "SAME-REF",
                        "status": "SUCCESSFUL",
                        "external_reference": format!("TENANT_{}_x", id),
                    }))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), ReconcileOutcome::ProcessedTenant);
        }

        for (i, store) in stores.iter().enumerate() {
            let id = i as i64 + 1;
            let voucher = store.voucher(id).await.unwrap();
            assert_eq!(voucher.status, VoucherStatus::Sold);
            assert_eq!(voucher.purchase_amount_fcfa, Some(100 * id));
        }
    }
}
