//! In-memory stores
//!
//! Behave like the PostgreSQL stores, including row locking: every
//! read-check-write runs under one `tokio::sync::Mutex` guard. Used by tests
//! and for running the API without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};

use crate::error::{BillingError, BillingResult};
use crate::invariants::{InvariantQueries, PlanMismatch};
use crate::journal::{CallbackJournal, CallbackOutcome, CallbackRecord};
use crate::ledger::{CentralLedger, CentralTransition};
use crate::models::{
    Payment, PaymentAttempt, PaymentStatus, PaymentType, Subscription, SubscriptionStatus, Tenant,
    TenantOwner, Voucher,
};
use crate::notifications::PaymentNotifier;
use crate::payload::{CallbackEntry, GatewayStatus};
use crate::tenancy::{ConnectionRouter, TenantConnection, TenantDirectory};
use crate::transitions::{
    adopt_plan, renew_subscription, sell_voucher, settle_attempt, settle_payment,
    supersede_subscription, AttemptSettlement, InventorySkip, PaymentSettlement,
};
use crate::vouchers::{TenantTransition, VoucherLedger};

// =============================================================================
// Central store
// =============================================================================

#[derive(Default)]
struct CentralState {
    tenants: HashMap<i64, Tenant>,
    owners: HashMap<i64, TenantOwner>,
    subscriptions: HashMap<i64, Subscription>,
    /// Keyed by `campay_reference`
    payments: HashMap<String, Payment>,
}

pub struct MemoryCentralStore {
    state: Mutex<CentralState>,
    available: AtomicBool,
}

impl Default for MemoryCentralStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCentralStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CentralState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the central database going away
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> BillingResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BillingError::store_unavailable("central", "connection refused"))
        }
    }

    pub async fn insert_tenant(&self, tenant: Tenant) {
        self.state.lock().await.tenants.insert(tenant.id, tenant);
    }

    pub async fn insert_owner(&self, owner: TenantOwner) {
        self.state.lock().await.owners.insert(owner.id, owner);
    }

    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.id, subscription);
    }

    pub async fn insert_payment(&self, payment: Payment) {
        self.state
            .lock()
            .await
            .payments
            .insert(payment.campay_reference.clone(), payment);
    }

    pub async fn tenant(&self, tenant_id: i64) -> Option<Tenant> {
        self.state.lock().await.tenants.get(&tenant_id).cloned()
    }

    pub async fn subscription(&self, subscription_id: i64) -> Option<Subscription> {
        self.state
            .lock()
            .await
            .subscriptions
            .get(&subscription_id)
            .cloned()
    }

    pub async fn payment(&self, reference: &str) -> Option<Payment> {
        self.state.lock().await.payments.get(reference).cloned()
    }
}

#[async_trait]
impl TenantDirectory for MemoryCentralStore {
    async fn find_tenant(&self, tenant_id: i64) -> BillingResult<Option<Tenant>> {
        self.ensure_available()?;
        Ok(self.tenant(tenant_id).await)
    }

    async fn find_owner(&self, tenant: &Tenant) -> BillingResult<Option<TenantOwner>> {
        self.ensure_available()?;
        let Some(owner_id) = tenant.owner_id else {
            return Ok(None);
        };
        Ok(self.state.lock().await.owners.get(&owner_id).cloned())
    }
}

#[async_trait]
impl CentralLedger for MemoryCentralStore {
    async fn find_payment(&self, reference: &str) -> BillingResult<Option<Payment>> {
        self.ensure_available()?;
        Ok(self.payment(reference).await)
    }

    async fn apply_payment_outcome(
        &self,
        reference: &str,
        status: &GatewayStatus,
        entry: CallbackEntry,
        now: OffsetDateTime,
    ) -> BillingResult<CentralTransition> {
        self.ensure_available()?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        // Work on copies so a half-applied unit is never visible
        let Some(mut payment) = state.payments.get(reference).cloned() else {
            return Ok(CentralTransition::NotFound);
        };

        let settlement = settle_payment(&mut payment, status, entry, now);
        match settlement {
            PaymentSettlement::AlreadyCompleted => {
                return Ok(CentralTransition::AlreadyProcessed { payment })
            }
            PaymentSettlement::Failed => {
                state.payments.insert(reference.to_string(), payment.clone());
                return Ok(CentralTransition::Failed { payment });
            }
            PaymentSettlement::Recorded => {
                state.payments.insert(reference.to_string(), payment.clone());
                return Ok(CentralTransition::Recorded { payment });
            }
            PaymentSettlement::Completed => {}
        }

        let mut renewed = None;
        let mut updated_tenant = None;
        if payment.payment_type == PaymentType::Subscription {
            if let Some(mut subscription) = payment
                .subscription_id
                .and_then(|id| state.subscriptions.get(&id).cloned())
            {
                renew_subscription(&mut subscription, now);
                let mut superseded = Vec::new();
                for other in state.subscriptions.values() {
                    if other.tenant_id == subscription.tenant_id
                        && other.id != subscription.id
                        && other.status.is_current()
                    {
                        let mut other = other.clone();
                        supersede_subscription(&mut other, now);
                        superseded.push(other);
                    }
                }

                let tenant = state.tenants.get(&subscription.tenant_id).cloned().map(|mut t| {
                    adopt_plan(&mut t, subscription.plan_id, now);
                    t
                });

                for other in superseded {
                    state.subscriptions.insert(other.id, other);
                }
                state
                    .subscriptions
                    .insert(subscription.id, subscription.clone());
                if let Some(t) = &tenant {
                    state.tenants.insert(t.id, t.clone());
                }
                renewed = Some(subscription);
                updated_tenant = tenant;
            }
        }

        state.payments.insert(reference.to_string(), payment.clone());
        Ok(CentralTransition::Completed {
            payment,
            subscription: renewed,
            tenant: updated_tenant,
        })
    }
}

#[async_trait]
impl InvariantQueries for MemoryCentralStore {
    async fn tenants_with_multiple_current_subscriptions(&self) -> BillingResult<Vec<(i64, i64)>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let mut counts: HashMap<i64, i64> = HashMap::new();
        for sub in state.subscriptions.values().filter(|s| s.status.is_current()) {
            *counts.entry(sub.tenant_id).or_default() += 1;
        }
        let mut rows: Vec<(i64, i64)> = counts.into_iter().filter(|(_, n)| *n > 1).collect();
        rows.sort();
        Ok(rows)
    }

    async fn tenant_plan_mismatches(&self) -> BillingResult<Vec<PlanMismatch>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let mut rows: Vec<PlanMismatch> = state
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active)
            .filter_map(|s| {
                let tenant = state.tenants.get(&s.tenant_id)?;
                (tenant.plan_id != Some(s.plan_id)).then(|| PlanMismatch {
                    tenant_id: tenant.id,
                    tenant_plan_id: tenant.plan_id,
                    subscription_id: s.id,
                    subscription_plan_id: s.plan_id,
                })
            })
            .collect();
        rows.sort_by_key(|r| r.subscription_id);
        Ok(rows)
    }

    async fn completed_payments_without_paid_at(&self) -> BillingResult<Vec<(i64, String)>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let mut rows: Vec<(i64, String)> = state
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Completed && p.paid_at.is_none())
            .map(|p| (p.tenant_id, p.campay_reference.clone()))
            .collect();
        rows.sort();
        Ok(rows)
    }

    async fn active_subscriptions_without_period(&self) -> BillingResult<Vec<(i64, i64)>> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        let mut rows: Vec<(i64, i64)> = state
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active)
            .filter(|s| s.current_period_start.is_none() || s.current_period_end.is_none())
            .map(|s| (s.tenant_id, s.id))
            .collect();
        rows.sort();
        Ok(rows)
    }
}

// =============================================================================
// Tenant stores
// =============================================================================

#[derive(Default)]
struct TenantState {
    /// Keyed by `reference`
    attempts: HashMap<String, PaymentAttempt>,
    vouchers: HashMap<i64, Voucher>,
}

/// One tenant's isolated store
#[derive(Default)]
pub struct MemoryVoucherLedger {
    state: Mutex<TenantState>,
}

impl MemoryVoucherLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_attempt(&self, attempt: PaymentAttempt) {
        self.state
            .lock()
            .await
            .attempts
            .insert(attempt.reference.clone(), attempt);
    }

    pub async fn insert_voucher(&self, voucher: Voucher) {
        self.state.lock().await.vouchers.insert(voucher.id, voucher);
    }

    pub async fn attempt(&self, reference: &str) -> Option<PaymentAttempt> {
        self.state.lock().await.attempts.get(reference).cloned()
    }

    pub async fn voucher(&self, voucher_id: i64) -> Option<Voucher> {
        self.state.lock().await.vouchers.get(&voucher_id).cloned()
    }
}

#[async_trait]
impl VoucherLedger for MemoryVoucherLedger {
    async fn find_attempt(&self, reference: &str) -> BillingResult<Option<PaymentAttempt>> {
        Ok(self.attempt(reference).await)
    }

    async fn apply_attempt_outcome(
        &self,
        reference: &str,
        status: &GatewayStatus,
        reason: Option<&str>,
        entry: CallbackEntry,
        now: OffsetDateTime,
    ) -> BillingResult<TenantTransition> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(mut attempt) = state.attempts.get(reference).cloned() else {
            return Ok(TenantTransition::NotFound);
        };

        let transition = match settle_attempt(&mut attempt, status, reason, entry, now) {
            AttemptSettlement::AlreadySucceeded => {
                return Ok(TenantTransition::AlreadyProcessed { attempt })
            }
            AttemptSettlement::Failed(_) => TenantTransition::Failed {
                attempt: attempt.clone(),
            },
            AttemptSettlement::Recorded => TenantTransition::Recorded {
                attempt: attempt.clone(),
            },
            AttemptSettlement::Succeeded => {
                let sale = match attempt.meta.voucher_id {
                    None => Err(InventorySkip::NoVoucherLinked),
                    Some(voucher_id) => match state.vouchers.get(&voucher_id).cloned() {
                        None => Err(InventorySkip::VoucherMissing { voucher_id }),
                        Some(mut voucher) => {
                            sell_voucher(&mut voucher, attempt.amount_fcfa, reference, now)
                                .map(|_| voucher)
                        }
                    },
                };

                match sale {
                    Ok(voucher) => {
                        state.vouchers.insert(voucher.id, voucher.clone());
                        TenantTransition::Succeeded {
                            attempt: attempt.clone(),
                            voucher: Some(voucher),
                            inventory_skip: None,
                        }
                    }
                    Err(skip) => {
                        attempt.meta.annotate_last(format!("inventory skipped: {}", skip));
                        TenantTransition::Succeeded {
                            attempt: attempt.clone(),
                            voucher: None,
                            inventory_skip: Some(skip),
                        }
                    }
                }
            }
        };

        state.attempts.insert(reference.to_string(), attempt);
        Ok(transition)
    }
}

/// Routes tenants to in-memory stores keyed by `database_name`
#[derive(Default)]
pub struct MemoryConnectionRouter {
    stores: RwLock<HashMap<String, Arc<MemoryVoucherLedger>>>,
    unavailable: RwLock<Vec<String>>,
    switches: AtomicUsize,
}

impl MemoryConnectionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision a store for `database_name` and return it for seeding
    pub async fn provision(&self, database_name: &str) -> Arc<MemoryVoucherLedger> {
        let mut stores = self.stores.write().await;
        stores
            .entry(database_name.to_string())
            .or_insert_with(|| Arc::new(MemoryVoucherLedger::new()))
            .clone()
    }

    pub async fn set_unavailable(&self, database_name: &str, unavailable: bool) {
        let mut list = self.unavailable.write().await;
        list.retain(|name| name != database_name);
        if unavailable {
            list.push(database_name.to_string());
        }
    }

    /// Number of successful `switch_to` calls
    pub fn switch_count(&self) -> usize {
        self.switches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionRouter for MemoryConnectionRouter {
    async fn switch_to(&self, tenant: &Tenant) -> BillingResult<TenantConnection> {
        let store_label = format!("tenant:{}", tenant.database_name);
        if self
            .unavailable
            .read()
            .await
            .iter()
            .any(|name| name == &tenant.database_name)
        {
            return Err(BillingError::store_unavailable(store_label, "connection refused"));
        }

        let store = self
            .stores
            .read()
            .await
            .get(&tenant.database_name)
            .cloned()
            .ok_or_else(|| BillingError::store_unavailable(store_label, "database does not exist"))?;

        self.switches.fetch_add(1, Ordering::SeqCst);
        Ok(TenantConnection::new(
            tenant.id,
            tenant.database_name.clone(),
            store,
        ))
    }
}

// =============================================================================
// Journal and notifier
// =============================================================================

#[derive(Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<CallbackRecord>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<CallbackRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl CallbackJournal for MemoryJournal {
    async fn record(&self, record: &CallbackRecord) -> BillingResult<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn list(
        &self,
        outcome: Option<CallbackOutcome>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<CallbackRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .rev()
            .filter(|r| outcome.map_or(true, |o| r.outcome == o))
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

/// Notifier that remembers what it was asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every delivery fail, to exercise best-effort handling
    pub fn fail_deliveries(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// `(payment reference, owner email)` per delivery attempt
    pub async fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl PaymentNotifier for RecordingNotifier {
    async fn payment_received(
        &self,
        payment: &Payment,
        _tenant: &Tenant,
        owner: &TenantOwner,
    ) -> BillingResult<()> {
        self.sent
            .lock()
            .await
            .push((payment.campay_reference.clone(), owner.email.clone()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(BillingError::Notification("mailbox unreachable".to_string()));
        }
        Ok(())
    }
}
