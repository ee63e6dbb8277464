//! Ledger state machines
//!
//! Pure functions over in-memory records. Stores lock the rows, call these,
//! and persist whatever changed, so the rules live in one place for both
//! the PostgreSQL and in-memory backends.
//!
//! - Payment: pending -> completed | failed. Completed is terminal.
//! - PaymentAttempt: pending -> success | failed | cancelled. Success is terminal.
//! - Subscription: any -> active on a successful subscription payment.
//! - Voucher: available -> sold, only from a successful attempt.

use std::fmt;

use time::{Date, Duration, Month, OffsetDateTime};

use crate::models::{
    AttemptStatus, Payment, PaymentAttempt, PaymentStatus, Subscription, SubscriptionStatus,
    Tenant, TenantStatus, Voucher, VoucherStatus,
};
use crate::payload::{CallbackEntry, GatewayStatus};

pub const DEFAULT_FAILURE_REASON: &str = "Payment failed";
pub const DEFAULT_CANCEL_REASON: &str = "Payment cancelled";

/// Same day next month, clamped to the last day of a shorter month
pub fn add_one_month(at: OffsetDateTime) -> OffsetDateTime {
    let (year, month) = match at.month() {
        Month::December => (at.year() + 1, Month::January),
        m => (at.year(), m.next()),
    };
    let day = at.day().min(time::util::days_in_year_month(year, month));
    match Date::from_calendar_date(year, month, day) {
        Ok(date) => at.replace_date(date),
        Err(_) => at + Duration::days(30),
    }
}

// =============================================================================
// Central
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentSettlement {
    /// Payment was already completed; nothing was touched
    AlreadyCompleted,
    Completed,
    Failed,
    /// Non-terminal gateway status, only logged
    Recorded,
}

pub fn settle_payment(
    payment: &mut Payment,
    status: &GatewayStatus,
    entry: CallbackEntry,
    now: OffsetDateTime,
) -> PaymentSettlement {
    if payment.status == PaymentStatus::Completed {
        return PaymentSettlement::AlreadyCompleted;
    }

    payment.campay_status = Some(entry.gateway_status.clone());
    payment.meta.record(entry);
    payment.updated_at = now;

    match status {
        GatewayStatus::Successful => {
            payment.status = PaymentStatus::Completed;
            payment.paid_at = Some(now);
            PaymentSettlement::Completed
        }
        // Central payments have no cancelled state
        GatewayStatus::Failed | GatewayStatus::Cancelled => {
            payment.status = PaymentStatus::Failed;
            PaymentSettlement::Failed
        }
        GatewayStatus::Other(_) => PaymentSettlement::Recorded,
    }
}

/// Start a fresh one-month period
pub fn renew_subscription(subscription: &mut Subscription, now: OffsetDateTime) {
    let period_end = add_one_month(now);
    subscription.status = SubscriptionStatus::Active;
    subscription.current_period_start = Some(now);
    subscription.current_period_end = Some(period_end);
    subscription.next_payment_date = Some(period_end);
    subscription.updated_at = now;
}

/// Retire a subscription replaced by a newly activated one for the same tenant
pub fn supersede_subscription(subscription: &mut Subscription, now: OffsetDateTime) {
    subscription.status = SubscriptionStatus::Cancelled;
    subscription.updated_at = now;
}

/// Propagate the paid plan onto the tenant
pub fn adopt_plan(tenant: &mut Tenant, plan_id: i64, now: OffsetDateTime) {
    tenant.plan_id = Some(plan_id);
    tenant.status = TenantStatus::Active;
    tenant.updated_at = now;
}

// =============================================================================
// Tenant store
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptSettlement {
    AlreadySucceeded,
    Succeeded,
    Failed(AttemptStatus),
    Recorded,
}

pub fn settle_attempt(
    attempt: &mut PaymentAttempt,
    status: &GatewayStatus,
    reason: Option<&str>,
    entry: CallbackEntry,
    now: OffsetDateTime,
) -> AttemptSettlement {
    if attempt.status == AttemptStatus::Success {
        return AttemptSettlement::AlreadySucceeded;
    }

    attempt.meta.record(entry);
    attempt.updated_at = now;

    let (terminal, default_reason) = match status {
        GatewayStatus::Successful => {
            attempt.status = AttemptStatus::Success;
            attempt.completed_at = Some(now);
            return AttemptSettlement::Succeeded;
        }
        GatewayStatus::Failed => (AttemptStatus::Failed, DEFAULT_FAILURE_REASON),
        GatewayStatus::Cancelled => (AttemptStatus::Cancelled, DEFAULT_CANCEL_REASON),
        GatewayStatus::Other(_) => return AttemptSettlement::Recorded,
    };

    attempt.status = terminal;
    attempt.completed_at = Some(now);
    attempt.failure_reason = Some(reason.unwrap_or(default_reason).to_string());
    AttemptSettlement::Failed(terminal)
}

/// Why a successful attempt did not sell its voucher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventorySkip {
    NoVoucherLinked,
    VoucherMissing { voucher_id: i64 },
    VoucherNotAvailable { voucher_id: i64, status: VoucherStatus },
}

impl fmt::Display for InventorySkip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InventorySkip::NoVoucherLinked => write!(f, "no voucher linked to attempt"),
            InventorySkip::VoucherMissing { voucher_id } => {
                write!(f, "voucher {} not found", voucher_id)
            }
            InventorySkip::VoucherNotAvailable { voucher_id, status } => {
                write!(f, "voucher {} is {}, not available", voucher_id, status)
            }
        }
    }
}

pub fn sell_voucher(
    voucher: &mut Voucher,
    amount_fcfa: i64,
    reference: &str,
    now: OffsetDateTime,
) -> Result<(), InventorySkip> {
    if voucher.status != VoucherStatus::Available {
        return Err(InventorySkip::VoucherNotAvailable {
            voucher_id: voucher.id,
            status: voucher.status,
        });
    }
    voucher.status = VoucherStatus::Sold;
    voucher.purchased_at = Some(now);
    voucher.purchase_amount_fcfa = Some(amount_fcfa);
    voucher.payment_reference = Some(reference.to_string());
    voucher.updated_at = now;
    Ok(())
}
