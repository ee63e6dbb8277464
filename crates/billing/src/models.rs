//! Ledger records
//!
//! `Tenant`, `Subscription` and `Payment` live in the central store.
//! `PaymentAttempt` and `Voucher` live in each tenant's own store. The two
//! sides share no keys; they are linked only through the `TENANT_<id>_...`
//! external reference carried by gateway callbacks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::BillingError;
use crate::payload::PaymentMeta;

fn unknown(kind: &str, value: &str) -> BillingError {
    BillingError::CorruptRecord(format!("unknown {} '{}'", kind, value))
}

// =============================================================================
// Tenant
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
    Cancelled,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for TenantStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TenantStatus::Active),
            "suspended" => Ok(TenantStatus::Suspended),
            "cancelled" => Ok(TenantStatus::Cancelled),
            other => Err(unknown("tenant status", other)),
        }
    }
}

/// A location selling WiFi access, owning one isolated store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: i64,
    /// Unique and immutable after creation
    pub slug: String,
    pub name: String,
    pub email: String,
    /// Locator of the tenant's isolated store, derived once from the slug
    pub database_name: String,
    pub plan_id: Option<i64>,
    pub status: TenantStatus,
    pub owner_id: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Tenant {
    /// Store name for a freshly provisioned tenant
    pub fn database_name_for(slug: &str) -> String {
        let normalized: String = slug
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("tenant_{}", normalized)
    }
}

/// Registered owner of a tenant, target of payment notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantOwner {
    pub id: i64,
    pub name: String,
    pub email: String,
}

// =============================================================================
// Subscription
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses that still count as the tenant's current subscription
    pub fn is_current(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::PastDue)
    }
}

impl FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            other => Err(unknown("subscription status", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub tenant_id: i64,
    pub plan_id: i64,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_payment_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

// =============================================================================
// Payment (central)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    /// Terminal: webhook processing never touches a completed payment again
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(unknown("payment status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentType {
    Subscription,
    Other,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::Subscription => "subscription",
            PaymentType::Other => "other",
        }
    }
}

impl FromStr for PaymentType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscription" => Ok(PaymentType::Subscription),
            // Any other purpose is settled the same way
            _ => Ok(PaymentType::Other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub tenant_id: i64,
    pub subscription_id: Option<i64>,
    /// Gateway correlation key, unique across central payments
    pub campay_reference: String,
    pub status: PaymentStatus,
    /// Last raw status reported by the gateway
    pub campay_status: Option<String>,
    pub payment_type: PaymentType,
    pub amount_fcfa: i64,
    pub meta: PaymentMeta,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

// =============================================================================
// PaymentAttempt (tenant store)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Pending,
    /// Terminal
    Success,
    Failed,
    Cancelled,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Success => "success",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for AttemptStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AttemptStatus::Pending),
            "success" => Ok(AttemptStatus::Success),
            "failed" => Ok(AttemptStatus::Failed),
            "cancelled" => Ok(AttemptStatus::Cancelled),
            other => Err(unknown("payment attempt status", other)),
        }
    }
}

/// A voucher purchase attempt inside a tenant store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub id: i64,
    /// Gateway correlation key, unique within the tenant store
    pub reference: String,
    pub status: AttemptStatus,
    pub amount_fcfa: i64,
    /// Carries `voucher_id`, the voucher reserved for this purchase
    pub meta: PaymentMeta,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

// =============================================================================
// Voucher (tenant store)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoucherStatus {
    Available,
    Reserved,
    Sold,
}

impl VoucherStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoucherStatus::Available => "available",
            VoucherStatus::Reserved => "reserved",
            VoucherStatus::Sold => "sold",
        }
    }
}

impl fmt::Display for VoucherStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoucherStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(VoucherStatus::Available),
            "reserved" => Ok(VoucherStatus::Reserved),
            "sold" => Ok(VoucherStatus::Sold),
            other => Err(unknown("voucher status", other)),
        }
    }
}

/// A sellable WiFi access credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voucher {
    pub id: i64,
    pub code: String,
    pub package_id: Option<i64>,
    pub status: VoucherStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub purchased_at: Option<OffsetDateTime>,
    pub purchase_amount_fcfa: Option<i64>,
    /// Gateway reference of the payment that sold this voucher
    pub payment_reference: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_name_derived_from_slug() {
        assert_eq!(Tenant::database_name_for("cafe-central"), "tenant_cafe_central");
        assert_eq!(Tenant::database_name_for("Hotel.Plaza"), "tenant_hotel_plaza");
    }

    #[test]
    fn test_status_text_round_trip() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>().unwrap(), status);
        }
        assert!("refunded".parse::<PaymentStatus>().is_err());
        assert_eq!("sold".parse::<VoucherStatus>().unwrap(), VoucherStatus::Sold);
    }

    #[test]
    fn test_unknown_payment_type_is_other() {
        assert_eq!("subscription".parse::<PaymentType>().unwrap(), PaymentType::Subscription);
        assert_eq!("topup".parse::<PaymentType>().unwrap(), PaymentType::Other);
    }
}
