// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries store names and reasons
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Hotspot Billing Core
//!
//! Reconciles Campay payment callbacks against a multi-tenant ledger.
//!
//! ## Features
//!
//! - **Central billing**: settle platform payments, renew subscriptions and
//!   carry the paid plan onto the tenant
//! - **Tenant vouchers**: settle voucher purchases inside each tenant's own
//!   store and mark the reserved voucher sold
//! - **Connection routing**: explicit per-operation tenant connections, no
//!   process-wide current tenant
//! - **Idempotence**: completed payments and successful attempts are never
//!   touched again, even under concurrent re-delivery
//! - **Callback journal**: one audit row per inbound delivery
//! - **Email Notifications**: payment received notices to tenant owners
//! - **Invariants**: runnable consistency checks over the central store

pub mod correlation;
pub mod error;
pub mod invariants;
pub mod journal;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod notifications;
pub mod payload;
pub mod postgres;
pub mod reconciler;
pub mod tenancy;
pub mod transitions;
pub mod vouchers;

#[cfg(test)]
mod edge_case_tests;

// Correlation
pub use correlation::{tenant_external_reference, CorrelationRef};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantQueries, InvariantViolation,
    ViolationSeverity,
};

// Journal
pub use journal::{CallbackJournal, CallbackOutcome, CallbackRecord};

// Ledgers
pub use ledger::{CentralLedger, CentralTransition};
pub use vouchers::{TenantTransition, VoucherLedger};

// Models
pub use models::{
    AttemptStatus, Payment, PaymentAttempt, PaymentStatus, PaymentType, Subscription,
    SubscriptionStatus, Tenant, TenantOwner, TenantStatus, Voucher, VoucherStatus,
};

// Notifications
pub use notifications::{BillingEmailService, EmailConfig, PaymentNotifier};

// Payload
pub use payload::{CallbackEntry, GatewayCallback, GatewayStatus, PaymentMeta};

// Stores
pub use memory::{
    MemoryCentralStore, MemoryConnectionRouter, MemoryJournal, MemoryVoucherLedger,
    RecordingNotifier,
};
pub use postgres::{PgCentralStore, PgConnectionRouter, PgVoucherLedger};

// Reconciler
pub use reconciler::{ReconcileOutcome, Resolution, UnresolvedReason, WebhookReconciler};

// Tenancy
pub use tenancy::{ConnectionRouter, TenantConnection, TenantDirectory};

// Transitions
pub use transitions::InventorySkip;
