//! PostgreSQL stores
//!
//! The central database holds tenants, owners, subscriptions, payments and
//! the callback journal. Every tenant has its own database holding payment
//! attempts and vouchers; [`PgConnectionRouter`] keeps one lazily connected
//! pool per tenant database.
//!
//! Read-check-write units run in a transaction that takes row locks with
//! `SELECT ... FOR UPDATE` before the state machine in
//! [`transitions`](crate::transitions) decides what to write.

mod central;
mod router;
mod tenant;

pub use central::PgCentralStore;
pub use router::PgConnectionRouter;
pub use tenant::PgVoucherLedger;
