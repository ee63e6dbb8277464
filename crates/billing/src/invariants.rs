//! Billing Invariants Module
//!
//! Runnable consistency checks over the central store. They can be run after
//! a webhook replay or on a schedule to confirm that every committed
//! transition left Payment, Subscription and Tenant in agreement.
//!
//! Checks only read, never write.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Tenant(s) affected
    pub tenant_ids: Vec<i64>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - a tenant may be billed or entitled incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    /// True when no violation was found
    pub healthy: bool,
}

/// Active subscription whose plan the tenant does not carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanMismatch {
    pub tenant_id: i64,
    pub tenant_plan_id: Option<i64>,
    pub subscription_id: i64,
    pub subscription_plan_id: i64,
}

/// Read-only queries backing the checks, one per invariant
#[async_trait]
pub trait InvariantQueries: Send + Sync {
    /// `(tenant_id, count)` for tenants with more than one active or past-due subscription
    async fn tenants_with_multiple_current_subscriptions(&self) -> BillingResult<Vec<(i64, i64)>>;

    async fn tenant_plan_mismatches(&self) -> BillingResult<Vec<PlanMismatch>>;

    /// `(tenant_id, campay_reference)`
    async fn completed_payments_without_paid_at(&self) -> BillingResult<Vec<(i64, String)>>;

    /// `(tenant_id, subscription_id)`
    async fn active_subscriptions_without_period(&self) -> BillingResult<Vec<(i64, i64)>>;
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    queries: Arc<dyn InvariantQueries>,
}

impl InvariantChecker {
    pub fn new(queries: Arc<dyn InvariantQueries>) -> Self {
        Self { queries }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_plan_matches_subscription().await?);
        violations.extend(self.check_completed_payment_has_paid_at().await?);
        violations.extend(self.check_active_subscription_has_period().await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: at most one current subscription per tenant
    async fn check_single_active_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows = self
            .queries
            .tenants_with_multiple_current_subscriptions()
            .await?;

        Ok(rows
            .into_iter()
            .map(|(tenant_id, count)| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                tenant_ids: vec![tenant_id],
                description: format!(
                    "Tenant has {} current subscriptions (expected at most 1)",
                    count
                ),
                context: serde_json::json!({ "subscription_count": count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: a tenant carries the plan of its active subscription
    async fn check_plan_matches_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows = self.queries.tenant_plan_mismatches().await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "plan_matches_subscription".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Tenant plan {:?} differs from plan {} of active subscription {}",
                    row.tenant_plan_id, row.subscription_plan_id, row.subscription_id
                ),
                context: serde_json::json!({
                    "tenant_plan_id": row.tenant_plan_id,
                    "subscription_id": row.subscription_id,
                    "subscription_plan_id": row.subscription_plan_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: completed payments are stamped
    async fn check_completed_payment_has_paid_at(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows = self.queries.completed_payments_without_paid_at().await?;

        Ok(rows
            .into_iter()
            .map(|(tenant_id, reference)| InvariantViolation {
                invariant: "completed_payment_has_paid_at".to_string(),
                tenant_ids: vec![tenant_id],
                description: format!("Completed payment '{}' has no paid_at", reference),
                context: serde_json::json!({ "reference": reference }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 4: active subscriptions have a billing window
    async fn check_active_subscription_has_period(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows = self.queries.active_subscriptions_without_period().await?;

        Ok(rows
            .into_iter()
            .map(|(tenant_id, subscription_id)| InvariantViolation {
                invariant: "active_subscription_has_period".to_string(),
                tenant_ids: vec![tenant_id],
                description: format!(
                    "Active subscription {} has no current period",
                    subscription_id
                ),
                context: serde_json::json!({ "subscription_id": subscription_id }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_subscription" => self.check_single_active_subscription().await,
            "plan_matches_subscription" => self.check_plan_matches_subscription().await,
            "completed_payment_has_paid_at" => self.check_completed_payment_has_paid_at().await,
            "active_subscription_has_period" => self.check_active_subscription_has_period().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_subscription",
            "plan_matches_subscription",
            "completed_payment_has_paid_at",
            "active_subscription_has_period",
        ]
    }
}
