//! Callback journal
//!
//! One row per inbound delivery, whatever its outcome. Used to audit
//! unmatched callbacks and to spot reconciliation anomalies after the fact.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackOutcome {
    AlreadyProcessed,
    ProcessedCentral,
    ProcessedTenant,
    NotFound,
    /// Processing aborted (store unavailable or database error)
    Failed,
}

impl CallbackOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackOutcome::AlreadyProcessed => "already_processed",
            CallbackOutcome::ProcessedCentral => "processed_central",
            CallbackOutcome::ProcessedTenant => "processed_tenant",
            CallbackOutcome::NotFound => "not_found",
            CallbackOutcome::Failed => "failed",
        }
    }
}

impl fmt::Display for CallbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallbackOutcome {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "already_processed" => Ok(CallbackOutcome::AlreadyProcessed),
            "processed_central" => Ok(CallbackOutcome::ProcessedCentral),
            "processed_tenant" => Ok(CallbackOutcome::ProcessedTenant),
            "not_found" => Ok(CallbackOutcome::NotFound),
            "failed" => Ok(CallbackOutcome::Failed),
            other => Err(BillingError::Validation(format!(
                "unknown callback outcome '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackRecord {
    pub delivery_id: Uuid,
    pub reference: Option<String>,
    pub gateway_status: Option<String>,
    pub outcome: CallbackOutcome,
    pub tenant_id: Option<i64>,
    /// Error message, unmatched reason, or skipped-inventory note
    pub detail: Option<String>,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

#[async_trait]
pub trait CallbackJournal: Send + Sync {
    async fn record(&self, record: &CallbackRecord) -> BillingResult<()>;

    /// Newest first
    async fn list(
        &self,
        outcome: Option<CallbackOutcome>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<CallbackRecord>>;
}
