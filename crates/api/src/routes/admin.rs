//! Operator endpoints: invariant checks and the callback journal

use axum::extract::{Path, Query, State};
use axum::Json;
use hotspot_billing::{CallbackOutcome, CallbackRecord, InvariantCheckSummary, InvariantChecker};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const MAX_PAGE_SIZE: i64 = 200;

pub async fn run_invariants(State(state): State<AppState>) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state.invariants.run_all_checks().await?;
    if !summary.healthy {
        tracing::warn!(
            violations = summary.violations.len(),
            checks_failed = summary.checks_failed,
            "Billing invariants violated"
        );
    }
    Ok(Json(summary))
}

pub async fn run_invariant_check(
    State(state): State<AppState>,
    Path(check): Path<String>,
) -> ApiResult<Json<Value>> {
    if !InvariantChecker::available_checks().contains(&check.as_str()) {
        return Err(ApiError::NotFound);
    }
    let violations = state.invariants.run_check(&check).await?;
    Ok(Json(json!({
        "check": check,
        "passed": violations.is_empty(),
        "violations": violations,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub outcome: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_callbacks(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> ApiResult<Json<Vec<CallbackRecord>>> {
    let outcome = query
        .outcome
        .as_deref()
        .map(str::parse::<CallbackOutcome>)
        .transpose()
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);

    let records = state.journal.list(outcome, limit, offset).await?;
    Ok(Json(records))
}
