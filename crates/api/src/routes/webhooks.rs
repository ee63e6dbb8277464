//! Campay webhook endpoint
//!
//! The gateway retries any non-2xx response, so only transient failures
//! (unreachable stores, database errors) answer with 5xx. Unresolvable
//! callbacks are acknowledged with 200 "Payment Not Found".

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn campay_webhook(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<Value>> {
    let raw: Value = serde_json::from_slice(&body).map_err(|e| {
        tracing::warn!(error = %e, "Rejected gateway callback: body is not JSON");
        ApiError::InvalidPayload(e.to_string())
    })?;

    let outcome = state.reconciler.handle(raw).await?;
    Ok(Json(json!({ "message": outcome.message() })))
}
