//! Gateway callback payloads and the payment metadata log

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Outcome reported by the gateway for one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayStatus {
    Successful,
    Failed,
    Cancelled,
    /// Any other gateway value (e.g. PENDING), kept verbatim
    Other(String),
}

impl GatewayStatus {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.to_ascii_uppercase().as_str() {
            "SUCCESSFUL" => GatewayStatus::Successful,
            "FAILED" => GatewayStatus::Failed,
            "CANCELLED" => GatewayStatus::Cancelled,
            _ => GatewayStatus::Other(raw.to_string()),
        }
    }

    /// Canonical gateway spelling
    pub fn as_gateway_str(&self) -> &str {
        match self {
            GatewayStatus::Successful => "SUCCESSFUL",
            GatewayStatus::Failed => "FAILED",
            GatewayStatus::Cancelled => "CANCELLED",
            GatewayStatus::Other(raw) => raw,
        }
    }
}

impl std::fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_gateway_str())
    }
}

/// A validated inbound callback
#[derive(Debug, Clone)]
pub struct GatewayCallback {
    /// Identifies this delivery in logs and the callback journal
    pub delivery_id: Uuid,
    pub reference: String,
    pub status: GatewayStatus,
    /// Status text exactly as the gateway sent it
    pub raw_status: String,
    pub external_reference: Option<String>,
    pub reason: Option<String>,
    /// Full payload as received, including fields we do not interpret
    pub raw: Value,
    pub received_at: OffsetDateTime,
}

/// Read a field as text; gateways occasionally send numeric references
fn text_field(body: &Map<String, Value>, key: &str) -> Option<String> {
    match body.get(key)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl GatewayCallback {
    /// Validate a raw payload. Missing or empty `reference`/`status` is rejected.
    pub fn from_json(raw: Value, received_at: OffsetDateTime) -> BillingResult<Self> {
        let body = raw
            .as_object()
            .ok_or_else(|| BillingError::Validation("payload is not a JSON object".to_string()))?;

        let reference = text_field(body, "reference")
            .ok_or_else(|| BillingError::Validation("missing reference".to_string()))?;
        let status = text_field(body, "status")
            .ok_or_else(|| BillingError::Validation("missing status".to_string()))?;
        let external_reference = text_field(body, "external_reference");
        let reason = text_field(body, "reason");

        Ok(Self {
            delivery_id: Uuid::new_v4(),
            reference,
            status: GatewayStatus::parse(&status),
            raw_status: status,
            external_reference,
            reason,
            raw,
            received_at,
        })
    }

    /// Audit-log entry for this delivery
    pub fn entry(&self) -> CallbackEntry {
        CallbackEntry {
            delivery_id: self.delivery_id,
            received_at: self.received_at,
            gateway_status: self.raw_status.clone(),
            payload: self.raw.clone(),
            note: None,
        }
    }
}

/// One raw callback appended to a payment's metadata log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackEntry {
    pub delivery_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub gateway_status: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

fn lenient_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Structured metadata on `Payment` and `PaymentAttempt`.
///
/// Callbacks are appended in arrival order and never rewritten, so repeated
/// deliveries cannot clobber each other's fields. Keys written by other
/// parts of the platform are preserved in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentMeta {
    #[serde(
        default,
        deserialize_with = "lenient_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub voucher_id: Option<i64>,
    #[serde(default)]
    pub callbacks: Vec<CallbackEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PaymentMeta {
    pub fn for_voucher(voucher_id: i64) -> Self {
        Self {
            voucher_id: Some(voucher_id),
            ..Self::default()
        }
    }

    /// Decode a stored JSON column; `null` and legacy shapes become best-effort metadata
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Null => Self::default(),
            Value::Object(map) => match serde_json::from_value(Value::Object(map.clone())) {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!(error = %e, "Unreadable payment meta, keeping raw keys");
                    Self {
                        extra: map,
                        ..Self::default()
                    }
                }
            },
            other => {
                let mut extra = Map::new();
                extra.insert("legacy".to_string(), other);
                Self {
                    extra,
                    ..Self::default()
                }
            }
        }
    }

    pub fn to_value(&self) -> BillingResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn record(&mut self, entry: CallbackEntry) {
        self.callbacks.push(entry);
    }

    /// Attach a note to the most recent callback entry
    pub fn annotate_last(&mut self, note: impl Into<String>) {
        if let Some(last) = self.callbacks.last_mut() {
            last.note = Some(note.into());
        }
    }
}
