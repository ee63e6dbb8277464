//! Cross-store correlation tokens
//!
//! The central store holds no keys into tenant stores. A voucher purchase is
//! tied back to its tenant only through the `external_reference` the
//! platform hands the gateway when the purchase starts:
//! `TENANT_<tenant id>_<suffix>`.

const PREFIX: &str = "TENANT_";

/// Result of decoding an `external_reference`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationRef {
    Tenant { tenant_id: i64, suffix: String },
    /// Present but not of the `TENANT_<id>_<suffix>` shape
    Malformed(String),
    Absent,
}

impl CorrelationRef {
    pub fn parse(external_reference: Option<&str>) -> Self {
        match external_reference.map(str::trim) {
            None | Some("") => CorrelationRef::Absent,
            Some(raw) => parse_token(raw).unwrap_or_else(|| CorrelationRef::Malformed(raw.to_string())),
        }
    }

    pub fn tenant_id(&self) -> Option<i64> {
        match self {
            CorrelationRef::Tenant { tenant_id, .. } => Some(*tenant_id),
            _ => None,
        }
    }
}

fn parse_token(raw: &str) -> Option<CorrelationRef> {
    let rest = raw.strip_prefix(PREFIX)?;
    let (id, suffix) = rest.split_once('_')?;
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) || suffix.is_empty() {
        return None;
    }
    let tenant_id: i64 = id.parse().ok()?;
    if tenant_id <= 0 {
        return None;
    }
    Some(CorrelationRef::Tenant {
        tenant_id,
        suffix: suffix.to_string(),
    })
}

/// Build the `external_reference` for a purchase made in a tenant store
pub fn tenant_external_reference(tenant_id: i64, suffix: &str) -> String {
    format!("{}{}_{}", PREFIX, tenant_id, suffix)
}
