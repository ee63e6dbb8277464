//! Billing error types

use thiserror::Error;

/// Errors raised by the billing core
#[derive(Debug, Error)]
pub enum BillingError {
    /// Callback payload is missing required fields; nothing was read or written
    #[error("Invalid payload: {0}")]
    Validation(String),

    /// A central or tenant store could not be reached; the operation was aborted
    #[error("Store unavailable ({store}): {reason}")]
    StoreUnavailable { store: String, reason: String },

    #[error("Database error: {0}")]
    Database(String),

    /// A persisted record holds a value the state machine does not know
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl BillingError {
    pub fn store_unavailable(store: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        BillingError::StoreUnavailable {
            store: store.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, BillingError::StoreUnavailable { .. })
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => BillingError::store_unavailable("database", err),
            other => BillingError::Database(other.to_string()),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_maps_to_store_unavailable() {
        let err: BillingError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_store_unavailable());
    }

    #[test]
    fn test_row_not_found_is_database_error() {
        let err: BillingError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, BillingError::Database(_)));
    }
}
