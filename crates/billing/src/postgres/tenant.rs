use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgConnection;
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::models::{PaymentAttempt, Voucher};
use crate::payload::{CallbackEntry, GatewayStatus, PaymentMeta};
use crate::transitions::{sell_voucher, settle_attempt, AttemptSettlement, InventorySkip};
use crate::vouchers::{TenantTransition, VoucherLedger};

const ATTEMPT_COLUMNS: &str = "id, reference, status, amount_fcfa, meta, completed_at, \
                               failure_reason, created_at, updated_at";
const VOUCHER_COLUMNS: &str = "id, code, package_id, status, purchased_at, purchase_amount_fcfa, \
                               payment_reference, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct AttemptRow {
    id: i64,
    reference: String,
    status: String,
    amount_fcfa: i64,
    meta: Option<Json<Value>>,
    completed_at: Option<OffsetDateTime>,
    failure_reason: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<AttemptRow> for PaymentAttempt {
    type Error = BillingError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        Ok(PaymentAttempt {
            id: row.id,
            reference: row.reference,
            status: row.status.parse()?,
            amount_fcfa: row.amount_fcfa,
            meta: PaymentMeta::from_value(row.meta.map(|m| m.0).unwrap_or(Value::Null)),
            completed_at: row.completed_at,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct VoucherRow {
    id: i64,
    code: String,
    package_id: Option<i64>,
    status: String,
    purchased_at: Option<OffsetDateTime>,
    purchase_amount_fcfa: Option<i64>,
    payment_reference: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<VoucherRow> for Voucher {
    type Error = BillingError;

    fn try_from(row: VoucherRow) -> Result<Self, Self::Error> {
        Ok(Voucher {
            id: row.id,
            code: row.code,
            package_id: row.package_id,
            status: row.status.parse()?,
            purchased_at: row.purchased_at,
            purchase_amount_fcfa: row.purchase_amount_fcfa,
            payment_reference: row.payment_reference,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Voucher ledger backed by one tenant database
#[derive(Clone)]
pub struct PgVoucherLedger {
    pool: PgPool,
}

impl PgVoucherLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Sell the voucher linked to a successful attempt, or explain why not
    async fn sell_linked_voucher(
        conn: &mut PgConnection,
        attempt: &PaymentAttempt,
        now: OffsetDateTime,
    ) -> BillingResult<Result<Voucher, InventorySkip>> {
        let Some(voucher_id) = attempt.meta.voucher_id else {
            return Ok(Err(InventorySkip::NoVoucherLinked));
        };

        let row: Option<VoucherRow> = sqlx::query_as(&format!(
            "SELECT {} FROM vouchers WHERE id = $1 FOR UPDATE",
            VOUCHER_COLUMNS
        ))
        .bind(voucher_id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Ok(Err(InventorySkip::VoucherMissing { voucher_id }));
        };
        let mut voucher = Voucher::try_from(row)?;

        if let Err(skip) = sell_voucher(&mut voucher, attempt.amount_fcfa, &attempt.reference, now) {
            return Ok(Err(skip));
        }

        sqlx::query(
            r#"
            UPDATE vouchers
            SET status = $1, purchased_at = $2, purchase_amount_fcfa = $3,
                payment_reference = $4, updated_at = $5
            WHERE id = $6
            "#,
        )
        .bind(voucher.status.as_str())
        .bind(voucher.purchased_at)
        .bind(voucher.purchase_amount_fcfa)
        .bind(&voucher.payment_reference)
        .bind(voucher.updated_at)
        .bind(voucher.id)
        .execute(&mut *conn)
        .await?;

        Ok(Ok(voucher))
    }
}

#[async_trait]
impl VoucherLedger for PgVoucherLedger {
    async fn find_attempt(&self, reference: &str) -> BillingResult<Option<PaymentAttempt>> {
        let row: Option<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payment_attempts WHERE reference = $1",
            ATTEMPT_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PaymentAttempt::try_from).transpose()
    }

    async fn apply_attempt_outcome(
        &self,
        reference: &str,
        status: &GatewayStatus,
        reason: Option<&str>,
        entry: CallbackEntry,
        now: OffsetDateTime,
    ) -> BillingResult<TenantTransition> {
        let mut tx = self.pool.begin().await?;

        let row: Option<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payment_attempts WHERE reference = $1 FOR UPDATE",
            ATTEMPT_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(TenantTransition::NotFound);
        };
        let mut attempt = PaymentAttempt::try_from(row)?;

        let settlement = settle_attempt(&mut attempt, status, reason, entry, now);
        let mut sold = None;
        let mut skipped = None;
        match settlement {
            AttemptSettlement::AlreadySucceeded => {
                return Ok(TenantTransition::AlreadyProcessed { attempt })
            }
            AttemptSettlement::Succeeded => {
                match Self::sell_linked_voucher(&mut *tx, &attempt, now).await? {
                    Ok(voucher) => sold = Some(voucher),
                    Err(skip) => {
                        attempt.meta.annotate_last(format!("inventory skipped: {}", skip));
                        skipped = Some(skip);
                    }
                }
            }
            AttemptSettlement::Failed(_) | AttemptSettlement::Recorded => {}
        }

        sqlx::query(
            r#"
            UPDATE payment_attempts
            SET status = $1, meta = $2, completed_at = $3, failure_reason = $4, updated_at = $5
            WHERE id = $6
            "#,
        )
        .bind(attempt.status.as_str())
        .bind(Json(&attempt.meta))
        .bind(attempt.completed_at)
        .bind(&attempt.failure_reason)
        .bind(attempt.updated_at)
        .bind(attempt.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(match settlement {
            AttemptSettlement::Succeeded => TenantTransition::Succeeded {
                attempt,
                voucher: sold,
                inventory_skip: skipped,
            },
            AttemptSettlement::Failed(_) => TenantTransition::Failed { attempt },
            _ => TenantTransition::Recorded { attempt },
        })
    }
}
