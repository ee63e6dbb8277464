use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgConnection;
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::invariants::{InvariantQueries, PlanMismatch};
use crate::journal::{CallbackJournal, CallbackOutcome, CallbackRecord};
use crate::ledger::{CentralLedger, CentralTransition};
use crate::models::{Payment, PaymentType, Subscription, Tenant, TenantOwner};
use crate::payload::{CallbackEntry, GatewayStatus, PaymentMeta};
use crate::tenancy::TenantDirectory;
use crate::transitions::{
    adopt_plan, renew_subscription, settle_payment, supersede_subscription, PaymentSettlement,
};

const TENANT_COLUMNS: &str = "id, slug, name, email, database_name, plan_id, status, owner_id, \
                              created_at, updated_at";
const SUBSCRIPTION_COLUMNS: &str = "id, tenant_id, plan_id, status, starts_at, \
                                    current_period_start, current_period_end, next_payment_date, \
                                    created_at, updated_at";
const PAYMENT_COLUMNS: &str = "id, tenant_id, subscription_id, campay_reference, status, \
                               campay_status, payment_type, amount_fcfa, meta, paid_at, \
                               created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct TenantRow {
    id: i64,
    slug: String,
    name: String,
    email: String,
    database_name: String,
    plan_id: Option<i64>,
    status: String,
    owner_id: Option<i64>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<TenantRow> for Tenant {
    type Error = BillingError;

    fn try_from(row: TenantRow) -> Result<Self, Self::Error> {
        Ok(Tenant {
            id: row.id,
            slug: row.slug,
            name: row.name,
            email: row.email,
            database_name: row.database_name,
            plan_id: row.plan_id,
            status: row.status.parse()?,
            owner_id: row.owner_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: i64,
    tenant_id: i64,
    plan_id: i64,
    status: String,
    starts_at: OffsetDateTime,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    next_payment_date: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            tenant_id: row.tenant_id,
            plan_id: row.plan_id,
            status: row.status.parse()?,
            starts_at: row.starts_at,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            next_payment_date: row.next_payment_date,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: i64,
    tenant_id: i64,
    subscription_id: Option<i64>,
    campay_reference: String,
    status: String,
    campay_status: Option<String>,
    payment_type: String,
    amount_fcfa: i64,
    meta: Option<Json<Value>>,
    paid_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            tenant_id: row.tenant_id,
            subscription_id: row.subscription_id,
            campay_reference: row.campay_reference,
            status: row.status.parse()?,
            campay_status: row.campay_status,
            payment_type: row.payment_type.parse()?,
            amount_fcfa: row.amount_fcfa,
            meta: PaymentMeta::from_value(row.meta.map(|m| m.0).unwrap_or(Value::Null)),
            paid_at: row.paid_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CallbackRow {
    delivery_id: Uuid,
    reference: Option<String>,
    gateway_status: Option<String>,
    outcome: String,
    tenant_id: Option<i64>,
    detail: Option<String>,
    payload: Json<Value>,
    received_at: OffsetDateTime,
}

impl TryFrom<CallbackRow> for CallbackRecord {
    type Error = BillingError;

    fn try_from(row: CallbackRow) -> Result<Self, Self::Error> {
        Ok(CallbackRecord {
            delivery_id: row.delivery_id,
            reference: row.reference,
            gateway_status: row.gateway_status,
            outcome: row.outcome.parse()?,
            tenant_id: row.tenant_id,
            detail: row.detail,
            payload: row.payload.0,
            received_at: row.received_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PlanMismatchRow {
    tenant_id: i64,
    tenant_plan_id: Option<i64>,
    subscription_id: i64,
    subscription_plan_id: i64,
}

/// Central billing database
#[derive(Clone)]
pub struct PgCentralStore {
    pool: PgPool,
}

impl PgCentralStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete journal rows received before `older_than`; returns the number removed
    pub async fn prune_callbacks(&self, older_than: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM gateway_callbacks WHERE received_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn persist_payment(conn: &mut PgConnection, payment: &Payment) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE payments
            SET status = $1, campay_status = $2, meta = $3, paid_at = $4, updated_at = $5
            WHERE id = $6
            "#,
        )
        .bind(payment.status.as_str())
        .bind(&payment.campay_status)
        .bind(Json(&payment.meta))
        .bind(payment.paid_at)
        .bind(payment.updated_at)
        .bind(payment.id)
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn persist_subscription(
        conn: &mut PgConnection,
        subscription: &Subscription,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $1, current_period_start = $2, current_period_end = $3,
                next_payment_date = $4, updated_at = $5
            WHERE id = $6
            "#,
        )
        .bind(subscription.status.as_str())
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.next_payment_date)
        .bind(subscription.updated_at)
        .bind(subscription.id)
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn lock_tenant(conn: &mut PgConnection, tenant_id: i64) -> BillingResult<Option<Tenant>> {
        let row: Option<TenantRow> = sqlx::query_as(&format!(
            "SELECT {} FROM tenants WHERE id = $1 FOR UPDATE",
            TENANT_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_optional(&mut *conn)
        .await?;
        row.map(Tenant::try_from).transpose()
    }

    /// Renew the paid subscription, retire the tenant's other current ones,
    /// then carry the plan onto the tenant. Subscription written before tenant.
    ///
    /// The paying tenant's row is locked before any subscription row, so
    /// activations for one tenant run one at a time instead of deadlocking
    /// on each other's subscriptions.
    async fn activate_subscription(
        conn: &mut PgConnection,
        tenant_id: i64,
        subscription_id: i64,
        now: OffsetDateTime,
    ) -> BillingResult<Option<(Subscription, Option<Tenant>)>> {
        let locked_tenant = Self::lock_tenant(&mut *conn, tenant_id).await?;

        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1 FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            tracing::warn!(
                subscription_id,
                "RECONCILIATION NEEDED: Subscription payment completed but subscription row is missing"
            );
            return Ok(None);
        };
        let mut subscription = Subscription::try_from(row)?;
        renew_subscription(&mut subscription, now);

        let others: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions \
             WHERE tenant_id = $1 AND id <> $2 AND status IN ('active', 'past_due') \
             FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription.tenant_id)
        .bind(subscription.id)
        .fetch_all(&mut *conn)
        .await?;

        for row in others {
            let mut other = Subscription::try_from(row)?;
            supersede_subscription(&mut other, now);
            Self::persist_subscription(&mut *conn, &other).await?;
            tracing::info!(
                tenant_id = other.tenant_id,
                subscription_id = other.id,
                replaced_by = subscription.id,
                "Superseded subscription cancelled"
            );
        }
        Self::persist_subscription(&mut *conn, &subscription).await?;

        let owner = if subscription.tenant_id == tenant_id {
            locked_tenant
        } else {
            tracing::warn!(
                payment_tenant_id = tenant_id,
                subscription_tenant_id = subscription.tenant_id,
                subscription_id = subscription.id,
                "Subscription belongs to another tenant than its payment"
            );
            Self::lock_tenant(&mut *conn, subscription.tenant_id).await?
        };

        let tenant = match owner {
            Some(mut tenant) => {
                adopt_plan(&mut tenant, subscription.plan_id, now);
                sqlx::query(
                    "UPDATE tenants SET plan_id = $1, status = $2, updated_at = $3 WHERE id = $4",
                )
                .bind(tenant.plan_id)
                .bind(tenant.status.as_str())
                .bind(tenant.updated_at)
                .bind(tenant.id)
                .execute(&mut *conn)
                .await?;
                Some(tenant)
            }
            None => None,
        };

        Ok(Some((subscription, tenant)))
    }
}

#[async_trait]
impl TenantDirectory for PgCentralStore {
    async fn find_tenant(&self, tenant_id: i64) -> BillingResult<Option<Tenant>> {
        let row: Option<TenantRow> =
            sqlx::query_as(&format!("SELECT {} FROM tenants WHERE id = $1", TENANT_COLUMNS))
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Tenant::try_from).transpose()
    }

    async fn find_owner(&self, tenant: &Tenant) -> BillingResult<Option<TenantOwner>> {
        let Some(owner_id) = tenant.owner_id else {
            return Ok(None);
        };
        let row: Option<(i64, String, String)> =
            sqlx::query_as("SELECT id, name, email FROM users WHERE id = $1")
                .bind(owner_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, name, email)| TenantOwner { id, name, email }))
    }
}

#[async_trait]
impl CentralLedger for PgCentralStore {
    async fn find_payment(&self, reference: &str) -> BillingResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE campay_reference = $1",
            PAYMENT_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Payment::try_from).transpose()
    }

    async fn apply_payment_outcome(
        &self,
        reference: &str,
        status: &GatewayStatus,
        entry: CallbackEntry,
        now: OffsetDateTime,
    ) -> BillingResult<CentralTransition> {
        let mut tx = self.pool.begin().await?;

        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payments WHERE campay_reference = $1 FOR UPDATE",
            PAYMENT_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(CentralTransition::NotFound);
        };
        let mut payment = Payment::try_from(row)?;

        let settlement = settle_payment(&mut payment, status, entry, now);
        if settlement == PaymentSettlement::AlreadyCompleted {
            return Ok(CentralTransition::AlreadyProcessed { payment });
        }

        Self::persist_payment(&mut *tx, &payment).await?;

        let transition = match settlement {
            PaymentSettlement::Completed => {
                let activated = match (payment.payment_type, payment.subscription_id) {
                    (PaymentType::Subscription, Some(subscription_id)) => {
                        Self::activate_subscription(
                            &mut *tx,
                            payment.tenant_id,
                            subscription_id,
                            now,
                        )
                        .await?
                    }
                    _ => None,
                };
                let (subscription, tenant) = match activated {
                    Some((subscription, tenant)) => (Some(subscription), tenant),
                    None => (None, None),
                };
                CentralTransition::Completed {
                    payment,
                    subscription,
                    tenant,
                }
            }
            PaymentSettlement::Failed => CentralTransition::Failed { payment },
            _ => CentralTransition::Recorded { payment },
        };

        tx.commit().await?;
        Ok(transition)
    }
}

#[async_trait]
impl CallbackJournal for PgCentralStore {
    async fn record(&self, record: &CallbackRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO gateway_callbacks
                (delivery_id, reference, gateway_status, outcome, tenant_id, detail, payload, received_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (delivery_id) DO NOTHING
            "#,
        )
        .bind(record.delivery_id)
        .bind(&record.reference)
        .bind(&record.gateway_status)
        .bind(record.outcome.as_str())
        .bind(record.tenant_id)
        .bind(&record.detail)
        .bind(Json(&record.payload))
        .bind(record.received_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(
        &self,
        outcome: Option<CallbackOutcome>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<CallbackRecord>> {
        let rows: Vec<CallbackRow> = sqlx::query_as(
            r#"
            SELECT delivery_id, reference, gateway_status, outcome, tenant_id, detail, payload, received_at
            FROM gateway_callbacks
            WHERE ($1::TEXT IS NULL OR outcome = $1)
            ORDER BY received_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(outcome.map(|o| o.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CallbackRecord::try_from).collect()
    }
}

#[async_trait]
impl InvariantQueries for PgCentralStore {
    async fn tenants_with_multiple_current_subscriptions(&self) -> BillingResult<Vec<(i64, i64)>> {
        Ok(sqlx::query_as(
            r#"
            SELECT tenant_id, COUNT(*) AS sub_count
            FROM subscriptions
            WHERE status IN ('active', 'past_due')
            GROUP BY tenant_id
            HAVING COUNT(*) > 1
            ORDER BY tenant_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn tenant_plan_mismatches(&self) -> BillingResult<Vec<PlanMismatch>> {
        let rows: Vec<PlanMismatchRow> = sqlx::query_as(
            r#"
            SELECT t.id AS tenant_id, t.plan_id AS tenant_plan_id,
                   s.id AS subscription_id, s.plan_id AS subscription_plan_id
            FROM subscriptions s
            JOIN tenants t ON t.id = s.tenant_id
            WHERE s.status = 'active'
              AND t.plan_id IS DISTINCT FROM s.plan_id
            ORDER BY s.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| PlanMismatch {
                tenant_id: row.tenant_id,
                tenant_plan_id: row.tenant_plan_id,
                subscription_id: row.subscription_id,
                subscription_plan_id: row.subscription_plan_id,
            })
            .collect())
    }

    async fn completed_payments_without_paid_at(&self) -> BillingResult<Vec<(i64, String)>> {
        Ok(sqlx::query_as(
            r#"
            SELECT tenant_id, campay_reference
            FROM payments
            WHERE status = 'completed' AND paid_at IS NULL
            ORDER BY tenant_id, campay_reference
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn active_subscriptions_without_period(&self) -> BillingResult<Vec<(i64, i64)>> {
        Ok(sqlx::query_as(
            r#"
            SELECT tenant_id, id
            FROM subscriptions
            WHERE status = 'active'
              AND (current_period_start IS NULL OR current_period_end IS NULL)
            ORDER BY tenant_id, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }
}
