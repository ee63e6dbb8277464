//! Payment confirmation notifications
//!
//! Fired after a central payment commits. Delivery is best-effort: the
//! reconciler logs failures and never rolls the ledger back because of them.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::error::{BillingError, BillingResult};
use crate::models::{Payment, Tenant, TenantOwner};

const DEFAULT_API_BASE: &str = "https://api.resend.com";
const DEFAULT_FROM: &str = "Hotspot Billing <billing@hotspot.local>";

#[async_trait]
pub trait PaymentNotifier: Send + Sync {
    async fn payment_received(
        &self,
        payment: &Payment,
        tenant: &Tenant,
        owner: &TenantOwner,
    ) -> BillingResult<()>;
}

/// Email delivery settings
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key; email is disabled without it
    pub api_key: Option<String>,
    pub from: String,
    pub api_base: String,
    pub max_retries: usize,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("RESEND_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            from: std::env::var("EMAIL_FROM").unwrap_or_else(|_| DEFAULT_FROM.to_string()),
            api_base: std::env::var("EMAIL_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            max_retries: 3,
        }
    }
}

/// Sends billing emails through the Resend HTTP API
#[derive(Clone)]
pub struct BillingEmailService {
    config: EmailConfig,
    client: reqwest::Client,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.api_key.is_some()
    }

    async fn send(&self, to: &str, subject: &str, html: &str) -> BillingResult<()> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            tracing::debug!(to = %to, subject = %subject, "Email disabled, skipping send");
            return Ok(());
        };

        let url = format!("{}/emails", self.config.api_base.trim_end_matches('/'));
        let body = json!({
            "from": self.config.from,
            "to": [to],
            "subject": subject,
            "html": html,
        });

        let strategy = ExponentialBackoff::from_millis(100)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.config.max_retries);

        Retry::spawn(strategy, || async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| BillingError::Notification(e.to_string()))?;

            if response.status().is_success() {
                Ok(())
            } else {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                tracing::warn!(status = %status, body = %text, "Email API rejected request");
                Err(BillingError::Notification(format!(
                    "email API returned {}",
                    status
                )))
            }
        })
        .await
    }
}

#[async_trait]
impl PaymentNotifier for BillingEmailService {
    async fn payment_received(
        &self,
        payment: &Payment,
        tenant: &Tenant,
        owner: &TenantOwner,
    ) -> BillingResult<()> {
        let subject = format!("Payment received for {}", tenant.name);
        let html = render_payment_received(payment, tenant, owner);
        self.send(&owner.email, &subject, &html).await?;

        tracing::info!(
            tenant_id = tenant.id,
            reference = %payment.campay_reference,
            "Payment confirmation email sent"
        );
        Ok(())
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn render_payment_received(payment: &Payment, tenant: &Tenant, owner: &TenantOwner) -> String {
    let paid_at = payment
        .paid_at
        .map(|t| t.date().to_string())
        .unwrap_or_else(|| "today".to_string());
    format!(
        "<p>Hello {owner},</p>\
         <p>We received your payment of <strong>{amount} FCFA</strong> for <strong>{tenant}</strong> on {paid_at}.</p>\
         <p>Reference: {reference}</p>",
        owner = escape_html(&owner.name),
        amount = payment.amount_fcfa,
        tenant = escape_html(&tenant.name),
        paid_at = paid_at,
        reference = escape_html(&payment.campay_reference),
    )
}
