//! IPN reconciliation
//!
//! Turns a payment-processor notification into an idempotent mutation
//! of the user's subscription state. Business-rule rejections resolve
//! to a definitive acknowledgment; only transient gateway failures
//! propagate as errors so the sender retries.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use time::{Duration, OffsetDateTime};

use patronage_shared::{SettlementOutcome, SubscriptionStore};

use crate::error::{BillingError, BillingResult};
use crate::gateway::{InvoiceLookup, InvoiceStatus, PaymentGateway};

type HmacSha256 = Hmac<Sha256>;

/// Extension granted on a fully settled (`confirmed`) payment.
pub const CONFIRMED_EXTENSION: Duration = Duration::days(30);

/// Provisional grace window granted while a `paid` invoice awaits
/// settlement finality.
pub const PAID_EXTENSION: Duration = Duration::hours(6);

/// Webhook timestamp tolerance for replay protection.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Notification body. Only the invoice id matters; anything else the
/// sender includes is ignored and the invoice is re-fetched from the
/// gateway rather than trusted from the payload.
#[derive(Debug, Clone, Deserialize)]
pub struct IpnPayload {
    pub id: Option<String>,
}

/// Terminal outcome of reconciling one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpnOutcome {
    /// Malformed payload (no invoice id). Acknowledged so the sender
    /// does not redeliver the same broken payload forever.
    Ignored,
    /// The gateway rejected the invoice reference.
    InvalidTransaction,
    /// Invoice exists but carries no status yet.
    NoStatus,
    /// Status is neither `paid` nor `confirmed`.
    NotPaid,
    /// Payment made for a username with no account. Logged for manual
    /// reconciliation.
    UnregisteredPayer,
    /// Administrators are never billed.
    AdminPaymentRejected,
    /// This invoice id was already applied (webhook redelivery).
    Duplicate,
    /// Subscription extended and plan assigned.
    Accepted { expires: OffsetDateTime },
}

impl IpnOutcome {
    pub fn http_status(&self) -> u16 {
        match self {
            IpnOutcome::Accepted { .. } => 201,
            IpnOutcome::InvalidTransaction => 400,
            _ => 200,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            IpnOutcome::Ignored => "Not a valid IPN.",
            IpnOutcome::InvalidTransaction => "Invalid transaction ID.",
            IpnOutcome::NoStatus => "No payment status received.",
            IpnOutcome::NotPaid => "Status not paid or confirmed.",
            IpnOutcome::UnregisteredPayer => "Payment made for unregistered user.",
            IpnOutcome::AdminPaymentRejected => "Administrator should not make payments.",
            IpnOutcome::Duplicate => "IPN already processed.",
            IpnOutcome::Accepted { .. } => "Payment Accepted",
        }
    }
}

/// Verify the webhook signature header (`t=<unix>,v1=<hex hmac>`)
/// against the gateway's shared secret. The HMAC covers
/// `"{timestamp}.{body}"` and the timestamp must be within the replay
/// tolerance.
pub fn verify_signature(payload: &str, signature: &str, secret: &str) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::warn!("Missing v1 signature in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    let now = OffsetDateTime::now_utc().unix_timestamp();
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let signed_payload = format!("{timestamp}.{payload}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Applies a single payment notification to the subscription store.
pub struct IpnReconciler {
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn SubscriptionStore>,
}

impl IpnReconciler {
    pub fn new(gateway: Arc<dyn PaymentGateway>, store: Arc<dyn SubscriptionStore>) -> Self {
        Self { gateway, store }
    }

    /// Reconcile one notification. The only `Err` paths are
    /// infrastructure failures (gateway transport, store); every
    /// business-rule rejection is a terminal `IpnOutcome`.
    pub async fn reconcile(&self, payload: &IpnPayload) -> BillingResult<IpnOutcome> {
        let Some(invoice_id) = payload.id.as_deref().filter(|id| !id.is_empty()) else {
            return Ok(IpnOutcome::Ignored);
        };

        let invoice = match self.gateway.fetch_invoice(invoice_id).await? {
            InvoiceLookup::Found(invoice) => invoice,
            InvoiceLookup::InvalidReference => return Ok(IpnOutcome::InvalidTransaction),
        };

        let Some(status) = invoice.status else {
            return Ok(IpnOutcome::NoStatus);
        };
        if !status.is_settled() {
            return Ok(IpnOutcome::NotPaid);
        }

        let Some(buyer_name) = invoice.buyer.name.as_deref() else {
            tracing::warn!(invoice_id = %invoice_id, "Settled invoice has no buyer name");
            return Ok(IpnOutcome::UnregisteredPayer);
        };

        let Some(user) = self.store.find_by_username(buyer_name).await? else {
            tracing::warn!(
                invoice_id = %invoice_id,
                buyer = %buyer_name,
                "Payment made for unregistered user - manual reconciliation needed"
            );
            return Ok(IpnOutcome::UnregisteredPayer);
        };
        if user.is_admin() {
            tracing::warn!(
                invoice_id = %invoice_id,
                username = %user.username,
                "Rejected payment notification for administrator account"
            );
            return Ok(IpnOutcome::AdminPaymentRejected);
        }

        let extension = match status {
            InvoiceStatus::Confirmed => CONFIRMED_EXTENSION,
            // `paid` but not settled: short grace window until the
            // `confirmed` notification arrives.
            _ => PAID_EXTENSION,
        };
        let plan = invoice.order_id.as_deref().unwrap_or(&user.role);

        // Claiming the invoice id and extending the subscription are
        // one atomic store operation: first writer wins per invoice
        // (with the paid -> confirmed upgrade), the extension base is
        // max(now, expiration), and a failed extension rolls the claim
        // back so a retried delivery still applies.
        match self
            .store
            .apply_settlement(invoice_id, &user.username, status.as_str(), extension, plan)
            .await?
        {
            SettlementOutcome::Applied { expires } => {
                tracing::info!(
                    invoice_id = %invoice_id,
                    username = %user.username,
                    plan = %plan,
                    status = status.as_str(),
                    expires = %expires,
                    "Payment reconciled, subscription extended"
                );
                Ok(IpnOutcome::Accepted { expires })
            }
            SettlementOutcome::Duplicate => {
                tracing::info!(
                    invoice_id = %invoice_id,
                    username = %user.username,
                    "Duplicate IPN delivery, already applied"
                );
                Ok(IpnOutcome::Duplicate)
            }
            SettlementOutcome::NotFound => {
                tracing::warn!(
                    invoice_id = %invoice_id,
                    username = %user.username,
                    "User vanished between lookup and extension"
                );
                Ok(IpnOutcome::UnregisteredPayer)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let signed = format!("{timestamp}.{payload}");
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(signed.as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_accepted() {
        let body = r#"{"id":"inv-1"}"#;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = sign(body, "secret", now);
        assert!(verify_signature(body, &header, "secret").is_ok());
    }

    #[test]
    fn wrong_secret_rejected() {
        let body = r#"{"id":"inv-1"}"#;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = sign(body, "wrong", now);
        assert!(matches!(
            verify_signature(body, &header, "secret"),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn modified_payload_rejected() {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = sign(r#"{"id":"inv-1"}"#, "secret", now);
        assert!(verify_signature(r#"{"id":"inv-2"}"#, &header, "secret").is_err());
    }

    #[test]
    fn stale_timestamp_rejected() {
        let body = r#"{"id":"inv-1"}"#;
        let stale = OffsetDateTime::now_utc().unix_timestamp() - 600;
        let header = sign(body, "secret", stale);
        assert!(verify_signature(body, &header, "secret").is_err());
    }

    #[test]
    fn garbage_header_rejected() {
        assert!(verify_signature("{}", "not-a-signature", "secret").is_err());
    }

    #[test]
    fn outcome_status_mapping() {
        assert_eq!(IpnOutcome::Ignored.http_status(), 200);
        assert_eq!(IpnOutcome::InvalidTransaction.http_status(), 400);
        assert_eq!(IpnOutcome::NotPaid.http_status(), 200);
        assert_eq!(
            IpnOutcome::Accepted {
                expires: OffsetDateTime::now_utc()
            }
            .http_status(),
            201
        );
    }
}
