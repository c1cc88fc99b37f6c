//! Payment gateway client
//!
//! The gateway is an opaque collaborator: given an external invoice
//! id it returns invoice status and buyer/order metadata. The HTTP
//! implementation speaks a BTCPay-style REST API; everything the
//! reconciler needs is behind the `PaymentGateway` trait so tests can
//! substitute a scripted gateway.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{BillingError, BillingResult};

/// Gateway request timeout. Past this the reconciliation reports a
/// transient failure so the sender retries (no mutation has occurred).
const GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Credentials for the single configured payment gateway.
///
/// Exactly one credential set is expected; zero (or empty values) is a
/// startup-time fatal configuration error, never a per-request one.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL of the gateway API, e.g. `https://pay.example.com`.
    pub base_url: String,
    pub api_key: String,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: String,
}

impl GatewayConfig {
    pub fn from_env() -> BillingResult<Self> {
        let base_url = require_env("GATEWAY_URL")?;
        let api_key = require_env("GATEWAY_API_KEY")?;
        let webhook_secret = require_env("GATEWAY_WEBHOOK_SECRET")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            webhook_secret,
        })
    }
}

fn require_env(name: &'static str) -> BillingResult<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(BillingError::Config(format!("{name} must be set"))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    New,
    Paid,
    Confirmed,
    Invalid,
    Expired,
    #[serde(other)]
    Other,
}

impl InvoiceStatus {
    /// Only `paid` and `confirmed` trigger a subscription extension.
    pub fn is_settled(self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Confirmed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InvoiceStatus::New => "new",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Confirmed => "confirmed",
            InvoiceStatus::Invalid => "invalid",
            InvoiceStatus::Expired => "expired",
            InvoiceStatus::Other => "other",
        }
    }
}

/// A gateway invoice. Transient: fetched per notification, never
/// persisted by the core.
#[derive(Debug, Clone, Deserialize)]
pub struct Invoice {
    pub id: String,
    /// Absent on incomplete gateway records; the reconciler treats
    /// that as benign.
    pub status: Option<InvoiceStatus>,
    #[serde(default)]
    pub buyer: Buyer,
    /// Maps to the plan tag to assign on a settled payment.
    #[serde(rename = "orderId")]
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Buyer {
    pub name: Option<String>,
}

/// Result of an invoice fetch that reached the gateway.
#[derive(Debug, Clone)]
pub enum InvoiceLookup {
    Found(Invoice),
    /// The gateway answered but the reference is bad (unknown id,
    /// non-invoice response). Terminal for this notification.
    InvalidReference,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Fetch an invoice by its external id. `Err` means a transient
    /// transport failure; `InvalidReference` means the gateway
    /// definitively rejected the id.
    async fn fetch_invoice(&self, invoice_id: &str) -> BillingResult<InvoiceLookup>;
}

/// BTCPay-style envelope: `{"data": {...}}`.
#[derive(Deserialize)]
struct InvoiceEnvelope {
    data: Invoice,
}

/// HTTP payment gateway client
#[derive(Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(GATEWAY_TIMEOUT)
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn fetch_invoice(&self, invoice_id: &str) -> BillingResult<InvoiceLookup> {
        let url = format!("{}/invoices/{}", self.config.base_url, invoice_id);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(invoice_id = %invoice_id, error = %e, "Gateway request failed");
                BillingError::Gateway(e.to_string())
            })?;

        let status = response.status();
        if status.is_client_error() {
            // The gateway answered: the reference itself is bad.
            tracing::warn!(
                invoice_id = %invoice_id,
                status = %status,
                "Gateway rejected invoice reference"
            );
            return Ok(InvoiceLookup::InvalidReference);
        }
        if !status.is_success() {
            return Err(BillingError::Gateway(format!(
                "gateway returned {status} for invoice {invoice_id}"
            )));
        }

        match response.json::<InvoiceEnvelope>().await {
            Ok(envelope) => Ok(InvoiceLookup::Found(envelope.data)),
            Err(e) => {
                // A 2xx that isn't an invoice object is a bad
                // reference, not a transient failure.
                tracing::warn!(
                    invoice_id = %invoice_id,
                    error = %e,
                    "Gateway response was not an invoice object"
                );
                Ok(InvoiceLookup::InvalidReference)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_parses_invoice_envelope() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/invoices/inv-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data": {"id": "inv-1", "status": "confirmed",
                    "buyer": {"name": "alice"}, "orderId": "premium"}}"#,
            )
            .create_async()
            .await;

        let gateway = HttpGateway::new(GatewayConfig {
            base_url: server.url(),
            api_key: "key".to_string(),
            webhook_secret: "secret".to_string(),
        })
        .unwrap();

        let lookup = gateway.fetch_invoice("inv-1").await.unwrap();
        mock.assert_async().await;

        match lookup {
            InvoiceLookup::Found(invoice) => {
                assert_eq!(invoice.id, "inv-1");
                assert_eq!(invoice.status, Some(InvoiceStatus::Confirmed));
                assert_eq!(invoice.buyer.name.as_deref(), Some("alice"));
                assert_eq!(invoice.order_id.as_deref(), Some("premium"));
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_status_maps_to_other() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/invoices/inv-2")
            .with_status(200)
            .with_body(r#"{"data": {"id": "inv-2", "status": "complete"}}"#)
            .create_async()
            .await;

        let gateway = HttpGateway::new(GatewayConfig {
            base_url: server.url(),
            api_key: "key".to_string(),
            webhook_secret: "secret".to_string(),
        })
        .unwrap();

        match gateway.fetch_invoice("inv-2").await.unwrap() {
            InvoiceLookup::Found(invoice) => {
                assert_eq!(invoice.status, Some(InvoiceStatus::Other));
            }
            other => panic!("expected Found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn not_found_is_invalid_reference() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/invoices/nope")
            .with_status(404)
            .create_async()
            .await;

        let gateway = HttpGateway::new(GatewayConfig {
            base_url: server.url(),
            api_key: "key".to_string(),
            webhook_secret: "secret".to_string(),
        })
        .unwrap();

        assert!(matches!(
            gateway.fetch_invoice("nope").await.unwrap(),
            InvoiceLookup::InvalidReference
        ));
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/invoices/inv-3")
            .with_status(503)
            .create_async()
            .await;

        let gateway = HttpGateway::new(GatewayConfig {
            base_url: server.url(),
            api_key: "key".to_string(),
            webhook_secret: "secret".to_string(),
        })
        .unwrap();

        assert!(matches!(
            gateway.fetch_invoice("inv-3").await,
            Err(BillingError::Gateway(_))
        ));
    }
}
