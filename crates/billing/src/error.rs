//! Billing error types

use patronage_shared::StoreError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Transient gateway failure (timeout, connection error, 5xx).
    /// Distinct from an invalid invoice reference: the webhook layer
    /// maps this to a retryable 5xx because no mutation has happened.
    #[error("payment gateway unavailable: {0}")]
    Gateway(String),

    #[error("mail delivery failed: {0}")]
    Mail(String),

    #[error("webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("configuration error: {0}")]
    Config(String),
}
