//! HTTP routes
//!
//! The IPN webhook is the only mutating surface. The sender is a
//! payment processor, not a browser: responses are short text bodies
//! with status codes that tell it whether to retry (5xx), fix the
//! reference (400), or stop (2xx).

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;

use patronage_billing::{verify_signature, BillingError, BillingResult, IpnOutcome, IpnPayload};

use crate::state::AppState;

/// Signature header set by the payment gateway on webhook deliveries.
const SIGNATURE_HEADER: &str = "x-gateway-signature";

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/updatesub", post(update_sub))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Receives and processes payment notifications from the gateway.
async fn update_sub(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, &'static str) {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if let Err(e) = verify_signature(&body, signature, state.billing.webhook_secret()) {
        tracing::warn!(error = %e, "Rejected webhook with bad signature");
        return (StatusCode::UNAUTHORIZED, "Invalid signature.");
    }

    // A body that isn't even JSON gets the same terminal
    // acknowledgment as a JSON body without an id: redelivery would
    // carry the same broken payload forever.
    let payload: IpnPayload = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(_) => return ipn_response(Ok(IpnOutcome::Ignored)),
    };

    ipn_response(state.billing.reconciler.reconcile(&payload).await)
}

/// Map a reconciliation result onto the webhook wire contract.
fn ipn_response(result: BillingResult<IpnOutcome>) -> (StatusCode, &'static str) {
    match result {
        Ok(outcome) => {
            let status = StatusCode::from_u16(outcome.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, outcome.message())
        }
        // Transient failure before any mutation: a 5xx tells the
        // sender to retry.
        Err(BillingError::Gateway(e)) => {
            tracing::error!(error = %e, "Gateway unavailable during reconciliation");
            (StatusCode::BAD_GATEWAY, "Payment gateway unavailable.")
        }
        Err(e) => {
            tracing::error!(error = %e, "Reconciliation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error.")
        }
    }
}
