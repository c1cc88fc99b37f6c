//! Application state

use std::sync::Arc;

use patronage_billing::BillingService;

/// Shared application state. Collaborators are constructed once at
/// startup and injected here rather than held as process globals.
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(billing: Arc<BillingService>) -> Self {
        Self { billing }
    }
}
