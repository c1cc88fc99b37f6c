#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Patronage Billing
//!
//! The subscription reconciliation and notification core:
//!
//! - **IPN Reconciler**: applies payment-processor notifications to
//!   user subscription state, idempotently and atomically
//! - **Reminder Scheduling**: classifies members into renewal /
//!   failed-charge / declined-card buckets for the daily job
//! - **Mail Dispatch**: bounded background queue delivering batches
//!   through the mail provider without blocking callers

pub mod error;
pub mod gateway;
pub mod mailer;
pub mod reconcile;
pub mod reminders;
pub mod templates;


pub use error::{BillingError, BillingResult};
pub use gateway::{
    Buyer, GatewayConfig, HttpGateway, Invoice, InvoiceLookup, InvoiceStatus, PaymentGateway,
};
pub use mailer::{HttpMailer, MailBatch, MailDispatcher, Mailer, MailerConfig, OutboundMessage};
pub use reconcile::{
    verify_signature, IpnOutcome, IpnPayload, IpnReconciler, CONFIRMED_EXTENSION, PAID_EXTENSION,
};
pub use reminders::{
    due_for_reminder, NoRenewalPoll, ReminderRunSummary, ReminderService, RenewalStatusSource,
    SiteConfig, DEFAULT_LOOKAHEAD,
};

use std::sync::Arc;

use patronage_shared::{PgSubscriptionStore, SubscriptionStore};
use sqlx::PgPool;

/// The assembled core: reconciler, reminder service, and the shared
/// mail dispatcher, wired to one store and one gateway credential set.
pub struct BillingService {
    pub reconciler: IpnReconciler,
    pub reminders: ReminderService,
    pub dispatcher: MailDispatcher,
    webhook_secret: String,
}

impl BillingService {
    /// Build the production service from environment configuration.
    /// Missing or empty gateway/mail/site settings are fatal here, at
    /// startup, never at request time.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let gateway_config = GatewayConfig::from_env()?;
        let mailer_config = MailerConfig::from_env()?;
        let site = SiteConfig::from_env()?;

        let store: Arc<dyn SubscriptionStore> = Arc::new(PgSubscriptionStore::new(pool));
        let gateway: Arc<dyn PaymentGateway> = Arc::new(HttpGateway::new(gateway_config.clone())?);
        let mailer: Arc<dyn Mailer> = Arc::new(HttpMailer::new(mailer_config));

        Ok(Self::new(
            store,
            gateway,
            mailer,
            Arc::new(NoRenewalPoll),
            site,
            gateway_config.webhook_secret,
        ))
    }

    /// Assemble from explicit collaborators (tests inject in-memory
    /// implementations here).
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn PaymentGateway>,
        mailer: Arc<dyn Mailer>,
        renewal_source: Arc<dyn RenewalStatusSource>,
        site: SiteConfig,
        webhook_secret: String,
    ) -> Self {
        let dispatcher = MailDispatcher::spawn(mailer);
        let reconciler = IpnReconciler::new(gateway, store.clone());
        let reminders = ReminderService::new(store, dispatcher.clone(), renewal_source, site);

        Self {
            reconciler,
            reminders,
            dispatcher,
            webhook_secret,
        }
    }

    /// Shared secret for webhook signature verification.
    pub fn webhook_secret(&self) -> &str {
        &self.webhook_secret
    }
}
