//! Reminder scheduling
//!
//! The daily job partitions members into disjoint notification
//! buckets: expirations inside the lookahead window get a renewal
//! reminder, and users whose recurring charge failed or was declined
//! (reported by an out-of-scope payment-status poll) get the matching
//! notice. Classification is an explicit predicate over the full
//! candidate set; no query ordering is assumed.

use std::sync::Arc;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use url::Url;

use patronage_shared::{SubscriptionStore, User};

use crate::error::{BillingError, BillingResult};
use crate::mailer::{MailBatch, MailDispatcher, OutboundMessage};
use crate::templates;

/// How far ahead of expiration a renewal reminder goes out.
pub const DEFAULT_LOOKAHEAD: Duration = Duration::days(3);

/// Site identity used in templates and renewal links.
#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub name: String,
    pub base_url: Url,
}

impl SiteConfig {
    pub fn from_env() -> BillingResult<Self> {
        let name = std::env::var("SITE_NAME")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| BillingError::Config("SITE_NAME must be set".to_string()))?;
        let raw_url = std::env::var("SITE_URL")
            .map_err(|_| BillingError::Config("SITE_URL must be set".to_string()))?;
        let base_url = Url::parse(&raw_url)
            .map_err(|e| BillingError::Config(format!("SITE_URL is not a valid URL: {e}")))?;

        Ok(Self { name, base_url })
    }

    /// Personalized renewal link with the username as a query
    /// parameter.
    pub fn renewal_url(&self, username: &str) -> String {
        let mut url = self.base_url.clone();
        url.set_path("/invoice");
        url.query_pairs_mut().append_pair("username", username);
        url.to_string()
    }

    pub fn support_url(&self) -> String {
        let mut url = self.base_url.clone();
        url.set_path("/support");
        url.to_string()
    }
}

/// Members whose expiration falls inside `(now, now + lookahead]`.
/// Already-lapsed members are excluded regardless of where they appear
/// in the input.
pub fn due_for_reminder(users: &[User], now: OffsetDateTime, lookahead: Duration) -> Vec<User> {
    let horizon = now + lookahead;
    users
        .iter()
        .filter(|u| u.expiration > now && u.expiration <= horizon)
        .cloned()
        .collect()
}

/// Out-of-scope payment-status poll reporting members whose recurring
/// renewal charge failed or was declined.
#[async_trait]
pub trait RenewalStatusSource: Send + Sync {
    async fn failed_renewals(&self) -> BillingResult<Vec<User>>;
    async fn declined_cards(&self) -> BillingResult<Vec<User>>;
}

/// Default source for deployments without a recurring-charge poll.
pub struct NoRenewalPoll;

#[async_trait]
impl RenewalStatusSource for NoRenewalPoll {
    async fn failed_renewals(&self) -> BillingResult<Vec<User>> {
        Ok(Vec::new())
    }

    async fn declined_cards(&self) -> BillingResult<Vec<User>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReminderRunSummary {
    pub reminders: usize,
    pub failed: usize,
    pub declined: usize,
    /// True when the trigger was skipped because the previous run was
    /// still in progress.
    pub skipped: bool,
}

pub struct ReminderService {
    store: Arc<dyn SubscriptionStore>,
    dispatcher: MailDispatcher,
    source: Arc<dyn RenewalStatusSource>,
    site: SiteConfig,
    lookahead: Duration,
    run_guard: Mutex<()>,
}

impl ReminderService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        dispatcher: MailDispatcher,
        source: Arc<dyn RenewalStatusSource>,
        site: SiteConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            source,
            site,
            lookahead: DEFAULT_LOOKAHEAD,
            run_guard: Mutex::new(()),
        }
    }

    pub fn with_lookahead(mut self, lookahead: Duration) -> Self {
        self.lookahead = lookahead;
        self
    }

    /// One scheduled run: classify members and queue the reminder,
    /// failed-renewal, and declined-card batches. If a previous run is
    /// still in progress the trigger is skipped, not queued.
    pub async fn run(&self) -> BillingResult<ReminderRunSummary> {
        let Ok(_guard) = self.run_guard.try_lock() else {
            tracing::warn!("Previous reminder run still in progress, skipping this trigger");
            return Ok(ReminderRunSummary {
                skipped: true,
                ..ReminderRunSummary::default()
            });
        };

        let now = OffsetDateTime::now_utc();
        let members = self.store.list_members().await?;
        let due = due_for_reminder(&members, now, self.lookahead);

        let reminders: Vec<OutboundMessage> = due
            .iter()
            .map(|user| {
                let (subject, text) = templates::renewal_reminder(
                    &self.site.name,
                    &user.username,
                    &self.site.renewal_url(&user.username),
                    user.expiration.date(),
                );
                OutboundMessage {
                    to: user.email.clone(),
                    subject,
                    text,
                    html: None,
                }
            })
            .collect();

        let failed = self.source.failed_renewals().await?;
        let declined = self.source.declined_cards().await?;
        let support_url = self.site.support_url();

        let failed_messages: Vec<OutboundMessage> = failed
            .iter()
            .map(|user| {
                let (subject, text) = templates::renewal_failed(
                    &self.site.name,
                    &user.username,
                    &support_url,
                    user.expiration.date(),
                );
                OutboundMessage {
                    to: user.email.clone(),
                    subject,
                    text,
                    html: None,
                }
            })
            .collect();

        let declined_messages: Vec<OutboundMessage> = declined
            .iter()
            .map(|user| {
                let (subject, text) = templates::card_declined(
                    &self.site.name,
                    &user.username,
                    &support_url,
                    user.expiration.date(),
                );
                OutboundMessage {
                    to: user.email.clone(),
                    subject,
                    text,
                    html: None,
                }
            })
            .collect();

        let summary = ReminderRunSummary {
            reminders: reminders.len(),
            failed: failed_messages.len(),
            declined: declined_messages.len(),
            skipped: false,
        };

        self.dispatcher.enqueue(MailBatch {
            label: "renewal-reminders",
            messages: reminders,
        });
        self.dispatcher.enqueue(MailBatch {
            label: "failed-renewals",
            messages: failed_messages,
        });
        self.dispatcher.enqueue(MailBatch {
            label: "declined-cards",
            messages: declined_messages,
        });

        tracing::info!(
            reminders = summary.reminders,
            failed = summary.failed,
            declined = summary.declined,
            "Reminder run queued"
        );

        Ok(summary)
    }

    /// Broadcast a new-post announcement to every current subscriber
    /// who has not opted out of content mail. Opt-out never applies to
    /// the billing paths above.
    pub async fn announce_post(&self, title: &str, rendered_text: &str) -> BillingResult<usize> {
        let now = OffsetDateTime::now_utc();
        let members = self.store.list_members().await?;

        let (subject, text) = templates::post_announcement(&self.site.name, title, rendered_text);
        let messages: Vec<OutboundMessage> = members
            .iter()
            .filter(|u| !u.mail_opt_out && !u.is_lapsed(now))
            .map(|user| OutboundMessage {
                to: user.email.clone(),
                subject: subject.clone(),
                text: text.clone(),
                html: None,
            })
            .collect();

        let recipients = messages.len();
        self.dispatcher.enqueue(MailBatch {
            label: "post-announcement",
            messages,
        });

        tracing::info!(title = %title, recipients = recipients, "Post announcement queued");
        Ok(recipients)
    }

    /// One-shot transactional send (password resets and the like).
    pub fn send_single(&self, message: OutboundMessage) -> bool {
        self.dispatcher.enqueue(MailBatch {
            label: "transactional",
            messages: vec![message],
        })
    }
}
