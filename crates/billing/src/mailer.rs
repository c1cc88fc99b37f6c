//! Outbound mail delivery
//!
//! A `Mailer` sends one message through the mail provider's HTTP API.
//! The `MailDispatcher` is the fire-and-forget seam: batches are
//! queued on a bounded channel and delivered by a small worker pool,
//! so the triggering request or job never blocks on mail-server round
//! trips and failures stay observable in the logs.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::{BillingError, BillingResult};

/// Queue bound. Enqueueing past this drops the batch with an error
/// log rather than blocking the caller.
const DISPATCH_QUEUE_CAPACITY: usize = 64;

const DISPATCH_WORKERS: usize = 2;

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
}

/// One unit of work for the dispatcher. A transport failure aborts
/// the remainder of the batch; the next scheduled run compensates.
#[derive(Debug)]
pub struct MailBatch {
    /// Short tag for logs, e.g. `renewal-reminders`.
    pub label: &'static str,
    pub messages: Vec<OutboundMessage>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> BillingResult<()>;
}

#[derive(Debug, Clone)]
pub struct MailerConfig {
    pub api_key: String,
    pub api_url: String,
    pub from_email: String,
    pub from_name: String,
}

impl MailerConfig {
    pub fn from_env() -> BillingResult<Self> {
        let api_key = std::env::var("MAIL_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| BillingError::Config("MAIL_API_KEY must be set".to_string()))?;
        let from_email = std::env::var("MAIL_FROM_EMAIL")
            .ok()
            .filter(|v| v.contains('@'))
            .ok_or_else(|| {
                BillingError::Config("MAIL_FROM_EMAIL must be a valid address".to_string())
            })?;

        Ok(Self {
            api_key,
            api_url: std::env::var("MAIL_API_URL")
                .unwrap_or_else(|_| "https://api.resend.com/emails".to_string()),
            from_email,
            from_name: std::env::var("MAIL_FROM_NAME").unwrap_or_else(|_| "Patronage".to_string()),
        })
    }

    pub fn from_header(&self) -> String {
        format!("{} <{}>", self.from_name, self.from_email)
    }
}

/// HTTP mailer posting to a Resend-style `/emails` endpoint. One
/// client is reused across the whole batch so the underlying
/// connection is amortized.
#[derive(Clone)]
pub struct HttpMailer {
    client: reqwest::Client,
    config: MailerConfig,
}

impl HttpMailer {
    pub fn new(config: MailerConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, message: &OutboundMessage) -> BillingResult<()> {
        let mut body = json!({
            "from": self.config.from_header(),
            "to": [message.to],
            "subject": message.subject,
            "text": message.text,
        });
        if let Some(html) = &message.html {
            body["html"] = json!(html);
        }

        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::Mail(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BillingError::Mail(format!(
                "mail API returned {status}: {detail}"
            )));
        }

        Ok(())
    }
}

/// Deliver one batch, stopping at the first transport failure.
/// Returns the number of messages actually sent.
pub(crate) async fn deliver_batch(mailer: &dyn Mailer, batch: &MailBatch) -> usize {
    let total = batch.messages.len();
    for (sent, message) in batch.messages.iter().enumerate() {
        if let Err(e) = mailer.send(message).await {
            tracing::error!(
                batch = batch.label,
                recipient = %message.to,
                sent = sent,
                remaining = total - sent,
                error = %e,
                "Mail batch aborted on delivery failure"
            );
            return sent;
        }
    }

    tracing::info!(batch = batch.label, sent = total, "Mail batch delivered");
    total
}

/// Bounded background mail queue with a worker pool.
#[derive(Clone)]
pub struct MailDispatcher {
    tx: mpsc::Sender<MailBatch>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MailDispatcher {
    pub fn spawn(mailer: Arc<dyn Mailer>) -> Self {
        Self::spawn_with(mailer, DISPATCH_WORKERS, DISPATCH_QUEUE_CAPACITY)
    }

    pub fn spawn_with(mailer: Arc<dyn Mailer>, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<MailBatch>(capacity);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let rx = rx.clone();
            let mailer = mailer.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let batch = { rx.lock().await.recv().await };
                    let Some(batch) = batch else {
                        tracing::debug!(worker = worker_id, "Mail dispatcher worker stopping");
                        break;
                    };
                    deliver_batch(mailer.as_ref(), &batch).await;
                }
            }));
        }

        Self {
            tx,
            workers: Arc::new(Mutex::new(handles)),
        }
    }

    /// Queue a batch without blocking. Returns `false` (and logs) when
    /// the queue is full or the dispatcher has shut down; misses are
    /// compensated by the next scheduled run.
    pub fn enqueue(&self, batch: MailBatch) -> bool {
        if batch.messages.is_empty() {
            return true;
        }
        let label = batch.label;
        let size = batch.messages.len();
        match self.tx.try_send(batch) {
            Ok(()) => {
                tracing::debug!(batch = label, messages = size, "Mail batch queued");
                true
            }
            Err(e) => {
                tracing::error!(batch = label, messages = size, error = %e, "Failed to queue mail batch");
                false
            }
        }
    }

    /// Close the queue and wait for workers to finish the backlog.
    /// Only meaningful on the last handle; other clones keep the
    /// channel open.
    pub async fn drain(self) {
        let Self { tx, workers } = self;
        drop(tx);
        let mut handles = workers.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test mailer that records recipients and can fail on one.
    struct RecordingMailer {
        sent: Mutex<Vec<String>>,
        fail_for: Option<String>,
        attempts: AtomicUsize,
    }

    impl RecordingMailer {
        fn new(fail_for: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail_for: fail_for.map(str::to_string),
                attempts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, message: &OutboundMessage) -> BillingResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_for.as_deref() == Some(message.to.as_str()) {
                return Err(BillingError::Mail("bad address".to_string()));
            }
            self.sent.lock().await.push(message.to.clone());
            Ok(())
        }
    }

    fn message(to: &str) -> OutboundMessage {
        OutboundMessage {
            to: to.to_string(),
            subject: "subject".to_string(),
            text: "body".to_string(),
            html: None,
        }
    }

    #[tokio::test]
    async fn batch_delivers_every_message() {
        let mailer = RecordingMailer::new(None);
        let batch = MailBatch {
            label: "test",
            messages: vec![message("a@x.com"), message("b@x.com"), message("c@x.com")],
        };

        let sent = deliver_batch(mailer.as_ref(), &batch).await;
        assert_eq!(sent, 3);
        assert_eq!(mailer.sent.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn batch_aborts_on_first_failure() {
        let mailer = RecordingMailer::new(Some("b@x.com"));
        let batch = MailBatch {
            label: "test",
            messages: vec![message("a@x.com"), message("b@x.com"), message("c@x.com")],
        };

        let sent = deliver_batch(mailer.as_ref(), &batch).await;
        assert_eq!(sent, 1, "delivery stops at the failing recipient");
        // c@x.com was never attempted.
        assert_eq!(mailer.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dispatcher_drains_queued_batches() {
        let mailer = RecordingMailer::new(None);
        let dispatcher = MailDispatcher::spawn_with(mailer.clone(), 2, 8);

        assert!(dispatcher.enqueue(MailBatch {
            label: "one",
            messages: vec![message("a@x.com")],
        }));
        assert!(dispatcher.enqueue(MailBatch {
            label: "two",
            messages: vec![message("b@x.com"), message("c@x.com")],
        }));

        dispatcher.drain().await;
        let mut sent = mailer.sent.lock().await.clone();
        sent.sort();
        assert_eq!(sent, vec!["a@x.com", "b@x.com", "c@x.com"]);
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let mailer = RecordingMailer::new(None);
        let dispatcher = MailDispatcher::spawn_with(mailer.clone(), 1, 1);
        assert!(dispatcher.enqueue(MailBatch {
            label: "empty",
            messages: vec![],
        }));
        dispatcher.drain().await;
        assert!(mailer.sent.lock().await.is_empty());
    }
}
