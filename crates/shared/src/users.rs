//! User subscription model and store
//!
//! The `users` table is the single source of truth for subscription
//! state: `role` doubles as the current plan tag after a payment, and
//! `expiration` is the paid-through horizon. The store is behind a
//! trait so the reconciler and reminder logic can be exercised against
//! an in-memory implementation in tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Role tag reserved for administrators. Admin accounts are never
/// touched by payment reconciliation.
pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A member of the site. Created by the registration flow (out of
/// scope here); the subscription core only reads it and conditionally
/// updates `role`/`expiration`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    /// Either `admin` or the plan tag of the last purchased plan.
    pub role: String,
    /// Paid-through timestamp. Unix epoch means never subscribed.
    #[serde(with = "time::serde::rfc3339")]
    pub expiration: OffsetDateTime,
    /// Excludes the user from content announcements only, never from
    /// billing reminders.
    pub mail_opt_out: bool,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }

    pub fn is_lapsed(&self, now: OffsetDateTime) -> bool {
        self.expiration <= now
    }
}

/// Result of applying one settled invoice to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// Invoice claimed and subscription extended.
    Applied { expires: OffsetDateTime },
    /// The invoice id was already applied at this (or a later)
    /// settlement stage.
    Duplicate,
    /// No matching non-admin user row. The claim is not consumed, so
    /// a later delivery of the same invoice can still apply.
    NotFound,
}

/// Persistence seam for subscription state.
///
/// `apply_settlement` is the one mutating operation: claiming the
/// invoice id and extending the user are a single atomic step, so a
/// redelivered event can never double-extend and a failed extension
/// never strands a claimed-but-unapplied invoice.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    /// All non-admin members, for reminder classification and
    /// broadcast delivery. Callers filter by predicate; no ordering is
    /// assumed.
    async fn list_members(&self) -> Result<Vec<User>, StoreError>;

    /// Claim `invoice_id` and extend the user's subscription by
    /// `extension` from `max(now, expiration)`, setting the plan tag,
    /// all in one atomic step. The claim is first-writer-wins per
    /// invoice id with one exception: a `paid` claim upgrades to
    /// `confirmed` exactly once, because the gateway delivers the
    /// provisional and the final settlement of the same invoice in
    /// sequence and both extensions are owed. Admin rows are never
    /// matched.
    async fn apply_settlement(
        &self,
        invoice_id: &str,
        username: &str,
        status: &str,
        extension: Duration,
        plan: &str,
    ) -> Result<SettlementOutcome, StoreError>;
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as(
            r#"
            SELECT id, username, email, role, expiration, mail_opt_out
            FROM users
            WHERE username = $1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn list_members(&self) -> Result<Vec<User>, StoreError> {
        let users = sqlx::query_as(
            r#"
            SELECT id, username, email, role, expiration, mail_opt_out
            FROM users
            WHERE role <> 'admin'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(users)
    }

    async fn apply_settlement(
        &self,
        invoice_id: &str,
        username: &str,
        status: &str,
        extension: Duration,
        plan: &str,
    ) -> Result<SettlementOutcome, StoreError> {
        // Claim and extension share one transaction: a failure after
        // the claim rolls the claim back, so a retried delivery is not
        // told "duplicate" for an extension that never happened.
        let mut tx = self.pool.begin().await?;

        // First writer wins per invoice id; the conflict arm lets a
        // `paid` claim upgrade to `confirmed` exactly once.
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO processed_invoices (invoice_id, username, status, processed_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (invoice_id) DO UPDATE
                SET status = EXCLUDED.status, processed_at = NOW()
                WHERE processed_invoices.status = 'paid'
                  AND EXCLUDED.status = 'confirmed'
            RETURNING invoice_id
            "#,
        )
        .bind(invoice_id)
        .bind(username)
        .bind(status)
        .fetch_optional(&mut *tx)
        .await?;

        if claimed.is_none() {
            return Ok(SettlementOutcome::Duplicate);
        }

        // Single-statement read-compute-write: GREATEST clamps the
        // base to NOW() for lapsed users and the row update serializes
        // concurrent extensions of the same user.
        let updated: Option<(OffsetDateTime,)> = sqlx::query_as(
            r#"
            UPDATE users
            SET expiration = GREATEST(expiration, NOW()) + make_interval(secs => $2),
                role = $3
            WHERE username = $1 AND role <> 'admin'
            RETURNING expiration
            "#,
        )
        .bind(username)
        .bind(extension.as_seconds_f64())
        .bind(plan)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((expires,)) = updated else {
            // Dropping the transaction rolls the claim back.
            return Ok(SettlementOutcome::NotFound);
        };

        tx.commit().await?;
        Ok(SettlementOutcome::Applied { expires })
    }
}

/// In-memory store for tests and local development, mirroring the
/// Postgres semantics (atomic claim-and-extend, serialized per user).
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<String, User>,
    /// invoice id -> claimed settlement status
    claimed: HashMap<String, String>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user: User) {
        let mut state = self.inner.write().await;
        state.users.insert(user.username.clone(), user);
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let state = self.inner.read().await;
        Ok(state.users.get(username).cloned())
    }

    async fn list_members(&self) -> Result<Vec<User>, StoreError> {
        let state = self.inner.read().await;
        Ok(state
            .users
            .values()
            .filter(|u| !u.is_admin())
            .cloned()
            .collect())
    }

    async fn apply_settlement(
        &self,
        invoice_id: &str,
        username: &str,
        status: &str,
        extension: Duration,
        plan: &str,
    ) -> Result<SettlementOutcome, StoreError> {
        // The write lock spans the whole claim-and-extend, matching
        // the transactional Postgres path.
        let mut state = self.inner.write().await;

        // User check first: a missing or admin row must not consume
        // the claim.
        match state.users.get(username) {
            Some(user) if !user.is_admin() => {}
            _ => return Ok(SettlementOutcome::NotFound),
        }

        if let Some(prev) = state.claimed.get(invoice_id) {
            if !(prev == "paid" && status == "confirmed") {
                return Ok(SettlementOutcome::Duplicate);
            }
        }
        state.claimed.insert(invoice_id.to_string(), status.to_string());

        let Some(user) = state.users.get_mut(username) else {
            return Ok(SettlementOutcome::NotFound);
        };
        let now = OffsetDateTime::now_utc();
        let base = if user.expiration > now {
            user.expiration
        } else {
            now
        };
        user.expiration = base + extension;
        user.role = plan.to_string();
        Ok(SettlementOutcome::Applied {
            expires: user.expiration,
        })
    }
}
