#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Patronage Shared
//!
//! Infrastructure shared by the API server and the background worker:
//! database pool construction, migrations, and the persisted user
//! subscription model with its store abstraction.

pub mod db;
pub mod users;

pub use db::{create_pool, run_migrations};
pub use users::{
    InMemoryStore, PgSubscriptionStore, SettlementOutcome, StoreError, SubscriptionStore, User,
};
