#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Patronage API Server
//!
//! Exposes the payment-notification webhook. All collaborators
//! (store, gateway, mailer) are built once at startup and injected
//! through the application state; missing configuration is fatal
//! before the server binds.

mod config;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use patronage_billing::BillingService;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{config::Config, routes::create_router, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,patronage_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Patronage API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = patronage_shared::create_pool(&config.database_url).await?;
    patronage_shared::run_migrations(&pool).await?;

    // Exactly one gateway credential set and a working mail config are
    // required; anything else fails here, not at request time.
    let billing = Arc::new(BillingService::from_env(pool)?);
    tracing::info!("Billing service initialized");

    let state = AppState::new(billing);
    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
