//! tally-ingest - webhook ingestion microservice
//!
//! Receives payment/membership webhooks from the course platform
//! (Kajabi) and the payment processor (PayPal), authenticates them,
//! and reconciles them into the canonical contact and transaction
//! ledger via tally-common.

pub mod api;
pub mod error;
pub mod events;
pub mod guard;
pub mod verify;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

use tally_common::config::Config;

use crate::guard::{KeyedRateLimiter, RateLimiter};
use crate::verify::{PaypalApiVerifier, RemoteVerifier};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    pub config: Arc<Config>,
    /// Intake guard seam; in-process limiter in a single-instance deploy
    pub rate_limiter: Arc<dyn RateLimiter>,
    /// Remote-verification seam; stubbed in tests
    pub paypal_verifier: Arc<dyn RemoteVerifier>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(db: SqlitePool, config: Config) -> Self {
        let rate_limiter = Arc::new(KeyedRateLimiter::new(
            config.rate_limit_per_window,
            config.rate_window_secs,
        ));
        let paypal_verifier = Arc::new(PaypalApiVerifier::new(&config));
        Self {
            db,
            config: Arc::new(config),
            rate_limiter,
            paypal_verifier,
            startup_time: Utc::now(),
        }
    }

    /// Swap the rate limiter (tests, or a shared-store implementation).
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    /// Swap the PayPal verifier (tests inject a stub).
    pub fn with_paypal_verifier(mut self, verifier: Arc<dyn RemoteVerifier>) -> Self {
        self.paypal_verifier = verifier;
        self
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::webhook_routes())
        .merge(api::health_routes())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
