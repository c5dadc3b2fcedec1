//! Configuration loading from the environment
//!
//! All tunables come in as environment variables with compiled defaults.
//! Binaries layer clap `env` fallbacks on top for the handful of values
//! that make sense as CLI flags (port, database path).

use crate::{Error, Result};

/// Shared configuration for both the ingest service and batch jobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path (file path, not URL)
    pub database_path: String,

    /// Kajabi channel: shared secret expected in `x-webhook-secret`
    /// (set when deliveries arrive via the forwarding intermediary)
    pub kajabi_shared_secret: Option<String>,
    /// Kajabi channel: HMAC key for `x-kajabi-signature`
    /// (set when deliveries arrive directly from the provider)
    pub kajabi_hmac_secret: Option<String>,

    /// PayPal REST credentials for the verify-webhook-signature API
    pub paypal_client_id: Option<String>,
    pub paypal_client_secret: Option<String>,
    /// Webhook ID registered with PayPal, required by the verification API
    pub paypal_webhook_id: Option<String>,
    /// API base, switchable to the sandbox host in test environments
    pub paypal_api_base: String,

    /// Maximum accepted webhook body size in bytes (413 above this)
    pub max_body_bytes: usize,
    /// Per-source request budget within the rate window (429 above this)
    pub rate_limit_per_window: u32,
    /// Rate window length in seconds
    pub rate_window_secs: u64,

    /// Probable-duplicate heuristic: transaction dates within this many
    /// seconds count as the same purchase window
    pub duplicate_window_secs: i64,
    /// Probable-duplicate heuristic: amount tolerance in cents.
    /// Default 0 (exact match); configurable pending product review of
    /// rounding/multi-currency behavior.
    pub amount_epsilon_cents: i64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_path: std::env::var("TALLY_DB_PATH")
                .unwrap_or_else(|_| "tally.db".to_string()),
            kajabi_shared_secret: env_opt("TALLY_KAJABI_SHARED_SECRET"),
            kajabi_hmac_secret: env_opt("TALLY_KAJABI_HMAC_SECRET"),
            paypal_client_id: env_opt("TALLY_PAYPAL_CLIENT_ID"),
            paypal_client_secret: env_opt("TALLY_PAYPAL_CLIENT_SECRET"),
            paypal_webhook_id: env_opt("TALLY_PAYPAL_WEBHOOK_ID"),
            paypal_api_base: std::env::var("TALLY_PAYPAL_API_BASE")
                .unwrap_or_else(|_| "https://api-m.paypal.com".to_string()),
            max_body_bytes: env_parsed("TALLY_MAX_BODY_BYTES", 256 * 1024)?,
            rate_limit_per_window: env_parsed("TALLY_RATE_LIMIT_PER_WINDOW", 120)?,
            rate_window_secs: env_parsed("TALLY_RATE_WINDOW_SECS", 60)?,
            duplicate_window_secs: env_parsed("TALLY_DUPLICATE_WINDOW_SECS", 300)?,
            amount_epsilon_cents: env_parsed("TALLY_AMOUNT_EPSILON_CENTS", 0)?,
        })
    }

    /// Test configuration: no provider credentials, small limits.
    pub fn for_tests() -> Self {
        Self {
            database_path: ":memory:".to_string(),
            kajabi_shared_secret: Some("test-shared-secret".to_string()),
            kajabi_hmac_secret: Some("test-hmac-secret".to_string()),
            paypal_client_id: None,
            paypal_client_secret: None,
            paypal_webhook_id: None,
            paypal_api_base: "https://api-m.sandbox.paypal.com".to_string(),
            max_body_bytes: 64 * 1024,
            rate_limit_per_window: 1000,
            rate_window_secs: 60,
            duplicate_window_secs: 300,
            amount_epsilon_cents: 0,
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{} is not a valid value: {}", key, raw))),
        Err(_) => Ok(default),
    }
}
