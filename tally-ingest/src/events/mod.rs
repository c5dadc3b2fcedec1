//! Event routing
//!
//! Maps a provider-declared event-type string to exactly one handler.
//! Unknown types are accepted (HTTP 200, result "not_handled"): the
//! providers resend anything that doesn't get a 2xx, forever.

pub mod kajabi;
pub mod paypal;

use sqlx::SqlitePool;
use tally_common::config::Config;
use tally_common::{Error, Result};

/// What the router did with a verified, parsed event.
#[derive(Debug)]
pub enum DispatchResult {
    /// A handler ran; `detail` carries the audit annotation
    /// (match rule, reconcile outcome, heuristic flags)
    Handled { detail: String },
    /// Recognized provider, unrecognized event type; success, no-op
    NotHandled,
}

/// Route a Kajabi event by its declared type.
pub async fn dispatch_kajabi(
    pool: &SqlitePool,
    config: &Config,
    event_type: &str,
    payload: &serde_json::Value,
) -> Result<DispatchResult> {
    // Kajabi wraps every event body as {"event": ..., "payload": {...}};
    // handlers see the inner block.
    let inner = || {
        payload
            .get("payload")
            .ok_or_else(|| Error::InvalidInput("kajabi envelope missing payload".to_string()))
    };
    match event_type {
        "purchase.created" => kajabi::handle_purchase_created(pool, config, inner()?).await,
        "member.created" | "member.updated" => {
            kajabi::handle_member_upsert(pool, inner()?).await
        }
        "subscription.created" => kajabi::handle_subscription_created(pool, inner()?).await,
        "subscription.canceled" => kajabi::handle_subscription_canceled(pool, inner()?).await,
        other => {
            tracing::info!(event_type = other, "unhandled kajabi event type");
            Ok(DispatchResult::NotHandled)
        }
    }
}

/// Route a PayPal event by its declared type.
pub async fn dispatch_paypal(
    pool: &SqlitePool,
    config: &Config,
    event_type: &str,
    payload: &serde_json::Value,
) -> Result<DispatchResult> {
    match event_type {
        "PAYMENT.SALE.COMPLETED" => paypal::handle_sale_completed(pool, config, payload).await,
        "PAYMENT.SALE.REFUNDED" => paypal::handle_sale_refunded(pool, config, payload).await,
        "BILLING.SUBSCRIPTION.ACTIVATED" => {
            paypal::handle_subscription_activated(pool, payload).await
        }
        "BILLING.SUBSCRIPTION.CANCELLED" | "BILLING.SUBSCRIPTION.EXPIRED" => {
            paypal::handle_subscription_ended(pool, event_type, payload).await
        }
        other => {
            tracing::info!(event_type = other, "unhandled paypal event type");
            Ok(DispatchResult::NotHandled)
        }
    }
}
