//! Webhook intake pipeline
//!
//! Both provider endpoints run the same pipeline: intake guard →
//! signature verification → audit row → router → terminal audit update →
//! response. Every delivery that reaches verification produces exactly
//! one audit row with exactly one terminal status.

use std::net::{IpAddr, SocketAddr};

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use serde_json::json;
use uuid::Uuid;

use tally_common::db::{dead_letters, webhook_events};
use tally_common::models::WebhookStatus;

use crate::error::{ApiError, ApiResult};
use crate::events::{self, DispatchResult};
use crate::verify::{self, SignatureOutcome};
use crate::AppState;

/// Build webhook routes. POST only; axum answers other methods with 405.
pub fn webhook_routes() -> Router<AppState> {
    Router::new()
        .route("/webhooks/kajabi", post(kajabi_webhook))
        .route("/webhooks/paypal", post(paypal_webhook))
}

/// Caller address for rate-limit keying. Requests driven in-process by
/// tests carry no connect info; they share one local key.
fn caller_ip(connect_info: Option<&ConnectInfo<SocketAddr>>) -> IpAddr {
    connect_info
        .map(|ci| ci.0.ip())
        .unwrap_or_else(|| IpAddr::from([127, 0, 0, 1]))
}

/// POST /webhooks/kajabi
pub async fn kajabi_webhook(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    intake(&state, connect_info.as_ref(), &body)?;

    let outcome = verify::kajabi::verify(&headers, &body, &state.config);
    process(&state, "kajabi", outcome, &body).await
}

/// POST /webhooks/paypal
pub async fn paypal_webhook(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    intake(&state, connect_info.as_ref(), &body)?;

    let outcome = state.paypal_verifier.verify(&headers, &body).await;
    process(&state, "paypal", outcome, &body).await
}

/// Intake guard: rate limit and byte ceiling, before any processing.
fn intake(
    state: &AppState,
    connect_info: Option<&ConnectInfo<SocketAddr>>,
    body: &Bytes,
) -> Result<(), ApiError> {
    if !state.rate_limiter.allow(caller_ip(connect_info)) {
        return Err(ApiError::RateLimited);
    }
    if body.len() > state.config.max_body_bytes {
        tracing::warn!(bytes = body.len(), "payload over size ceiling");
        return Err(ApiError::PayloadTooLarge);
    }
    Ok(())
}

/// Everything after the intake guard, shared by both providers.
async fn process(
    state: &AppState,
    provider: &'static str,
    signature: SignatureOutcome,
    body: &Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let payload_hash = webhook_events::payload_hash(body);

    // Parse leniently before deciding anything: the audit row wants the
    // declared event type even for requests that fail verification.
    let parsed: Option<serde_json::Value> = serde_json::from_slice(body).ok();
    let event_type = declared_event_type(provider, parsed.as_ref());

    let audit_id = webhook_events::insert_processing(
        &state.db,
        provider,
        &event_type,
        &payload_hash,
        signature.is_valid(),
    )
    .await
    .map_err(|e| ApiError::Retryable(format!("audit ledger unavailable: {}", e)))?;

    // A body that is not JSON is a malformed payload (400) no matter
    // what the verifier said about it; the PayPal verifier also rejects
    // non-JSON bodies, and that must not surface as an auth failure.
    let Some(payload) = parsed else {
        finish(state, audit_id, WebhookStatus::Failed, "malformed JSON body").await;
        return Err(ApiError::BadRequest("body is not valid JSON".to_string()));
    };

    if let SignatureOutcome::Invalid { reason } = signature {
        finish(state, audit_id, WebhookStatus::Failed, &format!("auth: {}", reason)).await;
        return Err(ApiError::Unauthorized(
            "signature verification failed".to_string(),
        ));
    }

    let dispatched = match provider {
        "kajabi" => events::dispatch_kajabi(&state.db, &state.config, &event_type, &payload).await,
        _ => events::dispatch_paypal(&state.db, &state.config, &event_type, &payload).await,
    };

    match dispatched {
        Ok(DispatchResult::Handled { detail }) => {
            finish(state, audit_id, WebhookStatus::Success, &detail).await;
            Ok(Json(json!({
                "success": true,
                "result": "handled",
                "detail": detail,
            })))
        }
        Ok(DispatchResult::NotHandled) => {
            finish(state, audit_id, WebhookStatus::Success, "not_handled").await;
            Ok(Json(json!({
                "success": true,
                "result": "not_handled",
            })))
        }
        Err(e) if e.is_retryable() => {
            // Keep the payload for manual replay if provider retries
            // run out.
            let body_text = String::from_utf8_lossy(body);
            if let Err(dl_err) = dead_letters::insert(
                &state.db,
                provider,
                &event_type,
                &body_text,
                &e.to_string(),
            )
            .await
            {
                tracing::error!(error = %dl_err, "failed to write dead letter");
            }
            finish(
                state,
                audit_id,
                WebhookStatus::Failed,
                &format!("retryable: {}", e),
            )
            .await;
            Err(ApiError::Retryable(e.to_string()))
        }
        Err(e) => {
            finish(
                state,
                audit_id,
                WebhookStatus::Failed,
                &format!("terminal: {}", e),
            )
            .await;
            Err(ApiError::BadRequest(e.to_string()))
        }
    }
}

fn declared_event_type(provider: &str, parsed: Option<&serde_json::Value>) -> String {
    let key = match provider {
        "kajabi" => "event",
        _ => "event_type",
    };
    parsed
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or("unparseable")
        .to_string()
}

/// Apply the single terminal audit transition; a lost transition is a
/// correctness bug and is logged loudly rather than swallowed.
async fn finish(state: &AppState, audit_id: Uuid, status: WebhookStatus, detail: &str) {
    match webhook_events::mark_terminal(&state.db, audit_id, status, Some(detail)).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::error!(
                %audit_id,
                status = status.as_str(),
                "audit row already terminal; duplicate transition suppressed"
            );
        }
        Err(e) => {
            tracing::error!(%audit_id, error = %e, "failed to finalize audit row");
        }
    }
}
