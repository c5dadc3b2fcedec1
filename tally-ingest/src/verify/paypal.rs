//! PayPal channel verification
//!
//! PayPal signs deliveries with a certificate we don't validate locally;
//! the header set is forwarded to PayPal's verify-webhook-signature API
//! and only an explicit SUCCESS verdict authenticates the request. A
//! transport failure of that call counts as verification failed, never
//! as verification skipped.

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use tally_common::config::Config;

use super::SignatureOutcome;

pub const TRANSMISSION_ID: &str = "paypal-transmission-id";
pub const TRANSMISSION_TIME: &str = "paypal-transmission-time";
pub const TRANSMISSION_SIG: &str = "paypal-transmission-sig";
pub const CERT_URL: &str = "paypal-cert-url";
pub const AUTH_ALGO: &str = "paypal-auth-algo";

const REQUIRED_HEADERS: [&str; 5] = [
    TRANSMISSION_ID,
    TRANSMISSION_TIME,
    TRANSMISSION_SIG,
    CERT_URL,
    AUTH_ALGO,
];

/// The remote-verification seam. The production implementation calls
/// PayPal; tests inject a stub so the router pipeline is testable
/// without network access.
#[async_trait]
pub trait RemoteVerifier: Send + Sync {
    async fn verify(&self, headers: &HeaderMap, body: &[u8]) -> SignatureOutcome;
}

/// Production verifier backed by PayPal's REST API.
pub struct PaypalApiVerifier {
    http: reqwest::Client,
    api_base: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    webhook_id: Option<String>,
    /// OAuth token cache: (token, hard expiry)
    token: Mutex<Option<(String, Instant)>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct VerifyResponse {
    verification_status: String,
}

impl PaypalApiVerifier {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: config.paypal_api_base.clone(),
            client_id: config.paypal_client_id.clone(),
            client_secret: config.paypal_client_secret.clone(),
            webhook_id: config.paypal_webhook_id.clone(),
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, String> {
        let (Some(client_id), Some(client_secret)) =
            (self.client_id.as_deref(), self.client_secret.as_deref())
        else {
            return Err("paypal credentials not configured".to_string());
        };

        let mut cache = self.token.lock().await;
        if let Some((token, expiry)) = cache.as_ref() {
            if Instant::now() < *expiry {
                return Ok(token.clone());
            }
        }

        let response = self
            .http
            .post(format!("{}/v1/oauth2/token", self.api_base))
            .basic_auth(client_id, Some(client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| format!("token request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("token request returned {}", response.status()));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| format!("token response malformed: {}", e))?;

        // Refresh a minute before the provider-reported expiry
        let expiry = Instant::now()
            + Duration::from_secs(token.expires_in.saturating_sub(60).max(1));
        *cache = Some((token.access_token.clone(), expiry));

        Ok(token.access_token)
    }
}

#[async_trait]
impl RemoteVerifier for PaypalApiVerifier {
    async fn verify(&self, headers: &HeaderMap, body: &[u8]) -> SignatureOutcome {
        let missing: Vec<&str> = REQUIRED_HEADERS
            .iter()
            .filter(|name| !headers.contains_key(**name))
            .copied()
            .collect();
        if !missing.is_empty() {
            tracing::warn!(missing = ?missing, "paypal verification failed: headers absent");
            return SignatureOutcome::invalid(format!("missing headers: {}", missing.join(", ")));
        }

        let Some(webhook_id) = self.webhook_id.as_deref() else {
            tracing::warn!("paypal verification failed: webhook id not configured");
            return SignatureOutcome::invalid("paypal webhook id not configured");
        };

        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
        };

        let webhook_event: serde_json::Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => return SignatureOutcome::invalid(format!("body is not JSON: {}", e)),
        };

        let token = match self.access_token().await {
            Ok(token) => token,
            Err(reason) => {
                // Network failure here is "verification failed", not
                // "verification skipped".
                tracing::warn!(%reason, "paypal verification failed: no access token");
                return SignatureOutcome::invalid(reason);
            }
        };

        let request = json!({
            "transmission_id": header(TRANSMISSION_ID),
            "transmission_time": header(TRANSMISSION_TIME),
            "transmission_sig": header(TRANSMISSION_SIG),
            "cert_url": header(CERT_URL),
            "auth_algo": header(AUTH_ALGO),
            "webhook_id": webhook_id,
            "webhook_event": webhook_event,
        });

        let response = match self
            .http
            .post(format!(
                "{}/v1/notifications/verify-webhook-signature",
                self.api_base
            ))
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "paypal verification failed: API unreachable");
                return SignatureOutcome::invalid(format!("verification API unreachable: {}", e));
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            tracing::warn!(%status, "paypal verification failed: API error");
            return SignatureOutcome::invalid(format!("verification API returned {}", status));
        }

        match response.json::<VerifyResponse>().await {
            Ok(verdict) if verdict.verification_status == "SUCCESS" => SignatureOutcome::Valid {
                scheme: "paypal_api",
            },
            Ok(verdict) => {
                tracing::warn!(
                    verdict = %verdict.verification_status,
                    "paypal verification failed: signature rejected"
                );
                SignatureOutcome::invalid(format!(
                    "verification status {}",
                    verdict.verification_status
                ))
            }
            Err(e) => SignatureOutcome::invalid(format!("verification response malformed: {}", e)),
        }
    }
}
