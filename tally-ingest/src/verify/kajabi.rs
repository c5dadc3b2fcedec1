//! Kajabi channel verification
//!
//! Two schemes run concurrently on the same channel and either one
//! authenticates the request: the shared-secret header covers deliveries
//! relayed through the forwarding intermediary, the HMAC signature
//! covers deliveries arriving directly from the provider. The overlap is
//! transitional; dropping the shared secret later is a config change.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use tally_common::config::Config;

use super::{constant_time_eq, SignatureOutcome};

type HmacSha256 = Hmac<Sha256>;

pub const SHARED_SECRET_HEADER: &str = "x-webhook-secret";
pub const SIGNATURE_HEADER: &str = "x-kajabi-signature";

/// Verify a Kajabi delivery against whichever schemes are configured.
pub fn verify(headers: &HeaderMap, body: &[u8], config: &Config) -> SignatureOutcome {
    let secret_header = headers
        .get(SHARED_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    let signature_header = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    if let (Some(expected), Some(presented)) =
        (config.kajabi_shared_secret.as_deref(), secret_header)
    {
        if constant_time_eq(expected.as_bytes(), presented.as_bytes()) {
            return SignatureOutcome::Valid {
                scheme: "shared_secret",
            };
        }
    }

    if let (Some(key), Some(presented)) = (config.kajabi_hmac_secret.as_deref(), signature_header)
    {
        if hmac_matches(key, body, presented) {
            return SignatureOutcome::Valid { scheme: "hmac" };
        }
    }

    // Diagnostic context only: which headers arrived, which schemes are
    // configured. No payload, no secrets.
    tracing::warn!(
        shared_secret_header = secret_header.is_some(),
        signature_header = signature_header.is_some(),
        shared_secret_configured = config.kajabi_shared_secret.is_some(),
        hmac_configured = config.kajabi_hmac_secret.is_some(),
        "kajabi verification failed"
    );

    SignatureOutcome::invalid(match (secret_header, signature_header) {
        (None, None) => "no authentication headers present",
        _ => "no configured scheme authenticated the request",
    })
}

fn hmac_matches(key: &str, body: &[u8], presented_hex: &str) -> bool {
    let mut mac = match HmacSha256::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    let presented = match hex::decode(presented_hex.trim()) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    constant_time_eq(&computed, &presented)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn sign(key: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn shared_secret_authenticates() {
        let config = Config::for_tests();
        let mut headers = HeaderMap::new();
        headers.insert(
            SHARED_SECRET_HEADER,
            HeaderValue::from_static("test-shared-secret"),
        );

        let outcome = verify(&headers, b"{}", &config);
        assert_eq!(
            outcome,
            SignatureOutcome::Valid {
                scheme: "shared_secret"
            }
        );
    }

    #[test]
    fn hmac_authenticates_when_shared_secret_absent() {
        let config = Config::for_tests();
        let body = br#"{"event":"purchase.created"}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&sign("test-hmac-secret", body)).unwrap(),
        );

        let outcome = verify(&headers, body, &config);
        assert_eq!(outcome, SignatureOutcome::Valid { scheme: "hmac" });
    }

    #[test]
    fn wrong_secret_and_wrong_signature_reject() {
        let config = Config::for_tests();
        let body = b"{}";

        let mut headers = HeaderMap::new();
        headers.insert(SHARED_SECRET_HEADER, HeaderValue::from_static("wrong"));
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&sign("wrong-key", body)).unwrap(),
        );

        assert!(!verify(&headers, body, &config).is_valid());
    }

    #[test]
    fn hmac_over_different_body_rejects() {
        let config = Config::for_tests();
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&sign("test-hmac-secret", b"original")).unwrap(),
        );

        assert!(!verify(&headers, b"tampered", &config).is_valid());
    }

    #[test]
    fn missing_headers_reject_with_reason() {
        let config = Config::for_tests();
        let outcome = verify(&HeaderMap::new(), b"{}", &config);
        match outcome {
            SignatureOutcome::Invalid { reason } => {
                assert!(reason.contains("no authentication headers"))
            }
            other => panic!("expected invalid, got {:?}", other),
        }
    }
}
