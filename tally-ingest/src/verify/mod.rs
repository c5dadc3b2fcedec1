//! Inbound signature verification
//!
//! A request is either fully authenticated or rejected; there is no
//! partially-trusted state. Failure logging names the headers that were
//! present or absent, never payload contents or secret material.

pub mod kajabi;
pub mod paypal;

pub use paypal::{PaypalApiVerifier, RemoteVerifier};

/// Result of verifying one inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureOutcome {
    /// Authenticated; carries the scheme that matched, for the audit trail
    Valid { scheme: &'static str },
    /// Rejected; carries a diagnostic reason safe to log
    Invalid { reason: String },
}

impl SignatureOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, SignatureOutcome::Valid { .. })
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        SignatureOutcome::Invalid {
            reason: reason.into(),
        }
    }
}

/// Constant-time byte comparison so secret checks don't leak prefix
/// length through timing.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
