//! tally-common - shared core for the Tally reconciliation services
//!
//! Holds everything both the live webhook ingest service (tally-ingest)
//! and the batch reconciliation CLI (tally-jobs) need: the data models,
//! the SQLite access layer, the identity-resolution cascade, the
//! transaction reconciler, and the import-lock policy. Batch jobs are
//! the same core logic running against the full contact set.

pub mod claim;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod lock;
pub mod models;
pub mod reconcile;
pub mod resolve;

pub use error::{Error, Result};

/// Normalize an email for matching: trim and lower-case.
///
/// Every email comparison in the resolution cascade goes through this,
/// so "A@X.com " and "a@x.com" resolve to the same contact.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email("  A@X.Com "), "a@x.com");
        assert_eq!(normalize_email("a@x.com"), "a@x.com");
    }
}
