//! Canonical contact record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lock::LockLevel;

/// Canonical person/organization entity.
///
/// Exactly one non-deleted contact may claim a given normalized email
/// across any of its email-bearing fields (email, kajabi_email,
/// paypal_email, alt_emails). The resolution cascade enforces this;
/// the `email` UNIQUE index is the store-level backstop for the
/// check-then-act race on concurrent creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    /// Primary email, stored normalized (lower-cased, trimmed)
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    /// Set when the phone came from the payment provider rather than
    /// self-reported registration data
    pub phone_verified: bool,
    pub address_line1: Option<String>,
    pub address_city: Option<String>,
    pub address_country: Option<String>,
    pub address_verified: bool,
    /// Kajabi's numeric member id, stored as text
    pub kajabi_member_id: Option<String>,
    /// Email as last seen from Kajabi (may differ from primary)
    pub kajabi_email: Option<String>,
    /// PayPal's opaque payer id
    pub paypal_payer_id: Option<String>,
    /// Email as last seen from PayPal
    pub paypal_email: Option<String>,
    /// Every other email ever seen for this contact; widened, never shrunk
    pub alt_emails: Vec<String>,
    /// Provenance: which system first created this contact
    pub source_system: String,
    pub lock_level: LockLevel,
    /// A human curated this record through the dashboard; set by the
    /// presentation layer, read by the lock reclassification job
    pub curated: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// All normalized emails this contact claims, primary first.
    pub fn all_emails(&self) -> Vec<String> {
        let mut out = Vec::new();
        for candidate in self
            .email
            .iter()
            .chain(self.kajabi_email.iter())
            .chain(self.paypal_email.iter())
            .chain(self.alt_emails.iter())
        {
            let normalized = crate::normalize_email(candidate);
            if !normalized.is_empty() && !out.contains(&normalized) {
                out.push(normalized);
            }
        }
        out
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
