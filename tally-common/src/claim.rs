//! Inbound identity claim
//!
//! Provider payloads are dynamic JSON; right after signature verification
//! each handler distills the identity-bearing fields into an
//! `InboundClaim` so everything downstream of the boundary is typed.

use crate::models::SourceSystem;

/// The subset of identity fields one inbound event supplies.
#[derive(Debug, Clone)]
pub struct InboundClaim {
    pub provider: SourceSystem,
    /// Primary email as sent (normalization happens at comparison time)
    pub email: Option<String>,
    /// Any additional emails the payload carried
    pub alt_emails: Vec<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub address_line1: Option<String>,
    pub address_city: Option<String>,
    pub address_country: Option<String>,
    /// The provider's own identifier for this person
    /// (Kajabi member id or PayPal payer id)
    pub external_member_id: Option<String>,
    /// Free-text reference/custom fields, scanned for cross-system ids
    pub reference_text: Option<String>,
    /// Payment providers report phone/address they have verified against
    /// a payment instrument; stronger trust than self-reported data
    pub provider_verified_contact_data: bool,
}

impl InboundClaim {
    pub fn new(provider: SourceSystem) -> Self {
        Self {
            provider,
            email: None,
            alt_emails: Vec::new(),
            first_name: None,
            last_name: None,
            phone: None,
            address_line1: None,
            address_city: None,
            address_country: None,
            external_member_id: None,
            reference_text: None,
            provider_verified_contact_data: false,
        }
    }

    /// Normalized primary email, if any.
    pub fn normalized_email(&self) -> Option<String> {
        self.email
            .as_deref()
            .map(crate::normalize_email)
            .filter(|e| !e.is_empty())
    }

    /// Whether this claim carries any email signal at all.
    ///
    /// The name-heuristic match rule is only consulted when this is false.
    pub fn has_email_signal(&self) -> bool {
        self.normalized_email().is_some()
            || self
                .alt_emails
                .iter()
                .any(|e| !crate::normalize_email(e).is_empty())
    }

    /// Whether first and last name are both present.
    pub fn has_full_name(&self) -> bool {
        self.first_name.as_deref().map_or(false, |s| !s.trim().is_empty())
            && self.last_name.as_deref().map_or(false, |s| !s.trim().is_empty())
    }
}
