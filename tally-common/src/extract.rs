//! Cross-system identifier extraction
//!
//! Providers stuff each other's identifiers into free-text reference and
//! custom fields. Scraping them out is inherently fragile, so each
//! pattern lives behind the `IdentifierExtractor` strategy trait; adding
//! a new pattern never touches the resolution cascade.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::SourceSystem;

/// A cross-system identifier recovered from free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossSystemId {
    /// Which system the identifier belongs to
    pub system: SourceSystem,
    /// What kind of identifier it is
    pub kind: IdKind,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    TransactionId,
    MemberId,
}

/// One pattern for recovering a foreign identifier from opaque text.
pub trait IdentifierExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, text: &str) -> Option<CrossSystemId>;
}

/// PayPal transaction ids: 17 uppercase alphanumerics.
pub struct PaypalTxnIdExtractor;

static PAYPAL_TXN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Z0-9]{17})\b").expect("static regex"));

impl IdentifierExtractor for PaypalTxnIdExtractor {
    fn name(&self) -> &'static str {
        "paypal_txn_id"
    }

    fn extract(&self, text: &str) -> Option<CrossSystemId> {
        PAYPAL_TXN_RE.captures(text).and_then(|caps| {
            let value = caps.get(1)?.as_str();
            // All-digit runs of 17 are far more likely phone numbers or
            // order counters than PayPal ids; require at least one letter.
            if !value.chars().any(|c| c.is_ascii_alphabetic()) {
                return None;
            }
            Some(CrossSystemId {
                system: SourceSystem::Paypal,
                kind: IdKind::TransactionId,
                value: value.to_string(),
            })
        })
    }
}

/// Kajabi member ids embedded as `member_id:<digits>`.
pub struct KajabiMemberIdExtractor;

static MEMBER_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"member_id:(\d+)").expect("static regex"));

impl IdentifierExtractor for KajabiMemberIdExtractor {
    fn name(&self) -> &'static str {
        "kajabi_member_id"
    }

    fn extract(&self, text: &str) -> Option<CrossSystemId> {
        MEMBER_ID_RE.captures(text).map(|caps| CrossSystemId {
            system: SourceSystem::Kajabi,
            kind: IdKind::MemberId,
            value: caps[1].to_string(),
        })
    }
}

/// UUID-shaped tokens, used by the course platform for purchase ids.
pub struct UuidExtractor;

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})\b")
        .expect("static regex")
});

impl IdentifierExtractor for UuidExtractor {
    fn name(&self) -> &'static str {
        "uuid"
    }

    fn extract(&self, text: &str) -> Option<CrossSystemId> {
        UUID_RE.captures(text).map(|caps| CrossSystemId {
            system: SourceSystem::Kajabi,
            kind: IdKind::TransactionId,
            value: caps[1].to_lowercase(),
        })
    }
}

/// The extractors relevant when scanning text that arrived FROM the given
/// provider: we only look for the OTHER system's identifiers.
pub fn extractors_for(provider: SourceSystem) -> Vec<Box<dyn IdentifierExtractor>> {
    match provider {
        // Kajabi reference fields may embed the PayPal transaction id
        SourceSystem::Kajabi => vec![Box::new(PaypalTxnIdExtractor)],
        // PayPal custom/memo fields may embed the Kajabi member id or a
        // Kajabi purchase UUID
        SourceSystem::Paypal => vec![
            Box::new(KajabiMemberIdExtractor),
            Box::new(UuidExtractor),
        ],
    }
}

/// Run every applicable extractor over the text, first hit per extractor.
pub fn scan(provider: SourceSystem, text: &str) -> Vec<CrossSystemId> {
    extractors_for(provider)
        .iter()
        .filter_map(|ex| {
            let found = ex.extract(text);
            if let Some(ref id) = found {
                tracing::debug!(
                    extractor = ex.name(),
                    value = %id.value,
                    "extracted cross-system identifier"
                );
            }
            found
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_paypal_txn_id_from_reference() {
        let found = PaypalTxnIdExtractor
            .extract("paid via paypal ref 8XJ12345AB6789012 thanks")
            .unwrap();
        assert_eq!(found.value, "8XJ12345AB6789012");
        assert_eq!(found.system, SourceSystem::Paypal);
    }

    #[test]
    fn rejects_all_digit_seventeen_char_runs() {
        assert!(PaypalTxnIdExtractor
            .extract("order 12345678901234567 placed")
            .is_none());
    }

    #[test]
    fn extracts_member_id() {
        let found = KajabiMemberIdExtractor
            .extract("signup member_id:48213 promo")
            .unwrap();
        assert_eq!(found.value, "48213");
        assert_eq!(found.kind, IdKind::MemberId);
    }

    #[test]
    fn extracts_uuid_case_insensitively() {
        let found = UuidExtractor
            .extract("purchase 3F2504E0-4F89-11D3-9A0C-0305E82C3301 ok")
            .unwrap();
        assert_eq!(found.value, "3f2504e0-4f89-11d3-9a0c-0305e82c3301");
    }

    #[test]
    fn scan_only_looks_for_foreign_ids() {
        // A PayPal id inside a PayPal payload is not a cross-system signal
        let found = scan(SourceSystem::Paypal, "ref 8XJ12345AB6789012");
        assert!(found.is_empty());

        let found = scan(SourceSystem::Kajabi, "ref 8XJ12345AB6789012");
        assert_eq!(found.len(), 1);
    }
}
