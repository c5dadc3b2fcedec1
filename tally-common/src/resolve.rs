//! Identity resolution engine
//!
//! `resolve(claim)` finds or creates the single canonical contact for an
//! inbound identity claim. The cascade is a strictly ordered list of
//! `MatchStrategy` implementations; the first hit wins and later rules
//! are never consulted. Every rule is independently testable.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::claim::InboundClaim;
use crate::db::contacts::{self, InsertOutcome};
use crate::db::transactions;
use crate::extract::{self, IdKind};
use crate::lock::LockLevel;
use crate::models::{Contact, SourceSystem};
use crate::{Error, Result};

/// Which rule of the cascade produced the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    /// A cross-system identifier proved the events describe the same
    /// person/purchase; strongest signal
    CrossSystemId,
    /// Exact match on this provider's recorded email fields
    VerifiedField,
    /// Exact match on the primary email, any provider
    PrimaryEmail,
    /// First+last name equality with no email signal; weakest rule,
    /// flagged distinctly for human review
    NameHeuristic,
    /// No rule matched; a new contact was created
    Created,
}

impl MatchRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchRule::CrossSystemId => "cross_system_id",
            MatchRule::VerifiedField => "verified_field",
            MatchRule::PrimaryEmail => "primary_email",
            MatchRule::NameHeuristic => "name_heuristic",
            MatchRule::Created => "created",
        }
    }
}

/// Result of resolving a claim.
#[derive(Debug)]
pub struct Resolution {
    pub contact_id: Uuid,
    pub rule: MatchRule,
    /// Field names the additive merge filled on an existing contact
    pub filled: Vec<&'static str>,
}

/// One rule of the cascade.
#[async_trait]
pub trait MatchStrategy: Send + Sync {
    fn rule(&self) -> MatchRule;
    async fn find(&self, pool: &SqlitePool, claim: &InboundClaim) -> Result<Option<Contact>>;
}

/// Rule 1: cross-system identifier match.
///
/// Covers both the claim's own provider identifier (member/payer id
/// already recorded on a contact) and foreign identifiers scraped out of
/// free-text reference fields. A foreign transaction id is followed
/// through the transactions table to its owning contact.
pub struct CrossSystemIdMatch;

#[async_trait]
impl MatchStrategy for CrossSystemIdMatch {
    fn rule(&self) -> MatchRule {
        MatchRule::CrossSystemId
    }

    async fn find(&self, pool: &SqlitePool, claim: &InboundClaim) -> Result<Option<Contact>> {
        // The provider's own id for this person, if we've recorded it
        if let Some(ref member_id) = claim.external_member_id {
            if let Some(contact) =
                contacts::find_by_provider_member_id(pool, claim.provider, member_id).await?
            {
                return Ok(Some(contact));
            }
        }

        let Some(ref text) = claim.reference_text else {
            return Ok(None);
        };

        for found in extract::scan(claim.provider, text) {
            match found.kind {
                IdKind::MemberId => {
                    if let Some(contact) =
                        contacts::find_by_provider_member_id(pool, found.system, &found.value)
                            .await?
                    {
                        return Ok(Some(contact));
                    }
                }
                IdKind::TransactionId => {
                    if let Some(txn) = transactions::find_by_provenance(
                        pool,
                        found.system.as_str(),
                        &found.value,
                    )
                    .await?
                    {
                        if let Some(contact) = contacts::find_by_id(pool, txn.contact_id).await? {
                            if !contact.is_deleted() {
                                return Ok(Some(contact));
                            }
                        }
                    }
                }
            }
        }

        Ok(None)
    }
}

/// Rule 2: normalized equality against this provider's recorded email
/// column or the alternate-email list.
pub struct VerifiedFieldMatch;

#[async_trait]
impl MatchStrategy for VerifiedFieldMatch {
    fn rule(&self) -> MatchRule {
        MatchRule::VerifiedField
    }

    async fn find(&self, pool: &SqlitePool, claim: &InboundClaim) -> Result<Option<Contact>> {
        for candidate in claim
            .normalized_email()
            .into_iter()
            .chain(claim.alt_emails.iter().map(|e| crate::normalize_email(e)))
        {
            if candidate.is_empty() {
                continue;
            }
            if let Some(contact) =
                contacts::find_by_provider_email(pool, claim.provider, &candidate).await?
            {
                return Ok(Some(contact));
            }
        }
        Ok(None)
    }
}

/// Rule 3: normalized equality against the primary email, unrestricted
/// by provider.
pub struct PrimaryEmailMatch;

#[async_trait]
impl MatchStrategy for PrimaryEmailMatch {
    fn rule(&self) -> MatchRule {
        MatchRule::PrimaryEmail
    }

    async fn find(&self, pool: &SqlitePool, claim: &InboundClaim) -> Result<Option<Contact>> {
        match claim.normalized_email() {
            Some(email) => contacts::find_by_primary_email(pool, &email).await,
            None => Ok(None),
        }
    }
}

/// Rule 4: case-insensitive first+last name equality.
///
/// Consulted only when the claim carries no email signal at all; the
/// most likely rule to produce false positives, so hits are logged at
/// warn level and flagged in the audit trail.
pub struct NameMatch;

#[async_trait]
impl MatchStrategy for NameMatch {
    fn rule(&self) -> MatchRule {
        MatchRule::NameHeuristic
    }

    async fn find(&self, pool: &SqlitePool, claim: &InboundClaim) -> Result<Option<Contact>> {
        if claim.has_email_signal() || !claim.has_full_name() {
            return Ok(None);
        }
        let (Some(first), Some(last)) = (claim.first_name.as_deref(), claim.last_name.as_deref())
        else {
            return Ok(None);
        };
        contacts::find_by_name(pool, first, last).await
    }
}

/// The ordered cascade plus create-on-miss.
pub struct IdentityResolver {
    strategies: Vec<Box<dyn MatchStrategy>>,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self {
            strategies: vec![
                Box::new(CrossSystemIdMatch),
                Box::new(VerifiedFieldMatch),
                Box::new(PrimaryEmailMatch),
                Box::new(NameMatch),
            ],
        }
    }

    /// Resolve a claim to the canonical contact, creating one if no rule
    /// matches.
    ///
    /// On a match, performs the additive merge (fill-only, list widening)
    /// before returning. On create, a unique-email conflict means a
    /// concurrent request won the race; we re-resolve against the
    /// just-inserted row instead of failing.
    pub async fn resolve(&self, pool: &SqlitePool, claim: &InboundClaim) -> Result<Resolution> {
        for strategy in &self.strategies {
            if let Some(contact) = strategy.find(pool, claim).await? {
                let rule = strategy.rule();
                if rule == MatchRule::NameHeuristic {
                    tracing::warn!(
                        contact_id = %contact.id,
                        provider = %claim.provider,
                        "name-heuristic identity match; review recommended"
                    );
                } else {
                    tracing::debug!(
                        contact_id = %contact.id,
                        rule = rule.as_str(),
                        provider = %claim.provider,
                        "identity resolved"
                    );
                }
                let filled = contacts::additive_merge(pool, &contact, claim).await?;
                return Ok(Resolution {
                    contact_id: contact.id,
                    rule,
                    filled,
                });
            }
        }

        let contact = contact_from_claim(claim);
        match contacts::insert(pool, &contact).await? {
            InsertOutcome::Inserted => {
                tracing::info!(
                    contact_id = %contact.id,
                    provider = %claim.provider,
                    "new contact created"
                );
                Ok(Resolution {
                    contact_id: contact.id,
                    rule: MatchRule::Created,
                    filled: Vec::new(),
                })
            }
            InsertOutcome::EmailConflict => {
                // Lost the create race; the winner's row is authoritative.
                let email = claim.normalized_email().ok_or_else(|| {
                    Error::Internal("email conflict on a claim without an email".to_string())
                })?;
                let existing = contacts::find_by_primary_email(pool, &email)
                    .await?
                    .ok_or_else(|| {
                        Error::Internal(format!(
                            "conflicting contact vanished for email {}",
                            email
                        ))
                    })?;
                tracing::debug!(
                    contact_id = %existing.id,
                    "create raced; merged into concurrent winner"
                );
                let filled = contacts::additive_merge(pool, &existing, claim).await?;
                Ok(Resolution {
                    contact_id: existing.id,
                    rule: MatchRule::PrimaryEmail,
                    filled,
                })
            }
        }
    }
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a fresh contact from an unmatched claim, stamping provenance.
fn contact_from_claim(claim: &InboundClaim) -> Contact {
    let now = chrono::Utc::now();
    let mut contact = Contact {
        id: Uuid::new_v4(),
        email: claim.normalized_email(),
        first_name: claim.first_name.clone(),
        last_name: claim.last_name.clone(),
        phone: claim.phone.clone(),
        phone_verified: claim.phone.is_some() && claim.provider_verified_contact_data,
        address_line1: claim.address_line1.clone(),
        address_city: claim.address_city.clone(),
        address_country: claim.address_country.clone(),
        address_verified: claim.address_line1.is_some() && claim.provider_verified_contact_data,
        kajabi_member_id: None,
        kajabi_email: None,
        paypal_payer_id: None,
        paypal_email: None,
        alt_emails: claim
            .alt_emails
            .iter()
            .map(|e| crate::normalize_email(e))
            .filter(|e| !e.is_empty())
            .collect(),
        source_system: claim.provider.as_str().to_string(),
        lock_level: LockLevel::Unlocked,
        curated: false,
        deleted_at: None,
        created_at: now,
        updated_at: now,
    };

    match claim.provider {
        SourceSystem::Kajabi => {
            contact.kajabi_member_id = claim.external_member_id.clone();
            contact.kajabi_email = claim.normalized_email();
        }
        SourceSystem::Paypal => {
            contact.paypal_payer_id = claim.external_member_id.clone();
            contact.paypal_email = claim.normalized_email();
        }
    }

    // The primary email can't also sit in alt_emails
    if let Some(ref primary) = contact.email {
        contact.alt_emails.retain(|e| e != primary);
    }

    contact
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn kajabi_claim(email: &str) -> InboundClaim {
        let mut claim = InboundClaim::new(SourceSystem::Kajabi);
        claim.email = Some(email.to_string());
        claim
    }

    #[tokio::test]
    async fn creates_contact_on_first_sight() {
        let pool = db::init_memory_pool().await.unwrap();
        let resolver = IdentityResolver::new();

        let resolution = resolver
            .resolve(&pool, &kajabi_claim("new@x.com"))
            .await
            .unwrap();
        assert_eq!(resolution.rule, MatchRule::Created);

        let contact = contacts::find_by_id(&pool, resolution.contact_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(contact.email.as_deref(), Some("new@x.com"));
        assert_eq!(contact.source_system, "kajabi");
    }

    #[tokio::test]
    async fn same_email_different_casing_resolves_to_same_contact() {
        let pool = db::init_memory_pool().await.unwrap();
        let resolver = IdentityResolver::new();

        let first = resolver
            .resolve(&pool, &kajabi_claim("A@X.com"))
            .await
            .unwrap();
        let second = resolver
            .resolve(&pool, &kajabi_claim("a@x.com "))
            .await
            .unwrap();

        assert_eq!(first.contact_id, second.contact_id);
        assert_ne!(second.rule, MatchRule::Created);
    }

    #[tokio::test]
    async fn cross_provider_email_match_hits_primary_email_rule() {
        let pool = db::init_memory_pool().await.unwrap();
        let resolver = IdentityResolver::new();

        resolver
            .resolve(&pool, &kajabi_claim("shared@x.com"))
            .await
            .unwrap();

        let mut paypal = InboundClaim::new(SourceSystem::Paypal);
        paypal.email = Some("shared@x.com".to_string());
        let resolution = resolver.resolve(&pool, &paypal).await.unwrap();

        assert_eq!(resolution.rule, MatchRule::PrimaryEmail);
    }

    #[tokio::test]
    async fn own_member_id_matches_before_email() {
        let pool = db::init_memory_pool().await.unwrap();
        let resolver = IdentityResolver::new();

        let mut claim = kajabi_claim("first@x.com");
        claim.external_member_id = Some("777".to_string());
        let created = resolver.resolve(&pool, &claim).await.unwrap();

        // Same member, new email address: member id must win the cascade
        let mut changed = kajabi_claim("renamed@x.com");
        changed.external_member_id = Some("777".to_string());
        let resolution = resolver.resolve(&pool, &changed).await.unwrap();

        assert_eq!(resolution.contact_id, created.contact_id);
        assert_eq!(resolution.rule, MatchRule::CrossSystemId);

        // The new email widened alt_emails instead of overwriting
        let contact = contacts::find_by_id(&pool, created.contact_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(contact.email.as_deref(), Some("first@x.com"));
        assert!(contact.alt_emails.contains(&"renamed@x.com".to_string()));
    }

    #[tokio::test]
    async fn name_match_only_without_email_signal() {
        let pool = db::init_memory_pool().await.unwrap();
        let resolver = IdentityResolver::new();

        let mut seed = kajabi_claim("jane@x.com");
        seed.first_name = Some("Jane".to_string());
        seed.last_name = Some("Doe".to_string());
        let created = resolver.resolve(&pool, &seed).await.unwrap();

        // No email at all: name heuristic applies
        let mut nameless = InboundClaim::new(SourceSystem::Paypal);
        nameless.first_name = Some("JANE".to_string());
        nameless.last_name = Some("doe".to_string());
        let resolution = resolver.resolve(&pool, &nameless).await.unwrap();
        assert_eq!(resolution.contact_id, created.contact_id);
        assert_eq!(resolution.rule, MatchRule::NameHeuristic);

        // With a (different) email present the name rule must not fire
        let mut with_email = InboundClaim::new(SourceSystem::Paypal);
        with_email.email = Some("other@x.com".to_string());
        with_email.first_name = Some("Jane".to_string());
        with_email.last_name = Some("Doe".to_string());
        let resolution = resolver.resolve(&pool, &with_email).await.unwrap();
        assert_eq!(resolution.rule, MatchRule::Created);
    }

    #[tokio::test]
    async fn additive_merge_never_overwrites_populated_fields() {
        let pool = db::init_memory_pool().await.unwrap();
        let resolver = IdentityResolver::new();

        let mut seed = kajabi_claim("a@x.com");
        seed.first_name = Some("Ann".to_string());
        let created = resolver.resolve(&pool, &seed).await.unwrap();

        let mut update = kajabi_claim("a@x.com");
        update.first_name = Some("Annabel".to_string());
        update.last_name = Some("Lee".to_string());
        resolver.resolve(&pool, &update).await.unwrap();

        let contact = contacts::find_by_id(&pool, created.contact_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(contact.first_name.as_deref(), Some("Ann"));
        assert_eq!(contact.last_name.as_deref(), Some("Lee"));
    }

    #[tokio::test]
    async fn insert_conflict_reresolves_against_winner() {
        let pool = db::init_memory_pool().await.unwrap();
        let resolver = IdentityResolver::new();

        let first = resolver
            .resolve(&pool, &kajabi_claim("race@x.com"))
            .await
            .unwrap();

        // Simulate the losing side of the create race: direct insert of a
        // second contact with the same primary email.
        let duplicate = contact_from_claim(&kajabi_claim("race@x.com"));
        match contacts::insert(&pool, &duplicate).await.unwrap() {
            InsertOutcome::EmailConflict => {}
            other => panic!("expected EmailConflict, got {:?}", other),
        }

        // The resolver path lands on the winner
        let resolution = resolver
            .resolve(&pool, &kajabi_claim("race@x.com"))
            .await
            .unwrap();
        assert_eq!(resolution.contact_id, first.contact_id);
    }
}
