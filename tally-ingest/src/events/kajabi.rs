//! Kajabi event handlers
//!
//! Kajabi payloads arrive as `{"event": "...", "payload": {...}}` with a
//! `member` block on every event and `purchase`/`subscription` blocks
//! where relevant. The member block becomes an `InboundClaim` at the
//! boundary; everything past that point is typed.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use tally_common::claim::InboundClaim;
use tally_common::config::Config;
use tally_common::db::subscriptions::{self, StatusChange};
use tally_common::models::{
    parse_amount_cents, SourceSystem, Subscription, SubscriptionStatus,
};
use tally_common::reconcile::{self, MonetaryEvent};
use tally_common::resolve::IdentityResolver;
use tally_common::{Error, Result};

use super::DispatchResult;

#[derive(Debug, Deserialize)]
struct MemberBlock {
    id: Option<serde_json::Number>,
    email: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    phone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PurchaseBlock {
    id: String,
    amount: String,
    #[serde(default = "default_currency")]
    currency: String,
    #[serde(default = "default_status")]
    status: String,
    created_at: Option<String>,
    /// Free-text processor reference; may embed the PayPal txn id
    payment_reference: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionBlock {
    id: String,
    plan_name: Option<String>,
    created_at: Option<String>,
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_status() -> String {
    "completed".to_string()
}

fn member_block(payload: &serde_json::Value) -> Result<MemberBlock> {
    let member = payload
        .get("member")
        .ok_or_else(|| Error::InvalidInput("kajabi payload missing member block".to_string()))?;
    serde_json::from_value(member.clone())
        .map_err(|e| Error::InvalidInput(format!("kajabi member block malformed: {}", e)))
}

fn claim_from_member(member: &MemberBlock, reference_text: Option<String>) -> InboundClaim {
    let mut claim = InboundClaim::new(SourceSystem::Kajabi);
    claim.email = member.email.clone();
    claim.first_name = member.first_name.clone();
    claim.last_name = member.last_name.clone();
    claim.phone = member.phone.clone();
    claim.external_member_id = member.id.as_ref().map(|n| n.to_string());
    claim.reference_text = reference_text;
    // Registration data is self-reported
    claim.provider_verified_contact_data = false;
    claim
}

fn parse_date(raw: &Option<String>) -> DateTime<Utc> {
    raw.as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// purchase.created: resolve the member, reconcile the purchase.
pub async fn handle_purchase_created(
    pool: &SqlitePool,
    config: &Config,
    payload: &serde_json::Value,
) -> Result<DispatchResult> {
    let member = member_block(payload)?;
    let purchase: PurchaseBlock = payload
        .get("purchase")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| Error::InvalidInput(format!("kajabi purchase block malformed: {}", e)))?
        .ok_or_else(|| {
            Error::InvalidInput("purchase.created missing purchase block".to_string())
        })?;

    let claim = claim_from_member(&member, purchase.payment_reference.clone());
    if !claim.has_email_signal() && claim.external_member_id.is_none() && !claim.has_full_name() {
        return Err(Error::InvalidInput(
            "purchase.created carries no identity fields".to_string(),
        ));
    }

    let resolution = IdentityResolver::new().resolve(pool, &claim).await?;

    let event = MonetaryEvent {
        provider: SourceSystem::Kajabi,
        external_transaction_id: purchase.id.clone(),
        amount_cents: parse_amount_cents(&purchase.amount)?,
        currency: purchase.currency.clone(),
        status: purchase.status.clone(),
        txn_type: "purchase".to_string(),
        txn_date: parse_date(&purchase.created_at),
        payment_method: None,
        reference_text: purchase.payment_reference.clone(),
    };
    let outcome = reconcile::reconcile(pool, resolution.contact_id, &event, config).await?;

    Ok(DispatchResult::Handled {
        detail: format!(
            "match={} txn={}",
            resolution.rule.as_str(),
            outcome.audit_detail()
        ),
    })
}

/// member.created / member.updated: resolution + additive merge only.
pub async fn handle_member_upsert(
    pool: &SqlitePool,
    payload: &serde_json::Value,
) -> Result<DispatchResult> {
    let member = member_block(payload)?;
    let claim = claim_from_member(&member, None);

    if !claim.has_email_signal() && claim.external_member_id.is_none() && !claim.has_full_name() {
        return Err(Error::InvalidInput(
            "member event carries no identity fields".to_string(),
        ));
    }

    let resolution = IdentityResolver::new().resolve(pool, &claim).await?;

    Ok(DispatchResult::Handled {
        detail: format!(
            "match={} filled={}",
            resolution.rule.as_str(),
            resolution.filled.len()
        ),
    })
}

/// subscription.created: resolve the member, upsert the subscription.
pub async fn handle_subscription_created(
    pool: &SqlitePool,
    payload: &serde_json::Value,
) -> Result<DispatchResult> {
    let member = member_block(payload)?;
    let sub: SubscriptionBlock = payload
        .get("subscription")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| Error::InvalidInput(format!("kajabi subscription block malformed: {}", e)))?
        .ok_or_else(|| {
            Error::InvalidInput("subscription.created missing subscription block".to_string())
        })?;

    let claim = claim_from_member(&member, None);
    let resolution = IdentityResolver::new().resolve(pool, &claim).await?;

    let now = Utc::now();
    subscriptions::upsert(
        pool,
        &Subscription {
            id: Uuid::new_v4(),
            contact_id: resolution.contact_id,
            external_subscription_id: sub.id.clone(),
            source_system: SourceSystem::Kajabi.as_str().to_string(),
            plan_name: sub.plan_name.clone(),
            status: SubscriptionStatus::Active,
            started_at: Some(parse_date(&sub.created_at)),
            canceled_at: None,
            created_at: now,
            updated_at: now,
        },
    )
    .await?;

    Ok(DispatchResult::Handled {
        detail: format!("match={} subscription=active", resolution.rule.as_str()),
    })
}

/// subscription.canceled: lifecycle transition keyed by the cross-system
/// subscription id; no identity resolution needed when the row exists.
pub async fn handle_subscription_canceled(
    pool: &SqlitePool,
    payload: &serde_json::Value,
) -> Result<DispatchResult> {
    let sub_id = payload
        .get("subscription")
        .and_then(|s| s.get("id"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            Error::InvalidInput("subscription.canceled missing subscription id".to_string())
        })?;

    let change = subscriptions::set_status_guarded(
        pool,
        sub_id,
        SubscriptionStatus::Canceled,
        SourceSystem::Kajabi,
    )
    .await?;
    let note = match change {
        StatusChange::Updated => "known=yes",
        StatusChange::DeniedByLock => "denied=lock",
        StatusChange::UnknownSubscription => {
            tracing::warn!(
                subscription_id = sub_id,
                "cancellation for unknown subscription; recorded as no-op"
            );
            "known=no"
        }
    };

    Ok(DispatchResult::Handled {
        detail: format!("subscription=canceled {}", note),
    })
}
