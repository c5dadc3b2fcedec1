//! PayPal event handlers
//!
//! PayPal wraps everything in `{"event_type": "...", "resource": {...}}`.
//! Sale events carry payer info we treat as provider-verified (PayPal
//! confirmed it against a payment instrument); the `custom` field is the
//! merchant pass-through where Kajabi member ids and purchase UUIDs
//! show up.

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
struct SaleResource {
    id: String,
    amount: SaleAmount,
    #[serde(default)]
    state: Option<String>,
    /// Merchant pass-through; scanned for cross-system ids
    #[serde(default)]
    custom: Option<String>,
    #[serde(default)]
    invoice_number: Option<String>,
    create_time: Option<String>,
    #[serde(default)]
    payment_mode: Option<String>,
    payer: Option<Payer>,
}

#[derive(Debug, Deserialize)]
struct SaleAmount {
    total: String,
    #[serde(default = "default_currency")]
    currency: String,
}

#[derive(Debug, Deserialize)]
struct Payer {
    payer_info: Option<PayerInfo>,
}

#[derive(Debug, Deserialize)]
struct PayerInfo {
    email: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    payer_id: Option<String>,
    phone: Option<String>,
    shipping_address: Option<ShippingAddress>,
}

#[derive(Debug, Deserialize)]
struct ShippingAddress {
    line1: Option<String>,
    city: Option<String>,
    country_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionResource {
    id: String,
    #[serde(default)]
    plan_id: Option<String>,
    start_time: Option<String>,
    subscriber: Option<Subscriber>,
}

#[derive(Debug, Deserialize)]
struct Subscriber {
    email_address: Option<String>,
    payer_id: Option<String>,
    name: Option<SubscriberName>,
}

#[derive(Debug, Deserialize)]
struct SubscriberName {
    given_name: Option<String>,
    surname: Option<String>,
}

fn default_currency() -> String {
    "USD".to_string()
}

fn resource<T: serde::de::DeserializeOwned>(payload: &serde_json::Value) -> Result<T> {
    let resource = payload
        .get("resource")
        .ok_or_else(|| Error::InvalidInput("paypal payload missing resource".to_string()))?;
    serde_json::from_value(resource.clone())
        .map_err(|e| Error::InvalidInput(format!("paypal resource malformed: {}", e)))
}

fn parse_time(raw: &Option<String>) -> DateTime<Utc> {
    raw.as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn claim_from_sale(sale: &SaleResource) -> InboundClaim {
    let mut claim = InboundClaim::new(SourceSystem::Paypal);

    if let Some(info) = sale.payer.as_ref().and_then(|p| p.payer_info.as_ref()) {
        claim.email = info.email.clone();
        claim.first_name = info.first_name.clone();
        claim.last_name = info.last_name.clone();
        claim.phone = info.phone.clone();
        claim.external_member_id = info.payer_id.clone();
        if let Some(addr) = info.shipping_address.as_ref() {
            claim.address_line1 = addr.line1.clone();
            claim.address_city = addr.city.clone();
            claim.address_country = addr.country_code.clone();
        }
    }

    // PayPal verified this data against a payment instrument; it may
    // fill blanks even under PARTIAL_LOCK.
    claim.provider_verified_contact_data = true;

    claim.reference_text = match (sale.custom.as_deref(), sale.invoice_number.as_deref()) {
        (Some(c), Some(i)) => Some(format!("{} {}", c, i)),
        (Some(c), None) => Some(c.to_string()),
        (None, Some(i)) => Some(i.to_string()),
        (None, None) => None,
    };

    claim
}

async fn handle_sale(
    pool: &SqlitePool,
    config: &Config,
    payload: &serde_json::Value,
    txn_type: &str,
) -> Result<DispatchResult> {
    let sale: SaleResource = resource(payload)?;
    let claim = claim_from_sale(&sale);

    if !claim.has_email_signal() && claim.external_member_id.is_none() && !claim.has_full_name() {
        return Err(Error::InvalidInput(
            "paypal sale carries no identity fields".to_string(),
        ));
    }

    let resolution = IdentityResolver::new().resolve(pool, &claim).await?;

    let event = MonetaryEvent {
        provider: SourceSystem::Paypal,
        external_transaction_id: sale.id.clone(),
        amount_cents: parse_amount_cents(&sale.amount.total)?,
        currency: sale.amount.currency.clone(),
        status: sale.state.clone().unwrap_or_else(|| "completed".to_string()),
        txn_type: txn_type.to_string(),
        txn_date: parse_time(&sale.create_time),
        payment_method: sale.payment_mode.clone().or_else(|| Some("paypal".to_string())),
        reference_text: claim.reference_text.clone(),
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

/// PAYMENT.SALE.COMPLETED: resolve the payer, reconcile the sale.
pub async fn handle_sale_completed(
    pool: &SqlitePool,
    config: &Config,
    payload: &serde_json::Value,
) -> Result<DispatchResult> {
    handle_sale(pool, config, payload, "purchase").await
}

/// PAYMENT.SALE.REFUNDED: same pipeline, recorded as a refund row (its
/// own provenance id, so it never collides with the original sale).
pub async fn handle_sale_refunded(
    pool: &SqlitePool,
    config: &Config,
    payload: &serde_json::Value,
) -> Result<DispatchResult> {
    handle_sale(pool, config, payload, "refund").await
}

fn claim_from_subscriber(sub: &SubscriptionResource) -> InboundClaim {
    let mut claim = InboundClaim::new(SourceSystem::Paypal);
    if let Some(subscriber) = sub.subscriber.as_ref() {
        claim.email = subscriber.email_address.clone();
        claim.external_member_id = subscriber.payer_id.clone();
        if let Some(name) = subscriber.name.as_ref() {
            claim.first_name = name.given_name.clone();
            claim.last_name = name.surname.clone();
        }
    }
    claim.provider_verified_contact_data = true;
    claim
}

/// BILLING.SUBSCRIPTION.ACTIVATED: resolve the subscriber, upsert the
/// subscription as active.
pub async fn handle_subscription_activated(
    pool: &SqlitePool,
    payload: &serde_json::Value,
) -> Result<DispatchResult> {
    let sub: SubscriptionResource = resource(payload)?;
    let claim = claim_from_subscriber(&sub);

    if !claim.has_email_signal() && claim.external_member_id.is_none() && !claim.has_full_name() {
        return Err(Error::InvalidInput(
            "paypal subscription carries no identity fields".to_string(),
        ));
    }

    let resolution = IdentityResolver::new().resolve(pool, &claim).await?;

    let now = Utc::now();
    subscriptions::upsert(
        pool,
        &Subscription {
            id: Uuid::new_v4(),
            contact_id: resolution.contact_id,
            external_subscription_id: sub.id.clone(),
            source_system: SourceSystem::Paypal.as_str().to_string(),
            plan_name: sub.plan_id.clone(),
            status: SubscriptionStatus::Active,
            started_at: Some(parse_time(&sub.start_time)),
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

/// BILLING.SUBSCRIPTION.CANCELLED / EXPIRED: terminal lifecycle
/// transition keyed by the cross-system subscription id.
pub async fn handle_subscription_ended(
    pool: &SqlitePool,
    event_type: &str,
    payload: &serde_json::Value,
) -> Result<DispatchResult> {
    let sub: SubscriptionResource = resource(payload)?;

    let status = if event_type.ends_with("EXPIRED") {
        SubscriptionStatus::Expired
    } else {
        SubscriptionStatus::Canceled
    };

    let change =
        subscriptions::set_status_guarded(pool, &sub.id, status, SourceSystem::Paypal).await?;
    let note = match change {
        StatusChange::Updated => "known=yes",
        StatusChange::DeniedByLock => "denied=lock",
        StatusChange::UnknownSubscription => {
            tracing::warn!(
                subscription_id = %sub.id,
                "terminal event for unknown subscription; recorded as no-op"
            );
            "known=no"
        }
    };

    Ok(DispatchResult::Handled {
        detail: format!("subscription={} {}", status.as_str(), note),
    })
}
