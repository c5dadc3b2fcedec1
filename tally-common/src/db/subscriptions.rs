//! Subscription database operations

use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::lock::{FieldClass, ImportLockPolicy, WriteKind};
use crate::models::{SourceSystem, Subscription, SubscriptionStatus};
use crate::{Error, Result};

use super::{contacts, parse_ts, parse_ts_opt, parse_uuid};

const SUB_COLUMNS: &str = "id, contact_id, external_subscription_id, source_system, \
     plan_name, status, started_at, canceled_at, created_at, updated_at";

fn row_to_subscription(row: &sqlx::sqlite::SqliteRow) -> Result<Subscription> {
    let id: String = row.get("id");
    let contact_id: String = row.get("contact_id");
    let status_raw: String = row.get("status");
    let status = SubscriptionStatus::parse(&status_raw)
        .ok_or_else(|| Error::Internal(format!("Unknown subscription status: {}", status_raw)))?;
    let started_at: Option<String> = row.get("started_at");
    let canceled_at: Option<String> = row.get("canceled_at");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Subscription {
        id: parse_uuid(&id)?,
        contact_id: parse_uuid(&contact_id)?,
        external_subscription_id: row.get("external_subscription_id"),
        source_system: row.get("source_system"),
        plan_name: row.get("plan_name"),
        status,
        started_at: parse_ts_opt(started_at)?,
        canceled_at: parse_ts_opt(canceled_at)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

/// Upsert keyed on the cross-system subscription identifier so both
/// webhook streams land on the same row. Status and cancellation data
/// follow the incoming event; plan_name only fills a blank.
pub async fn upsert(pool: &SqlitePool, sub: &Subscription) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO subscriptions (
            id, contact_id, external_subscription_id, source_system,
            plan_name, status, started_at, canceled_at, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(external_subscription_id) DO UPDATE SET
            status = excluded.status,
            plan_name = COALESCE(subscriptions.plan_name, excluded.plan_name),
            started_at = COALESCE(subscriptions.started_at, excluded.started_at),
            canceled_at = COALESCE(excluded.canceled_at, subscriptions.canceled_at),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(sub.id.to_string())
    .bind(sub.contact_id.to_string())
    .bind(&sub.external_subscription_id)
    .bind(&sub.source_system)
    .bind(&sub.plan_name)
    .bind(sub.status.as_str())
    .bind(sub.started_at.map(|dt| dt.to_rfc3339()))
    .bind(sub.canceled_at.map(|dt| dt.to_rfc3339()))
    .bind(sub.created_at.to_rfc3339())
    .bind(sub.updated_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find_by_external_id(
    pool: &SqlitePool,
    external_subscription_id: &str,
) -> Result<Option<Subscription>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM subscriptions WHERE external_subscription_id = ?",
        SUB_COLUMNS
    ))
    .bind(external_subscription_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_subscription).transpose()
}

/// Move the subscription lifecycle to a terminal provider state.
pub async fn set_status(
    pool: &SqlitePool,
    external_subscription_id: &str,
    status: SubscriptionStatus,
) -> Result<bool> {
    let canceled_at = match status {
        SubscriptionStatus::Canceled | SubscriptionStatus::Expired => {
            Some(Utc::now().to_rfc3339())
        }
        SubscriptionStatus::Active => None,
    };

    let result = sqlx::query(
        "UPDATE subscriptions SET status = ?, canceled_at = COALESCE(?, canceled_at), \
         updated_at = ? WHERE external_subscription_id = ?",
    )
    .bind(status.as_str())
    .bind(canceled_at)
    .bind(Utc::now().to_rfc3339())
    .bind(external_subscription_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Outcome of a lock-gated status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Updated,
    DeniedByLock,
    UnknownSubscription,
}

/// Lifecycle transition gated by the owning contact's import lock.
///
/// Billing status is an overwrite, so it goes through
/// `ImportLockPolicy::permits`: only the subscription's own provider may
/// move it, and a FULL_LOCK contact's subscriptions do not move at all.
pub async fn set_status_guarded(
    pool: &SqlitePool,
    external_subscription_id: &str,
    status: SubscriptionStatus,
    writer: SourceSystem,
) -> Result<StatusChange> {
    let Some(sub) = find_by_external_id(pool, external_subscription_id).await? else {
        return Ok(StatusChange::UnknownSubscription);
    };

    let contact = contacts::find_by_id(pool, sub.contact_id)
        .await?
        .ok_or_else(|| {
            Error::NotFound(format!(
                "contact {} owning subscription {}",
                sub.contact_id, external_subscription_id
            ))
        })?;

    let permitted = ImportLockPolicy::permits(
        contact.lock_level,
        FieldClass::BillingStatus,
        writer.as_str() == sub.source_system,
        WriteKind::Overwrite,
    );
    if !permitted {
        tracing::warn!(
            subscription_id = external_subscription_id,
            contact_id = %contact.id,
            lock_level = contact.lock_level.as_str(),
            writer = writer.as_str(),
            "subscription status change denied by contact lock"
        );
        return Ok(StatusChange::DeniedByLock);
    }

    if set_status(pool, external_subscription_id, status).await? {
        Ok(StatusChange::Updated)
    } else {
        Ok(StatusChange::UnknownSubscription)
    }
}
