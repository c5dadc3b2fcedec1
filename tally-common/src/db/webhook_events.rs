//! Audit ledger database operations
//!
//! Append-only by policy: a row is inserted as `processing` and receives
//! exactly one terminal update. Replays append new rows. Nothing here
//! ever deletes or rewrites an existing row.

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{WebhookEvent, WebhookStatus};
use crate::{Error, Result};

use super::{parse_ts, parse_ts_opt, parse_uuid};

/// SHA-256 hex digest of a raw webhook body.
pub fn payload_hash(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Record a delivery attempt before any business processing.
///
/// Called for every inbound request that passes the intake guard,
/// including requests that then fail signature verification.
pub async fn insert_processing(
    pool: &SqlitePool,
    provider: &str,
    event_type: &str,
    payload_sha256: &str,
    signature_valid: bool,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO webhook_events (
            id, provider, event_type, payload_sha256, signature_valid,
            status, detail, received_at, finished_at
        ) VALUES (?, ?, ?, ?, ?, 'processing', NULL, ?, NULL)
        "#,
    )
    .bind(id.to_string())
    .bind(provider)
    .bind(event_type)
    .bind(payload_sha256)
    .bind(signature_valid as i64)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(id)
}

/// Apply the single terminal transition for a delivery row.
///
/// Guarded on `status = 'processing'` so a second terminal write is a
/// no-op; returns whether this call performed the transition. A `false`
/// from a path that believes it owns the row is logged by the caller as
/// a correctness warning.
pub async fn mark_terminal(
    pool: &SqlitePool,
    id: Uuid,
    status: WebhookStatus,
    detail: Option<&str>,
) -> Result<bool> {
    if status == WebhookStatus::Processing {
        return Err(Error::InvalidInput(
            "terminal status cannot be 'processing'".to_string(),
        ));
    }

    let result = sqlx::query(
        "UPDATE webhook_events SET status = ?, detail = ?, finished_at = ? \
         WHERE id = ? AND status = 'processing'",
    )
    .bind(status.as_str())
    .bind(detail)
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<WebhookEvent>> {
    let row = sqlx::query(
        "SELECT id, provider, event_type, payload_sha256, signature_valid, \
                status, detail, received_at, finished_at \
         FROM webhook_events WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let id_raw: String = row.get("id");
            let status_raw: String = row.get("status");
            let status = WebhookStatus::parse(&status_raw).ok_or_else(|| {
                Error::Internal(format!("Unknown webhook status: {}", status_raw))
            })?;
            let received_at: String = row.get("received_at");
            let finished_at: Option<String> = row.get("finished_at");

            Ok(Some(WebhookEvent {
                id: parse_uuid(&id_raw)?,
                provider: row.get("provider"),
                event_type: row.get("event_type"),
                payload_sha256: row.get("payload_sha256"),
                signature_valid: row.get::<i64, _>("signature_valid") != 0,
                status,
                detail: row.get("detail"),
                received_at: parse_ts(&received_at)?,
                finished_at: parse_ts_opt(finished_at)?,
            }))
        }
        None => Ok(None),
    }
}

/// Count ledger rows for a provider/status pair, for tests and ops checks.
pub async fn count_by_status(
    pool: &SqlitePool,
    provider: &str,
    status: WebhookStatus,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM webhook_events WHERE provider = ? AND status = ?",
    )
    .bind(provider)
    .bind(status.as_str())
    .fetch_one(pool)
    .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn exactly_one_terminal_transition_wins() {
        let pool = db::init_memory_pool().await.unwrap();
        let id = insert_processing(&pool, "kajabi", "purchase.created", "abc123", true)
            .await
            .unwrap();

        assert!(mark_terminal(&pool, id, WebhookStatus::Success, Some("recorded"))
            .await
            .unwrap());
        // The losing transition is a no-op
        assert!(!mark_terminal(&pool, id, WebhookStatus::Failed, Some("late"))
            .await
            .unwrap());

        let row = find_by_id(&pool, id).await.unwrap().unwrap();
        assert_eq!(row.status, WebhookStatus::Success);
        assert_eq!(row.detail.as_deref(), Some("recorded"));
        assert!(row.finished_at.is_some());
    }

    #[tokio::test]
    async fn processing_is_rejected_as_a_terminal_status() {
        let pool = db::init_memory_pool().await.unwrap();
        let id = insert_processing(&pool, "paypal", "PAYMENT.SALE.COMPLETED", "def456", true)
            .await
            .unwrap();

        assert!(mark_terminal(&pool, id, WebhookStatus::Processing, None)
            .await
            .is_err());
    }
}
