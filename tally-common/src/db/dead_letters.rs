//! Dead-letter capture for transient failures
//!
//! When processing fails retryably we rely on the provider's own retry,
//! but also keep the full payload here so the event can be replayed
//! manually (`tally-jobs replay`) if provider retries are exhausted.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::Result;

use super::{parse_ts, parse_ts_opt, parse_uuid};

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: Uuid,
    pub provider: String,
    pub event_type: String,
    /// The original raw JSON payload, kept verbatim for replay
    pub payload: String,
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub replayed_at: Option<DateTime<Utc>>,
}

pub async fn insert(
    pool: &SqlitePool,
    provider: &str,
    event_type: &str,
    payload: &str,
    error: &str,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO dead_letters (id, provider, event_type, payload, error, created_at, replayed_at)
        VALUES (?, ?, ?, ?, ?, ?, NULL)
        "#,
    )
    .bind(id.to_string())
    .bind(provider)
    .bind(event_type)
    .bind(payload)
    .bind(error)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(id)
}

/// Dead letters not yet replayed, oldest first.
pub async fn list_pending(pool: &SqlitePool) -> Result<Vec<DeadLetter>> {
    let rows = sqlx::query(
        "SELECT id, provider, event_type, payload, error, created_at, replayed_at \
         FROM dead_letters WHERE replayed_at IS NULL ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let id: String = row.get("id");
            let created_at: String = row.get("created_at");
            let replayed_at: Option<String> = row.get("replayed_at");
            Ok(DeadLetter {
                id: parse_uuid(&id)?,
                provider: row.get("provider"),
                event_type: row.get("event_type"),
                payload: row.get("payload"),
                error: row.get("error"),
                created_at: parse_ts(&created_at)?,
                replayed_at: parse_ts_opt(replayed_at)?,
            })
        })
        .collect()
}

pub async fn mark_replayed(pool: &SqlitePool, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE dead_letters SET replayed_at = ? WHERE id = ?")
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}
