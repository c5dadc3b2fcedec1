//! Pre-merge contact snapshots
//!
//! Every destructive contact merge performed by a bulk job first writes
//! the full pre-merge state of the record being removed. Append-only;
//! rows exist purely for manual recovery.

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::models::Contact;
use crate::{Error, Result};

pub async fn insert(
    pool: &SqlitePool,
    removed: &Contact,
    merged_into: Uuid,
    job_name: &str,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let snapshot = serde_json::to_string(removed)
        .map_err(|e| Error::Internal(format!("Failed to serialize contact snapshot: {}", e)))?;

    sqlx::query(
        r#"
        INSERT INTO merge_backups (
            id, removed_contact_id, merged_into_contact_id, snapshot, job_name, created_at
        ) VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(removed.id.to_string())
    .bind(merged_into.to_string())
    .bind(&snapshot)
    .bind(job_name)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(id)
}

pub async fn count(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM merge_backups")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
