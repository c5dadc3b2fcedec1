//! Database access for Tally
//!
//! SQLite via sqlx. Every table is created idempotently at pool init so
//! the services can start against an empty file. Correctness under
//! concurrent deliveries leans on the store, not on handler locking:
//! the partial unique index on contacts.email and the
//! (source_system, external_transaction_id) unique key are the
//! authoritative backstops for the check-then-act races in resolution
//! and reconciliation.

pub mod backups;
pub mod contacts;
pub mod dead_letters;
pub mod subscriptions;
pub mod transactions;
pub mod webhook_events;

use crate::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize database connection pool against a file path.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // mode=rwc: read, write, create
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    init_tables(&pool).await?;

    Ok(pool)
}

/// In-memory pool for tests.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePool::connect("sqlite::memory:").await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Create the Tally tables if they don't exist.
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contacts (
            id TEXT PRIMARY KEY,
            email TEXT,
            first_name TEXT,
            last_name TEXT,
            phone TEXT,
            phone_verified INTEGER NOT NULL DEFAULT 0,
            address_line1 TEXT,
            address_city TEXT,
            address_country TEXT,
            address_verified INTEGER NOT NULL DEFAULT 0,
            kajabi_member_id TEXT,
            kajabi_email TEXT,
            paypal_payer_id TEXT,
            paypal_email TEXT,
            alt_emails TEXT NOT NULL DEFAULT '[]',
            source_system TEXT NOT NULL,
            lock_level TEXT NOT NULL DEFAULT 'UNLOCKED',
            curated INTEGER NOT NULL DEFAULT 0,
            deleted_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Primary-email uniqueness is authoritative at the store level; the
    // resolver falls back to re-resolving on conflict. Scoped to live
    // rows so a soft-deleted contact releases its email.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_contacts_primary_email
        ON contacts(email) WHERE deleted_at IS NULL AND email IS NOT NULL
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            contact_id TEXT NOT NULL,
            source_system TEXT NOT NULL,
            external_transaction_id TEXT NOT NULL,
            amount_cents INTEGER NOT NULL,
            currency TEXT NOT NULL,
            status TEXT NOT NULL,
            txn_type TEXT NOT NULL,
            txn_date TEXT NOT NULL,
            payment_method TEXT,
            processor_reference TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(source_system, external_transaction_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_transactions_contact
        ON transactions(contact_id, txn_date)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subscriptions (
            id TEXT PRIMARY KEY,
            contact_id TEXT NOT NULL,
            external_subscription_id TEXT NOT NULL UNIQUE,
            source_system TEXT NOT NULL,
            plan_name TEXT,
            status TEXT NOT NULL,
            started_at TEXT,
            canceled_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS webhook_events (
            id TEXT PRIMARY KEY,
            provider TEXT NOT NULL,
            event_type TEXT NOT NULL,
            payload_sha256 TEXT NOT NULL,
            signature_valid INTEGER NOT NULL,
            status TEXT NOT NULL,
            detail TEXT,
            received_at TEXT NOT NULL,
            finished_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letters (
            id TEXT PRIMARY KEY,
            provider TEXT NOT NULL,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            error TEXT NOT NULL,
            created_at TEXT NOT NULL,
            replayed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS merge_backups (
            id TEXT PRIMARY KEY,
            removed_contact_id TEXT NOT NULL,
            merged_into_contact_id TEXT NOT NULL,
            snapshot TEXT NOT NULL,
            job_name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database tables initialized");

    Ok(())
}

/// Parse an RFC3339 timestamp column.
pub(crate) fn parse_ts(raw: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| crate::Error::Internal(format!("Failed to parse timestamp {:?}: {}", raw, e)))
}

/// Parse an optional RFC3339 timestamp column.
pub(crate) fn parse_ts_opt(
    raw: Option<String>,
) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

/// Parse a uuid column.
pub(crate) fn parse_uuid(raw: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(raw)
        .map_err(|e| crate::Error::Internal(format!("Failed to parse uuid {:?}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_pool_creates_parent_dirs_and_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tally.db");

        let pool = init_database_pool(&path).await.unwrap();
        sqlx::query("SELECT COUNT(*) FROM contacts")
            .execute(&pool)
            .await
            .unwrap();

        assert!(path.exists());
    }
}
