//! Transaction database operations

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::Transaction;
use crate::Result;

use super::{parse_ts, parse_uuid};

const TXN_COLUMNS: &str = "id, contact_id, source_system, external_transaction_id, \
     amount_cents, currency, status, txn_type, txn_date, \
     payment_method, processor_reference, created_at, updated_at";

fn row_to_transaction(row: &sqlx::sqlite::SqliteRow) -> Result<Transaction> {
    let id: String = row.get("id");
    let contact_id: String = row.get("contact_id");
    let txn_date: String = row.get("txn_date");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Transaction {
        id: parse_uuid(&id)?,
        contact_id: parse_uuid(&contact_id)?,
        source_system: row.get("source_system"),
        external_transaction_id: row.get("external_transaction_id"),
        amount_cents: row.get("amount_cents"),
        currency: row.get("currency"),
        status: row.get("status"),
        txn_type: row.get("txn_type"),
        txn_date: parse_ts(&txn_date)?,
        payment_method: row.get("payment_method"),
        processor_reference: row.get("processor_reference"),
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

/// Look up by the provenance pair, the first-seen idempotency key.
pub async fn find_by_provenance(
    pool: &SqlitePool,
    source_system: &str,
    external_transaction_id: &str,
) -> Result<Option<Transaction>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM transactions \
         WHERE source_system = ? AND external_transaction_id = ?",
        TXN_COLUMNS
    ))
    .bind(source_system)
    .bind(external_transaction_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_transaction).transpose()
}

/// Probable-duplicate candidates: same contact, same transaction type,
/// amount within epsilon, transaction dates inside the window, recorded
/// by a different source. The type constraint keeps a refund from ever
/// matching the purchase it reverses. Ordered by created_at so the
/// caller's earliest-wins pick is stable.
pub async fn find_probable_duplicates(
    pool: &SqlitePool,
    contact_id: Uuid,
    amount_cents: i64,
    epsilon_cents: i64,
    txn_date: DateTime<Utc>,
    window_secs: i64,
    txn_type: &str,
    excluding_source: &str,
) -> Result<Vec<Transaction>> {
    let window = Duration::seconds(window_secs);
    let lo = (txn_date - window).to_rfc3339();
    let hi = (txn_date + window).to_rfc3339();

    let rows = sqlx::query(&format!(
        "SELECT {} FROM transactions \
         WHERE contact_id = ? \
           AND source_system != ? \
           AND txn_type = ? \
           AND amount_cents BETWEEN ? AND ? \
           AND txn_date BETWEEN ? AND ? \
         ORDER BY created_at ASC",
        TXN_COLUMNS
    ))
    .bind(contact_id.to_string())
    .bind(excluding_source)
    .bind(txn_type)
    .bind(amount_cents - epsilon_cents)
    .bind(amount_cents + epsilon_cents)
    .bind(lo)
    .bind(hi)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_transaction).collect()
}

/// Insert a transaction; a replay of the same provenance pair is a
/// natural no-op via ON CONFLICT DO NOTHING. Returns whether a row was
/// actually written.
pub async fn insert_idempotent(pool: &SqlitePool, txn: &Transaction) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO transactions (
            id, contact_id, source_system, external_transaction_id,
            amount_cents, currency, status, txn_type, txn_date,
            payment_method, processor_reference, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source_system, external_transaction_id) DO NOTHING
        "#,
    )
    .bind(txn.id.to_string())
    .bind(txn.contact_id.to_string())
    .bind(&txn.source_system)
    .bind(&txn.external_transaction_id)
    .bind(txn.amount_cents)
    .bind(&txn.currency)
    .bind(&txn.status)
    .bind(&txn.txn_type)
    .bind(txn.txn_date.to_rfc3339())
    .bind(&txn.payment_method)
    .bind(&txn.processor_reference)
    .bind(txn.created_at.to_rfc3339())
    .bind(txn.updated_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Cross-provider merge: keep the original row's provenance
/// (source_system, external_transaction_id, created_at) untouched and
/// attach only processor/payment-method metadata from the duplicate.
pub async fn merge_processor_metadata(
    pool: &SqlitePool,
    original_id: Uuid,
    payment_method: Option<&str>,
    processor_reference: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE transactions SET
            payment_method = COALESCE(payment_method, ?),
            processor_reference = COALESCE(processor_reference, ?),
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(payment_method)
    .bind(processor_reference)
    .bind(Utc::now().to_rfc3339())
    .bind(original_id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// All transactions for a contact, oldest first.
pub async fn list_for_contact(pool: &SqlitePool, contact_id: Uuid) -> Result<Vec<Transaction>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM transactions WHERE contact_id = ? ORDER BY txn_date ASC",
        TXN_COLUMNS
    ))
    .bind(contact_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_transaction).collect()
}
