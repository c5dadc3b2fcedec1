//! Contact database operations

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::claim::InboundClaim;
use crate::lock::LockLevel;
use crate::models::{Contact, SourceSystem};
use crate::{Error, Result};

use super::{parse_ts, parse_ts_opt, parse_uuid};

const CONTACT_COLUMNS: &str = "id, email, first_name, last_name, phone, phone_verified, \
     address_line1, address_city, address_country, address_verified, \
     kajabi_member_id, kajabi_email, paypal_payer_id, paypal_email, \
     alt_emails, source_system, lock_level, curated, deleted_at, created_at, updated_at";

fn row_to_contact(row: &sqlx::sqlite::SqliteRow) -> Result<Contact> {
    let id: String = row.get("id");
    let alt_emails_raw: String = row.get("alt_emails");
    let alt_emails: Vec<String> = serde_json::from_str(&alt_emails_raw)
        .map_err(|e| Error::Internal(format!("Failed to deserialize alt_emails: {}", e)))?;
    let lock_level_raw: String = row.get("lock_level");
    let lock_level = LockLevel::parse(&lock_level_raw)
        .ok_or_else(|| Error::Internal(format!("Unknown lock level: {}", lock_level_raw)))?;
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    let deleted_at: Option<String> = row.get("deleted_at");

    Ok(Contact {
        id: parse_uuid(&id)?,
        email: row.get("email"),
        first_name: row.get("first_name"),
        last_name: row.get("last_name"),
        phone: row.get("phone"),
        phone_verified: row.get::<i64, _>("phone_verified") != 0,
        address_line1: row.get("address_line1"),
        address_city: row.get("address_city"),
        address_country: row.get("address_country"),
        address_verified: row.get::<i64, _>("address_verified") != 0,
        kajabi_member_id: row.get("kajabi_member_id"),
        kajabi_email: row.get("kajabi_email"),
        paypal_payer_id: row.get("paypal_payer_id"),
        paypal_email: row.get("paypal_email"),
        alt_emails,
        source_system: row.get("source_system"),
        lock_level,
        curated: row.get::<i64, _>("curated") != 0,
        deleted_at: parse_ts_opt(deleted_at)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

/// Outcome of an insert attempt against the unique primary-email index.
#[derive(Debug)]
pub enum InsertOutcome {
    Inserted,
    /// Another request created a contact with this email first; the
    /// caller re-resolves against the winning row.
    EmailConflict,
}

/// Insert a new contact.
///
/// A unique violation on the primary-email index is surfaced as
/// `EmailConflict` rather than an error: under concurrent deliveries for
/// the same unseen email both handlers may decide "create", and the
/// loser falls back to re-resolving.
pub async fn insert(pool: &SqlitePool, contact: &Contact) -> Result<InsertOutcome> {
    let alt_emails = serde_json::to_string(&contact.alt_emails)
        .map_err(|e| Error::Internal(format!("Failed to serialize alt_emails: {}", e)))?;

    let result = sqlx::query(
        r#"
        INSERT INTO contacts (
            id, email, first_name, last_name, phone, phone_verified,
            address_line1, address_city, address_country, address_verified,
            kajabi_member_id, kajabi_email, paypal_payer_id, paypal_email,
            alt_emails, source_system, lock_level, curated, deleted_at, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(contact.id.to_string())
    .bind(&contact.email)
    .bind(&contact.first_name)
    .bind(&contact.last_name)
    .bind(&contact.phone)
    .bind(contact.phone_verified as i64)
    .bind(&contact.address_line1)
    .bind(&contact.address_city)
    .bind(&contact.address_country)
    .bind(contact.address_verified as i64)
    .bind(&contact.kajabi_member_id)
    .bind(&contact.kajabi_email)
    .bind(&contact.paypal_payer_id)
    .bind(&contact.paypal_email)
    .bind(&alt_emails)
    .bind(&contact.source_system)
    .bind(contact.lock_level.as_str())
    .bind(contact.curated as i64)
    .bind(contact.deleted_at.map(|dt| dt.to_rfc3339()))
    .bind(contact.created_at.to_rfc3339())
    .bind(contact.updated_at.to_rfc3339())
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(InsertOutcome::Inserted),
        Err(e) => {
            if let Some(db_err) = e.as_database_error() {
                if db_err.is_unique_violation() {
                    return Ok(InsertOutcome::EmailConflict);
                }
            }
            Err(Error::Database(e))
        }
    }
}

pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Contact>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM contacts WHERE id = ?",
        CONTACT_COLUMNS
    ))
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_contact).transpose()
}

/// Find the live contact carrying the given provider's member/payer id.
pub async fn find_by_provider_member_id(
    pool: &SqlitePool,
    provider: SourceSystem,
    member_id: &str,
) -> Result<Option<Contact>> {
    let column = match provider {
        SourceSystem::Kajabi => "kajabi_member_id",
        SourceSystem::Paypal => "paypal_payer_id",
    };
    let row = sqlx::query(&format!(
        "SELECT {} FROM contacts WHERE {} = ? AND deleted_at IS NULL \
         ORDER BY created_at ASC LIMIT 1",
        CONTACT_COLUMNS, column
    ))
    .bind(member_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_contact).transpose()
}

/// Find a live contact by the provider's recorded email column or the
/// alternate-email list. `email` must already be normalized.
pub async fn find_by_provider_email(
    pool: &SqlitePool,
    provider: SourceSystem,
    email: &str,
) -> Result<Option<Contact>> {
    let column = match provider {
        SourceSystem::Kajabi => "kajabi_email",
        SourceSystem::Paypal => "paypal_email",
    };
    let row = sqlx::query(&format!(
        r#"
        SELECT {} FROM contacts
        WHERE deleted_at IS NULL
          AND (
            LOWER(TRIM({})) = ?
            OR EXISTS (
                SELECT 1 FROM json_each(contacts.alt_emails)
                WHERE LOWER(TRIM(json_each.value)) = ?
            )
          )
        ORDER BY created_at ASC LIMIT 1
        "#,
        CONTACT_COLUMNS, column
    ))
    .bind(email)
    .bind(email)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_contact).transpose()
}

/// Find a live contact by normalized primary email, any provider.
pub async fn find_by_primary_email(pool: &SqlitePool, email: &str) -> Result<Option<Contact>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM contacts \
         WHERE deleted_at IS NULL AND LOWER(TRIM(email)) = ? \
         ORDER BY created_at ASC LIMIT 1",
        CONTACT_COLUMNS
    ))
    .bind(email)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_contact).transpose()
}

/// Find a live contact by case-insensitive first+last name equality.
/// Deterministic under multiple hits: earliest created_at wins.
pub async fn find_by_name(
    pool: &SqlitePool,
    first_name: &str,
    last_name: &str,
) -> Result<Option<Contact>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM contacts \
         WHERE deleted_at IS NULL \
           AND LOWER(TRIM(first_name)) = LOWER(TRIM(?)) \
           AND LOWER(TRIM(last_name)) = LOWER(TRIM(?)) \
         ORDER BY created_at ASC LIMIT 1",
        CONTACT_COLUMNS
    ))
    .bind(first_name)
    .bind(last_name)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_contact).transpose()
}

/// All live contacts, for batch jobs.
pub async fn list_active(pool: &SqlitePool) -> Result<Vec<Contact>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM contacts WHERE deleted_at IS NULL ORDER BY created_at ASC",
        CONTACT_COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_contact).collect()
}

/// Additive merge: fill previously-empty fields from the claim, widen the
/// alternate-email list, never touch populated fields.
///
/// Returns the names of the fields that were filled (for audit detail).
/// Runs even under FULL_LOCK: this path can only add information, which
/// the lock policy explicitly permits.
pub async fn additive_merge(
    pool: &SqlitePool,
    existing: &Contact,
    claim: &InboundClaim,
) -> Result<Vec<&'static str>> {
    let mut merged = existing.clone();
    let mut filled: Vec<&'static str> = Vec::new();

    fn blank(v: &Option<String>) -> bool {
        v.as_deref().map_or(true, |s| s.trim().is_empty())
    }

    if blank(&merged.email) {
        if let Some(email) = claim.normalized_email() {
            merged.email = Some(email);
            filled.push("email");
        }
    }
    if blank(&merged.first_name) && !blank(&claim.first_name) {
        merged.first_name = claim.first_name.clone();
        filled.push("first_name");
    }
    if blank(&merged.last_name) && !blank(&claim.last_name) {
        merged.last_name = claim.last_name.clone();
        filled.push("last_name");
    }
    if blank(&merged.phone) && !blank(&claim.phone) {
        merged.phone = claim.phone.clone();
        merged.phone_verified = claim.provider_verified_contact_data;
        filled.push("phone");
    }
    if blank(&merged.address_line1) && !blank(&claim.address_line1) {
        merged.address_line1 = claim.address_line1.clone();
        merged.address_city = claim.address_city.clone();
        merged.address_country = claim.address_country.clone();
        merged.address_verified = claim.provider_verified_contact_data;
        filled.push("address");
    }

    match claim.provider {
        SourceSystem::Kajabi => {
            if blank(&merged.kajabi_member_id) && !blank(&claim.external_member_id) {
                merged.kajabi_member_id = claim.external_member_id.clone();
                filled.push("kajabi_member_id");
            }
            if blank(&merged.kajabi_email) {
                if let Some(email) = claim.normalized_email() {
                    merged.kajabi_email = Some(email);
                    filled.push("kajabi_email");
                }
            }
        }
        SourceSystem::Paypal => {
            if blank(&merged.paypal_payer_id) && !blank(&claim.external_member_id) {
                merged.paypal_payer_id = claim.external_member_id.clone();
                filled.push("paypal_payer_id");
            }
            if blank(&merged.paypal_email) {
                if let Some(email) = claim.normalized_email() {
                    merged.paypal_email = Some(email);
                    filled.push("paypal_email");
                }
            }
        }
    }

    // Monotonic widening: any email the claim carries that the contact
    // does not already claim anywhere gets appended to alt_emails.
    let known = merged.all_emails();
    for candidate in claim
        .normalized_email()
        .iter()
        .chain(claim.alt_emails.iter())
    {
        let normalized = crate::normalize_email(candidate);
        if !normalized.is_empty() && !known.contains(&normalized) {
            merged.alt_emails.push(normalized);
            if !filled.contains(&"alt_emails") {
                filled.push("alt_emails");
            }
        }
    }

    if filled.is_empty() {
        return Ok(filled);
    }

    let alt_emails = serde_json::to_string(&merged.alt_emails)
        .map_err(|e| Error::Internal(format!("Failed to serialize alt_emails: {}", e)))?;

    sqlx::query(
        r#"
        UPDATE contacts SET
            email = ?, first_name = ?, last_name = ?,
            phone = ?, phone_verified = ?,
            address_line1 = ?, address_city = ?, address_country = ?, address_verified = ?,
            kajabi_member_id = ?, kajabi_email = ?,
            paypal_payer_id = ?, paypal_email = ?,
            alt_emails = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&merged.email)
    .bind(&merged.first_name)
    .bind(&merged.last_name)
    .bind(&merged.phone)
    .bind(merged.phone_verified as i64)
    .bind(&merged.address_line1)
    .bind(&merged.address_city)
    .bind(&merged.address_country)
    .bind(merged.address_verified as i64)
    .bind(&merged.kajabi_member_id)
    .bind(&merged.kajabi_email)
    .bind(&merged.paypal_payer_id)
    .bind(&merged.paypal_email)
    .bind(&alt_emails)
    .bind(Utc::now().to_rfc3339())
    .bind(merged.id.to_string())
    .execute(pool)
    .await?;

    tracing::debug!(
        contact_id = %merged.id,
        filled = ?filled,
        "additive merge applied"
    );

    Ok(filled)
}

pub async fn update_lock_level(pool: &SqlitePool, id: Uuid, level: LockLevel) -> Result<()> {
    sqlx::query("UPDATE contacts SET lock_level = ?, updated_at = ? WHERE id = ?")
        .bind(level.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}
