//! Lock-tier reclassification
//!
//! Recomputes every live contact's protection tier from durable signals
//! only: how many distinct providers have contributed identity fields,
//! and whether a human has curated the record. Bookkeeping churn
//! (updated_at) deliberately plays no part; an earlier rule that keyed
//! on it froze pure provider records and had to be walked back.

use sqlx::SqlitePool;

use tally_common::db::contacts;
use tally_common::lock::{ImportLockPolicy, LockLevel, LockSignals};
use tally_common::models::Contact;
use tally_common::Result;

#[derive(Debug, Default)]
pub struct LockSummary {
    pub examined: usize,
    pub changed: usize,
}

/// Durable reclassification signals for one contact.
fn signals_for(contact: &Contact) -> LockSignals {
    let mut providers = 0usize;
    if contact.kajabi_member_id.is_some() || contact.kajabi_email.is_some() {
        providers += 1;
    }
    if contact.paypal_payer_id.is_some() || contact.paypal_email.is_some() {
        providers += 1;
    }
    LockSignals {
        distinct_provider_count: providers,
        manually_edited: contact.curated,
    }
}

/// Recompute lock tiers across all live contacts. Idempotent: a second
/// run over unchanged records reports zero transitions.
pub async fn run(pool: &SqlitePool, commit: bool) -> Result<LockSummary> {
    let all = contacts::list_active(pool).await?;
    let mut summary = LockSummary {
        examined: all.len(),
        ..Default::default()
    };

    for contact in &all {
        let target = ImportLockPolicy::classify(&signals_for(contact));
        if target == contact.lock_level {
            continue;
        }
        summary.changed += 1;

        if commit {
            contacts::update_lock_level(pool, contact.id, target).await?;
            tracing::info!(
                contact_id = %contact.id,
                from = contact.lock_level.as_str(),
                to = target.as_str(),
                "lock tier reclassified"
            );
        } else {
            tracing::info!(
                contact_id = %contact.id,
                from = contact.lock_level.as_str(),
                to = target.as_str(),
                "dry run: would reclassify"
            );
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tally_common::db;
    use uuid::Uuid;

    fn contact(kajabi: bool, paypal: bool, curated: bool, level: LockLevel) -> Contact {
        let now = Utc::now();
        Contact {
            id: Uuid::new_v4(),
            email: Some(format!("{}@x.com", Uuid::new_v4())),
            first_name: None,
            last_name: None,
            phone: None,
            phone_verified: false,
            address_line1: None,
            address_city: None,
            address_country: None,
            address_verified: false,
            kajabi_member_id: kajabi.then(|| "101".to_string()),
            kajabi_email: None,
            paypal_payer_id: paypal.then(|| "PAYER1".to_string()),
            paypal_email: None,
            alt_emails: Vec::new(),
            source_system: "kajabi".to_string(),
            lock_level: level,
            curated,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn reclassifies_multi_provider_to_full_lock() {
        let pool = db::init_memory_pool().await.unwrap();
        let both = contact(true, true, false, LockLevel::Unlocked);
        contacts::insert(&pool, &both).await.unwrap();

        let summary = run(&pool, true).await.unwrap();
        assert_eq!(summary.examined, 1);
        assert_eq!(summary.changed, 1);

        let reloaded = contacts::find_by_id(&pool, both.id).await.unwrap().unwrap();
        assert_eq!(reloaded.lock_level, LockLevel::FullLock);
    }

    #[tokio::test]
    async fn curated_single_provider_record_locks() {
        let pool = db::init_memory_pool().await.unwrap();
        let curated = contact(true, false, true, LockLevel::Unlocked);
        contacts::insert(&pool, &curated).await.unwrap();

        run(&pool, true).await.unwrap();
        let reloaded = contacts::find_by_id(&pool, curated.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.lock_level, LockLevel::FullLock);
    }

    #[tokio::test]
    async fn second_run_reports_no_transitions() {
        let pool = db::init_memory_pool().await.unwrap();
        contacts::insert(&pool, &contact(true, true, false, LockLevel::Unlocked))
            .await
            .unwrap();
        contacts::insert(&pool, &contact(true, false, false, LockLevel::PartialLock))
            .await
            .unwrap();

        let first = run(&pool, true).await.unwrap();
        assert_eq!(first.changed, 2);

        let second = run(&pool, true).await.unwrap();
        assert_eq!(second.changed, 0);
    }

    #[tokio::test]
    async fn dry_run_leaves_tiers_untouched() {
        let pool = db::init_memory_pool().await.unwrap();
        let both = contact(true, true, false, LockLevel::Unlocked);
        contacts::insert(&pool, &both).await.unwrap();

        let summary = run(&pool, false).await.unwrap();
        assert_eq!(summary.changed, 1);

        let reloaded = contacts::find_by_id(&pool, both.id).await.unwrap().unwrap();
        assert_eq!(reloaded.lock_level, LockLevel::Unlocked);
    }
}
