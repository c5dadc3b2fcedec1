//! Bulk duplicate-contact merge
//!
//! Groups live contacts that share any identity key (any normalized
//! email across all email-bearing fields, or a provider member/payer
//! id), keeps the earliest-created record of each group and folds the
//! rest into it. The fold is fill-blank only; populated survivor fields
//! are never overwritten. Removing a duplicate rewrites its whole
//! record, so each removal is cleared through `ImportLockPolicy`
//! first: a record whose lock tier denies overwrites stays in place
//! for manual review, though it may still receive fill-blank folds as
//! a survivor.

use std::collections::HashMap;

use chrono::Utc;
use sqlx::SqlitePool;

use tally_common::db::backups;
use tally_common::db::contacts;
use tally_common::lock::{FieldClass, ImportLockPolicy, WriteKind};
use tally_common::models::Contact;
use tally_common::{Error, Result};

/// One planned merge: `losers` fold into `survivor`.
#[derive(Debug)]
pub struct MergeGroup {
    pub survivor: Contact,
    pub losers: Vec<Contact>,
}

#[derive(Debug, Default)]
pub struct MergeSummary {
    pub groups: usize,
    pub merged: usize,
    pub skipped_locked: usize,
}

/// Identity keys a contact can be grouped on.
fn group_keys(contact: &Contact) -> Vec<String> {
    let mut keys: Vec<String> = contact
        .all_emails()
        .into_iter()
        .map(|e| format!("email:{}", e))
        .collect();
    if let Some(id) = contact.kajabi_member_id.as_deref() {
        keys.push(format!("kajabi:{}", id));
    }
    if let Some(id) = contact.paypal_payer_id.as_deref() {
        keys.push(format!("paypal:{}", id));
    }
    keys
}

/// Compute the merge plan over all live contacts.
///
/// Connected components over shared keys: if A shares an email with B
/// and B shares a payer id with C, all three land in one group. The
/// survivor is the earliest-created member; ties break on id for a
/// stable plan across runs.
pub async fn plan(pool: &SqlitePool) -> Result<Vec<MergeGroup>> {
    let all = contacts::list_active(pool).await?;

    // Union-find over contact indices, keyed by identity keys.
    let mut parent: Vec<usize> = (0..all.len()).collect();
    fn root(parent: &mut Vec<usize>, mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let mut by_key: HashMap<String, usize> = HashMap::new();
    for (i, contact) in all.iter().enumerate() {
        for key in group_keys(contact) {
            match by_key.get(&key) {
                Some(&j) => {
                    let (ri, rj) = (root(&mut parent, i), root(&mut parent, j));
                    if ri != rj {
                        parent[ri] = rj;
                    }
                }
                None => {
                    by_key.insert(key, i);
                }
            }
        }
    }

    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..all.len() {
        let r = root(&mut parent, i);
        groups.entry(r).or_default().push(i);
    }

    let mut plan = Vec::new();
    for members in groups.into_values() {
        if members.len() < 2 {
            continue;
        }
        let mut records: Vec<Contact> = members.into_iter().map(|i| all[i].clone()).collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let survivor = records.remove(0);
        plan.push(MergeGroup {
            survivor,
            losers: records,
        });
    }

    // Stable output order for dry-run diffing between runs.
    plan.sort_by(|a, b| {
        a.survivor
            .created_at
            .cmp(&b.survivor.created_at)
            .then_with(|| a.survivor.id.cmp(&b.survivor.id))
    });
    Ok(plan)
}

/// Fold the loser's fields into the survivor, fill-blank only.
/// Returns the updated survivor and whether anything changed.
fn fold_missing(survivor: &Contact, loser: &Contact) -> (Contact, bool) {
    let mut merged = survivor.clone();
    let mut changed = false;

    fn blank(v: &Option<String>) -> bool {
        v.as_deref().map_or(true, |s| s.trim().is_empty())
    }
    fn fill(dst: &mut Option<String>, src: &Option<String>, changed: &mut bool) {
        if blank(dst) && !blank(src) {
            *dst = src.clone();
            *changed = true;
        }
    }

    fill(&mut merged.email, &loser.email, &mut changed);
    fill(&mut merged.first_name, &loser.first_name, &mut changed);
    fill(&mut merged.last_name, &loser.last_name, &mut changed);
    if blank(&merged.phone) && !blank(&loser.phone) {
        merged.phone = loser.phone.clone();
        merged.phone_verified = loser.phone_verified;
        changed = true;
    }
    if blank(&merged.address_line1) && !blank(&loser.address_line1) {
        merged.address_line1 = loser.address_line1.clone();
        merged.address_city = loser.address_city.clone();
        merged.address_country = loser.address_country.clone();
        merged.address_verified = loser.address_verified;
        changed = true;
    }
    fill(
        &mut merged.kajabi_member_id,
        &loser.kajabi_member_id,
        &mut changed,
    );
    fill(&mut merged.kajabi_email, &loser.kajabi_email, &mut changed);
    fill(
        &mut merged.paypal_payer_id,
        &loser.paypal_payer_id,
        &mut changed,
    );
    fill(&mut merged.paypal_email, &loser.paypal_email, &mut changed);

    // Every email the loser carried stays reachable on the survivor.
    let known = merged.all_emails();
    for email in loser.all_emails() {
        if !known.contains(&email) && !merged.alt_emails.contains(&email) {
            merged.alt_emails.push(email);
            changed = true;
        }
    }

    (merged, changed)
}

/// Execute one merge group atomically: snapshot each removed record,
/// repoint its transactions and subscriptions, fold its fields into the
/// survivor, soft-delete it.
async fn execute_group(pool: &SqlitePool, group: &MergeGroup) -> Result<usize> {
    let mut survivor = group.survivor.clone();
    let mut removed = 0usize;

    for loser in &group.losers {
        backups::insert(pool, loser, survivor.id, "merge-duplicates").await?;

        let mut tx = pool.begin().await?;
        let now = Utc::now().to_rfc3339();

        sqlx::query("UPDATE transactions SET contact_id = ?, updated_at = ? WHERE contact_id = ?")
            .bind(survivor.id.to_string())
            .bind(&now)
            .bind(loser.id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE subscriptions SET contact_id = ?, updated_at = ? WHERE contact_id = ?")
            .bind(survivor.id.to_string())
            .bind(&now)
            .bind(loser.id.to_string())
            .execute(&mut *tx)
            .await?;

        // Soft-delete before the fold: the partial unique index on
        // contacts.email must release the loser's email before the fold
        // may place it on the survivor.
        sqlx::query("UPDATE contacts SET deleted_at = ?, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&now)
            .bind(loser.id.to_string())
            .execute(&mut *tx)
            .await?;

        let (merged, changed) = fold_missing(&survivor, loser);
        if changed {
            let alt_emails = serde_json::to_string(&merged.alt_emails).map_err(|e| {
                Error::Internal(format!("Failed to serialize alt_emails: {}", e))
            })?;
            sqlx::query(
                r#"
                UPDATE contacts SET
                    email = ?, first_name = ?, last_name = ?,
                    phone = ?, phone_verified = ?,
                    address_line1 = ?, address_city = ?, address_country = ?,
                    address_verified = ?,
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
            .bind(&now)
            .bind(merged.id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            survivor = %survivor.id,
            removed = %loser.id,
            "merged duplicate contact"
        );
        survivor = merged;
        removed += 1;
    }

    Ok(removed)
}

/// Run the merge job. Dry run (the default) computes and logs the plan
/// without writing.
pub async fn run(pool: &SqlitePool, commit: bool) -> Result<MergeSummary> {
    let plan = plan(pool).await?;
    let mut summary = MergeSummary {
        groups: plan.len(),
        ..Default::default()
    };

    for group in &plan {
        // Removal rewrites the whole record; the job is the source of
        // truth for duplicate structure, but the lock tier still rules.
        let (mergeable, locked): (Vec<&Contact>, Vec<&Contact>) =
            group.losers.iter().partition(|c| {
                ImportLockPolicy::permits(
                    c.lock_level,
                    FieldClass::Enrichment,
                    true,
                    WriteKind::Overwrite,
                )
            });

        for c in &locked {
            tracing::warn!(
                contact_id = %c.id,
                survivor = %group.survivor.id,
                lock_level = c.lock_level.as_str(),
                "duplicate's lock tier denies removal; left in place for manual review"
            );
            summary.skipped_locked += 1;
        }
        if mergeable.is_empty() {
            continue;
        }

        let effective = MergeGroup {
            survivor: group.survivor.clone(),
            losers: mergeable.into_iter().cloned().collect(),
        };

        if commit {
            summary.merged += execute_group(pool, &effective).await?;
        } else {
            for loser in &effective.losers {
                tracing::info!(
                    survivor = %effective.survivor.id,
                    duplicate = %loser.id,
                    survivor_email = effective.survivor.email.as_deref().unwrap_or("-"),
                    "dry run: would merge"
                );
            }
            summary.merged += effective.losers.len();
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use tally_common::db::{self, transactions};
    use tally_common::lock::LockLevel;
    use tally_common::models::Transaction;
    use uuid::Uuid;

    fn contact(email: Option<&str>, age_days: i64) -> Contact {
        let created = Utc::now() - Duration::days(age_days);
        Contact {
            id: Uuid::new_v4(),
            email: email.map(|e| e.to_string()),
            first_name: None,
            last_name: None,
            phone: None,
            phone_verified: false,
            address_line1: None,
            address_city: None,
            address_country: None,
            address_verified: false,
            kajabi_member_id: None,
            kajabi_email: None,
            paypal_payer_id: None,
            paypal_email: None,
            alt_emails: Vec::new(),
            source_system: "kajabi".to_string(),
            lock_level: LockLevel::Unlocked,
            curated: false,
            deleted_at: None,
            created_at: created,
            updated_at: created,
        }
    }

    #[test]
    fn fold_fills_blanks_and_widens_emails_only() {
        let mut survivor = contact(Some("a@x.com"), 10);
        survivor.first_name = Some("Ada".to_string());
        let mut loser = contact(Some("b@x.com"), 5);
        loser.first_name = Some("Different".to_string());
        loser.last_name = Some("Lovelace".to_string());
        loser.paypal_payer_id = Some("PAYER123".to_string());

        let (merged, changed) = fold_missing(&survivor, &loser);
        assert!(changed);
        // Populated field untouched
        assert_eq!(merged.first_name.as_deref(), Some("Ada"));
        assert_eq!(merged.last_name.as_deref(), Some("Lovelace"));
        assert_eq!(merged.paypal_payer_id.as_deref(), Some("PAYER123"));
        assert!(merged.alt_emails.contains(&"b@x.com".to_string()));
        assert_eq!(merged.email.as_deref(), Some("a@x.com"));
    }

    #[tokio::test]
    async fn plan_groups_by_shared_email_and_keeps_oldest() {
        let pool = db::init_memory_pool().await.unwrap();

        let older = contact(Some("shared@x.com"), 10);
        let mut newer = contact(None, 2);
        newer.paypal_email = Some("SHARED@x.com".to_string());
        let unrelated = contact(Some("solo@x.com"), 7);

        contacts::insert(&pool, &older).await.unwrap();
        contacts::insert(&pool, &newer).await.unwrap();
        contacts::insert(&pool, &unrelated).await.unwrap();

        let plan = plan(&pool).await.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].survivor.id, older.id);
        assert_eq!(plan[0].losers.len(), 1);
        assert_eq!(plan[0].losers[0].id, newer.id);
    }

    #[tokio::test]
    async fn plan_bridges_groups_through_shared_payer_id() {
        let pool = db::init_memory_pool().await.unwrap();

        let a = {
            let mut c = contact(Some("a@x.com"), 10);
            c.paypal_payer_id = Some("PAYERX".to_string());
            c
        };
        let b = {
            let mut c = contact(Some("b@x.com"), 5);
            c.paypal_payer_id = Some("PAYERX".to_string());
            c.alt_emails = vec!["c@x.com".to_string()];
            c
        };
        let c = contact(Some("c@x.com"), 3);

        contacts::insert(&pool, &a).await.unwrap();
        contacts::insert(&pool, &b).await.unwrap();
        contacts::insert(&pool, &c).await.unwrap();

        let plan = plan(&pool).await.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].survivor.id, a.id);
        assert_eq!(plan[0].losers.len(), 2);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let pool = db::init_memory_pool().await.unwrap();

        let older = contact(Some("dup@x.com"), 10);
        let mut newer = contact(None, 1);
        newer.kajabi_email = Some("dup@x.com".to_string());
        contacts::insert(&pool, &older).await.unwrap();
        contacts::insert(&pool, &newer).await.unwrap();

        let summary = run(&pool, false).await.unwrap();
        assert_eq!(summary.merged, 1);

        assert_eq!(contacts::list_active(&pool).await.unwrap().len(), 2);
        assert_eq!(backups::count(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn commit_merges_snapshots_and_repoints_transactions() {
        let pool = db::init_memory_pool().await.unwrap();

        let older = contact(Some("dup@x.com"), 10);
        let mut newer = contact(None, 1);
        newer.kajabi_email = Some("dup@x.com".to_string());
        newer.last_name = Some("Byron".to_string());
        contacts::insert(&pool, &older).await.unwrap();
        contacts::insert(&pool, &newer).await.unwrap();

        let now = Utc::now();
        let txn = Transaction {
            id: Uuid::new_v4(),
            contact_id: newer.id,
            source_system: "paypal".to_string(),
            external_transaction_id: "8XJ12345AB6789012".to_string(),
            amount_cents: 5000,
            currency: "USD".to_string(),
            status: "completed".to_string(),
            txn_type: "purchase".to_string(),
            txn_date: now,
            payment_method: None,
            processor_reference: None,
            created_at: now,
            updated_at: now,
        };
        assert!(transactions::insert_idempotent(&pool, &txn).await.unwrap());

        let summary = run(&pool, true).await.unwrap();
        assert_eq!(summary.merged, 1);
        assert_eq!(summary.skipped_locked, 0);

        let live = contacts::list_active(&pool).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, older.id);
        // Fill-blank fold picked up the duplicate's last name
        assert_eq!(live[0].last_name.as_deref(), Some("Byron"));
        assert!(live[0].all_emails().contains(&"dup@x.com".to_string()));

        let moved = transactions::list_for_contact(&pool, older.id).await.unwrap();
        assert_eq!(moved.len(), 1);

        assert_eq!(backups::count(&pool).await.unwrap(), 1);

        // Second run finds nothing left to do
        let again = run(&pool, true).await.unwrap();
        assert_eq!(again.merged, 0);
    }

    #[tokio::test]
    async fn full_lock_duplicate_is_left_in_place() {
        let pool = db::init_memory_pool().await.unwrap();

        let older = contact(Some("locked@x.com"), 10);
        let mut newer = contact(None, 1);
        newer.paypal_email = Some("locked@x.com".to_string());
        newer.lock_level = LockLevel::FullLock;
        contacts::insert(&pool, &older).await.unwrap();
        contacts::insert(&pool, &newer).await.unwrap();

        let summary = run(&pool, true).await.unwrap();
        assert_eq!(summary.merged, 0);
        assert_eq!(summary.skipped_locked, 1);
        assert_eq!(contacts::list_active(&pool).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn partial_lock_duplicate_is_left_in_place() {
        let pool = db::init_memory_pool().await.unwrap();

        let older = contact(Some("legacy@x.com"), 10);
        let mut newer = contact(None, 1);
        newer.kajabi_email = Some("legacy@x.com".to_string());
        newer.lock_level = LockLevel::PartialLock;
        contacts::insert(&pool, &older).await.unwrap();
        contacts::insert(&pool, &newer).await.unwrap();

        // PARTIAL_LOCK permits billing-status updates only; removing the
        // record is an enrichment overwrite and is denied
        let summary = run(&pool, true).await.unwrap();
        assert_eq!(summary.merged, 0);
        assert_eq!(summary.skipped_locked, 1);
        assert_eq!(contacts::list_active(&pool).await.unwrap().len(), 2);
    }
}
