//! Transaction reconciliation
//!
//! Given a resolved contact and the monetary fields of an inbound event,
//! decide among: new record, idempotent replay, or a cross-provider
//! merge of a purchase the other provider already reported. Financial
//! totals depend on these decisions, so every ambiguous pick is made
//! deterministically (earliest created_at wins) and logged.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::Config;
use crate::db::transactions;
use crate::extract::{self, IdKind};
use crate::models::{SourceSystem, Transaction};
use crate::Result;

/// Monetary fields of one inbound event, already parsed and typed.
#[derive(Debug, Clone)]
pub struct MonetaryEvent {
    pub provider: SourceSystem,
    pub external_transaction_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub txn_type: String,
    pub txn_date: DateTime<Utc>,
    pub payment_method: Option<String>,
    /// Free-text reference/custom fields, scanned for the other
    /// provider's transaction id
    pub reference_text: Option<String>,
}

/// What signal identified the cross-provider duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSignal {
    /// The payload embedded the other provider's transaction id; proven
    EmbeddedId,
    /// Same contact, same amount, dates within the window; inferred
    ProbableDuplicate,
}

/// Outcome of reconciling one monetary event.
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// No duplicate signal; a new row was inserted
    Recorded { transaction_id: Uuid },
    /// The purchase was already recorded by the other provider; its
    /// provenance was kept and only processor metadata was attached
    MergedCrossProvider {
        original_id: Uuid,
        kept_source: String,
        signal: MergeSignal,
    },
    /// The exact provenance pair already exists; no-op success
    Replayed { transaction_id: Uuid },
}

impl ReconcileOutcome {
    /// Short annotation for the audit ledger.
    pub fn audit_detail(&self) -> String {
        match self {
            ReconcileOutcome::Recorded { .. } => "recorded".to_string(),
            ReconcileOutcome::MergedCrossProvider {
                kept_source,
                signal,
                ..
            } => {
                let kind = match signal {
                    MergeSignal::EmbeddedId => "embedded_id",
                    MergeSignal::ProbableDuplicate => "probable_duplicate",
                };
                format!("cross_provider_merge:{}:kept={}", kind, kept_source)
            }
            ReconcileOutcome::Replayed { .. } => "replayed".to_string(),
        }
    }
}

/// Reconcile one monetary event for a resolved contact.
pub async fn reconcile(
    pool: &SqlitePool,
    contact_id: Uuid,
    event: &MonetaryEvent,
    config: &Config,
) -> Result<ReconcileOutcome> {
    let source = event.provider.as_str();

    // Idempotent replay: this provider already reported this id.
    if let Some(existing) =
        transactions::find_by_provenance(pool, source, &event.external_transaction_id).await?
    {
        tracing::debug!(
            transaction_id = %existing.id,
            source,
            external_id = %event.external_transaction_id,
            "transaction replay; no-op"
        );
        return Ok(ReconcileOutcome::Replayed {
            transaction_id: existing.id,
        });
    }

    // Proven cross-provider duplicate: payload embeds the other
    // provider's transaction id.
    if let Some(ref text) = event.reference_text {
        for found in extract::scan(event.provider, text) {
            if found.kind != IdKind::TransactionId {
                continue;
            }
            if let Some(original) =
                transactions::find_by_provenance(pool, found.system.as_str(), &found.value)
                    .await?
            {
                return merge_into(pool, &original, event, MergeSignal::EmbeddedId).await;
            }
        }
    }

    // Probable duplicate: same contact, same transaction type, amount
    // within epsilon, dates within the window, reported by the other
    // provider. A refund never matches the purchase it reverses.
    let candidates = transactions::find_probable_duplicates(
        pool,
        contact_id,
        event.amount_cents,
        config.amount_epsilon_cents,
        event.txn_date,
        config.duplicate_window_secs,
        &event.txn_type,
        source,
    )
    .await?;

    if let Some(original) = candidates.first() {
        if candidates.len() > 1 {
            tracing::warn!(
                candidate_count = candidates.len(),
                picked = %original.id,
                contact_id = %contact_id,
                amount_cents = event.amount_cents,
                "multiple probable-duplicate candidates; earliest created_at wins"
            );
        }
        return merge_into(pool, original, event, MergeSignal::ProbableDuplicate).await;
    }

    // New record. ON CONFLICT DO NOTHING makes a concurrent
    // same-provenance insert collapse into a replay.
    let now = Utc::now();
    let txn = Transaction {
        id: Uuid::new_v4(),
        contact_id,
        source_system: source.to_string(),
        external_transaction_id: event.external_transaction_id.clone(),
        amount_cents: event.amount_cents,
        currency: event.currency.clone(),
        status: event.status.clone(),
        txn_type: event.txn_type.clone(),
        txn_date: event.txn_date,
        payment_method: event.payment_method.clone(),
        processor_reference: None,
        created_at: now,
        updated_at: now,
    };

    if transactions::insert_idempotent(pool, &txn).await? {
        tracing::info!(
            transaction_id = %txn.id,
            source,
            external_id = %event.external_transaction_id,
            amount_cents = event.amount_cents,
            "transaction recorded"
        );
        Ok(ReconcileOutcome::Recorded {
            transaction_id: txn.id,
        })
    } else {
        // Lost the insert race to an identical delivery.
        let existing =
            transactions::find_by_provenance(pool, source, &event.external_transaction_id)
                .await?
                .ok_or_else(|| {
                    crate::Error::Internal(
                        "transaction conflict row vanished after insert race".to_string(),
                    )
                })?;
        Ok(ReconcileOutcome::Replayed {
            transaction_id: existing.id,
        })
    }
}

/// Apply a cross-provider merge: the original row's provenance
/// (source_system, external_transaction_id, created_at) is preserved;
/// only processor/payment-method metadata from the duplicate is added.
async fn merge_into(
    pool: &SqlitePool,
    original: &Transaction,
    event: &MonetaryEvent,
    signal: MergeSignal,
) -> Result<ReconcileOutcome> {
    transactions::merge_processor_metadata(
        pool,
        original.id,
        event.payment_method.as_deref(),
        Some(&format!(
            "{}:{}",
            event.provider.as_str(),
            event.external_transaction_id
        )),
    )
    .await?;

    tracing::info!(
        original_id = %original.id,
        kept_source = %original.source_system,
        duplicate_source = event.provider.as_str(),
        signal = ?signal,
        "cross-provider duplicate merged; revenue counted once"
    );

    Ok(ReconcileOutcome::MergedCrossProvider {
        original_id: original.id,
        kept_source: original.source_system.clone(),
        signal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::Duration;

    fn event(provider: SourceSystem, ext_id: &str, cents: i64, date: DateTime<Utc>) -> MonetaryEvent {
        MonetaryEvent {
            provider,
            external_transaction_id: ext_id.to_string(),
            amount_cents: cents,
            currency: "USD".to_string(),
            status: "completed".to_string(),
            txn_type: "purchase".to_string(),
            txn_date: date,
            payment_method: None,
            reference_text: None,
        }
    }

    #[tokio::test]
    async fn replay_of_same_provenance_is_single_row() {
        let pool = db::init_memory_pool().await.unwrap();
        let config = Config::for_tests();
        let contact_id = Uuid::new_v4();
        let now = Utc::now();

        let ev = event(SourceSystem::Kajabi, "ord-1", 5000, now);
        let first = reconcile(&pool, contact_id, &ev, &config).await.unwrap();
        let second = reconcile(&pool, contact_id, &ev, &config).await.unwrap();

        assert!(matches!(first, ReconcileOutcome::Recorded { .. }));
        assert!(matches!(second, ReconcileOutcome::Replayed { .. }));

        let rows = transactions::list_for_contact(&pool, contact_id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn embedded_id_merge_keeps_original_provenance() {
        let pool = db::init_memory_pool().await.unwrap();
        let config = Config::for_tests();
        let contact_id = Uuid::new_v4();
        let now = Utc::now();

        // PayPal reports the purchase first
        let paypal = event(SourceSystem::Paypal, "8XJ12345AB6789012", 5000, now);
        reconcile(&pool, contact_id, &paypal, &config).await.unwrap();

        // Kajabi reports the same purchase, embedding PayPal's id
        let mut kajabi = event(
            SourceSystem::Kajabi,
            "purchase-42",
            5000,
            now + Duration::minutes(3),
        );
        kajabi.reference_text = Some("paid via paypal 8XJ12345AB6789012".to_string());
        let outcome = reconcile(&pool, contact_id, &kajabi, &config).await.unwrap();

        match outcome {
            ReconcileOutcome::MergedCrossProvider {
                kept_source,
                signal,
                ..
            } => {
                assert_eq!(kept_source, "paypal");
                assert_eq!(signal, MergeSignal::EmbeddedId);
            }
            other => panic!("expected merge, got {:?}", other),
        }

        let rows = transactions::list_for_contact(&pool, contact_id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source_system, "paypal");
        assert_eq!(
            rows[0].processor_reference.as_deref(),
            Some("kajabi:purchase-42")
        );
    }

    #[tokio::test]
    async fn probable_duplicate_within_window_merges() {
        let pool = db::init_memory_pool().await.unwrap();
        let config = Config::for_tests();
        let contact_id = Uuid::new_v4();
        let now = Utc::now();

        let p1 = event(SourceSystem::Paypal, "pp-1", 5000, now);
        reconcile(&pool, contact_id, &p1, &config).await.unwrap();

        // Same contact, same amount, 3 minutes later, no embedded id
        let k1 = event(
            SourceSystem::Kajabi,
            "kj-1",
            5000,
            now + Duration::minutes(3),
        );
        let outcome = reconcile(&pool, contact_id, &k1, &config).await.unwrap();

        match outcome {
            ReconcileOutcome::MergedCrossProvider { signal, .. } => {
                assert_eq!(signal, MergeSignal::ProbableDuplicate)
            }
            other => panic!("expected merge, got {:?}", other),
        }
        assert_eq!(
            transactions::list_for_contact(&pool, contact_id)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn refund_is_recorded_not_merged_into_the_purchase() {
        let pool = db::init_memory_pool().await.unwrap();
        let config = Config::for_tests();
        let contact_id = Uuid::new_v4();
        let now = Utc::now();

        let purchase = event(SourceSystem::Kajabi, "order-9", 5000, now);
        reconcile(&pool, contact_id, &purchase, &config).await.unwrap();

        // Same contact, same amount, inside the window, other provider:
        // everything the duplicate heuristic looks at except the type.
        let mut refund = event(
            SourceSystem::Paypal,
            "8XJ12345AB6789012",
            5000,
            now + Duration::minutes(3),
        );
        refund.txn_type = "refund".to_string();
        refund.status = "refunded".to_string();
        let outcome = reconcile(&pool, contact_id, &refund, &config).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Recorded { .. }));

        let rows = transactions::list_for_contact(&pool, contact_id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        let refund_row = rows
            .iter()
            .find(|t| t.txn_type == "refund")
            .expect("refund row must exist");
        assert_eq!(refund_row.source_system, "paypal");
        assert_eq!(refund_row.amount_cents, 5000);
    }

    #[tokio::test]
    async fn outside_window_or_different_amount_records_new() {
        let pool = db::init_memory_pool().await.unwrap();
        let config = Config::for_tests();
        let contact_id = Uuid::new_v4();
        let now = Utc::now();

        reconcile(
            &pool,
            contact_id,
            &event(SourceSystem::Paypal, "pp-1", 5000, now),
            &config,
        )
        .await
        .unwrap();

        // 20 minutes later: outside the 300s window
        let late = event(
            SourceSystem::Kajabi,
            "kj-late",
            5000,
            now + Duration::minutes(20),
        );
        assert!(matches!(
            reconcile(&pool, contact_id, &late, &config).await.unwrap(),
            ReconcileOutcome::Recorded { .. }
        ));

        // Same time, different amount
        let other_amount = event(SourceSystem::Kajabi, "kj-amt", 5001, now);
        assert!(matches!(
            reconcile(&pool, contact_id, &other_amount, &config)
                .await
                .unwrap(),
            ReconcileOutcome::Recorded { .. }
        ));

        assert_eq!(
            transactions::list_for_contact(&pool, contact_id)
                .await
                .unwrap()
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn ambiguous_duplicates_pick_earliest_created() {
        let pool = db::init_memory_pool().await.unwrap();
        let config = Config::for_tests();
        let contact_id = Uuid::new_v4();
        let now = Utc::now();

        // Two PayPal rows that both qualify as duplicate candidates.
        // Insert directly so created_at ordering is under test control.
        let older = Transaction {
            id: Uuid::new_v4(),
            contact_id,
            source_system: "paypal".to_string(),
            external_transaction_id: "pp-old".to_string(),
            amount_cents: 5000,
            currency: "USD".to_string(),
            status: "completed".to_string(),
            txn_type: "purchase".to_string(),
            txn_date: now,
            payment_method: None,
            processor_reference: None,
            created_at: now - Duration::minutes(10),
            updated_at: now - Duration::minutes(10),
        };
        transactions::insert_idempotent(&pool, &older).await.unwrap();

        let newer = Transaction {
            id: Uuid::new_v4(),
            external_transaction_id: "pp-new".to_string(),
            created_at: now,
            updated_at: now,
            ..older.clone()
        };
        transactions::insert_idempotent(&pool, &newer).await.unwrap();

        let k1 = event(SourceSystem::Kajabi, "kj-amb", 5000, now);
        let outcome = reconcile(&pool, contact_id, &k1, &config).await.unwrap();

        match outcome {
            ReconcileOutcome::MergedCrossProvider { original_id, .. } => {
                assert_eq!(original_id, older.id, "earliest created_at must win");
            }
            other => panic!("expected merge, got {:?}", other),
        }
    }
}
