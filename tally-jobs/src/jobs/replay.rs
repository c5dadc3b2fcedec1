//! Dead-letter replay
//!
//! Re-drives captured payloads through the same event routers the live
//! webhook path uses. Each replay appends its own audit row; the
//! original delivery's row is never touched. A letter is only marked
//! replayed once it reaches a terminal outcome that retrying cannot
//! change; retryable failures leave it pending for the next run.

use sqlx::SqlitePool;

use tally_common::config::Config;
use tally_common::db::{dead_letters, webhook_events};
use tally_common::models::{SourceSystem, WebhookStatus};
use tally_common::{Error, Result};
use tally_ingest::events::{self, DispatchResult};

#[derive(Debug, Default)]
pub struct ReplaySummary {
    pub pending: usize,
    pub succeeded: usize,
    pub failed_terminal: usize,
    pub failed_retryable: usize,
}

async fn replay_one(
    pool: &SqlitePool,
    config: &Config,
    letter: &dead_letters::DeadLetter,
) -> Result<()> {
    let hash = webhook_events::payload_hash(letter.payload.as_bytes());
    // Signature was verified on the original delivery; only verified
    // events get far enough to dead-letter.
    let audit_id = webhook_events::insert_processing(
        pool,
        &letter.provider,
        &letter.event_type,
        &hash,
        true,
    )
    .await?;

    let outcome = match serde_json::from_str::<serde_json::Value>(&letter.payload) {
        Ok(payload) => match SourceSystem::parse(&letter.provider) {
            Some(SourceSystem::Kajabi) => {
                events::dispatch_kajabi(pool, config, &letter.event_type, &payload).await
            }
            Some(SourceSystem::Paypal) => {
                events::dispatch_paypal(pool, config, &letter.event_type, &payload).await
            }
            None => Err(Error::InvalidInput(format!(
                "unknown provider: {}",
                letter.provider
            ))),
        },
        Err(e) => Err(Error::InvalidInput(format!("stored payload malformed: {}", e))),
    };

    match outcome {
        Ok(DispatchResult::Handled { detail }) => {
            webhook_events::mark_terminal(
                pool,
                audit_id,
                WebhookStatus::Success,
                Some(&format!("replay: {}", detail)),
            )
            .await?;
            dead_letters::mark_replayed(pool, letter.id).await?;
            Ok(())
        }
        Ok(DispatchResult::NotHandled) => {
            webhook_events::mark_terminal(
                pool,
                audit_id,
                WebhookStatus::Success,
                Some("replay: not_handled"),
            )
            .await?;
            dead_letters::mark_replayed(pool, letter.id).await?;
            Ok(())
        }
        Err(e) => {
            let retryable = e.is_retryable();
            let prefix = if retryable { "retryable" } else { "terminal" };
            webhook_events::mark_terminal(
                pool,
                audit_id,
                WebhookStatus::Failed,
                Some(&format!("replay {}: {}", prefix, e)),
            )
            .await?;
            if !retryable {
                // Retrying cannot change this outcome; stop re-queueing it.
                dead_letters::mark_replayed(pool, letter.id).await?;
            }
            Err(e)
        }
    }
}

/// Replay all pending dead letters, oldest first.
pub async fn run(pool: &SqlitePool, config: &Config, commit: bool) -> Result<ReplaySummary> {
    let pending = dead_letters::list_pending(pool).await?;
    let mut summary = ReplaySummary {
        pending: pending.len(),
        ..Default::default()
    };

    for letter in &pending {
        if !commit {
            tracing::info!(
                dead_letter_id = %letter.id,
                provider = %letter.provider,
                event_type = %letter.event_type,
                error = %letter.error,
                "dry run: would replay"
            );
            continue;
        }

        match replay_one(pool, config, letter).await {
            Ok(()) => summary.succeeded += 1,
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    dead_letter_id = %letter.id,
                    error = %e,
                    "replay failed; letter stays pending"
                );
                summary.failed_retryable += 1;
            }
            Err(e) => {
                tracing::error!(
                    dead_letter_id = %letter.id,
                    error = %e,
                    "replay failed terminally; letter retired"
                );
                summary.failed_terminal += 1;
            }
        }
    }

    Ok(summary)
}
