//! Import lock policy
//!
//! Three-tier classification governing what automated writers other than
//! the additive-merge path may change on a contact. The additive merge
//! itself never consults the overwrite gate: filling a previously-null
//! field can only add information.

use serde::{Deserialize, Serialize};

/// Protection tier for a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockLevel {
    /// No field may be changed by any automated import; reserved for
    /// manually curated or multi-source-enriched records
    FullLock,
    /// Only subscription/billing-status fields may be updated, and only
    /// by the contact's source-of-truth provider
    PartialLock,
    /// The source-of-truth provider may update any field
    Unlocked,
}

impl LockLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockLevel::FullLock => "FULL_LOCK",
            LockLevel::PartialLock => "PARTIAL_LOCK",
            LockLevel::Unlocked => "UNLOCKED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FULL_LOCK" => Some(LockLevel::FullLock),
            "PARTIAL_LOCK" => Some(LockLevel::PartialLock),
            "UNLOCKED" => Some(LockLevel::Unlocked),
            _ => None,
        }
    }
}

/// What kind of field a writer wants to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldClass {
    /// Subscription/billing lifecycle fields
    BillingStatus,
    /// Names, emails, phone, address and other enrichment
    Enrichment,
}

/// How the writer wants to touch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Replace a populated value
    Overwrite,
    /// Fill a currently-null/empty value
    FillBlank,
}

/// Inputs to the batch reclassification rule.
#[derive(Debug, Clone)]
pub struct LockSignals {
    /// Number of distinct providers that have contributed fields
    pub distinct_provider_count: usize,
    /// A human has edited the record through the curation surface.
    /// Automated bookkeeping touching updated_at is NOT this signal;
    /// an earlier rule that treated it as such over-locked pure
    /// provider records and had to be walked back.
    pub manually_edited: bool,
}

/// The cross-cutting gate consulted before any multi-field overwrite
/// outside the additive-merge path.
pub struct ImportLockPolicy;

impl ImportLockPolicy {
    /// Decide whether a writer may perform this write.
    pub fn permits(
        level: LockLevel,
        field: FieldClass,
        writer_is_source_of_truth: bool,
        kind: WriteKind,
    ) -> bool {
        // Filling a blank field only adds information; allowed at every
        // tier, including FULL_LOCK.
        if kind == WriteKind::FillBlank {
            return true;
        }

        match level {
            LockLevel::FullLock => false,
            LockLevel::PartialLock => {
                writer_is_source_of_truth && field == FieldClass::BillingStatus
            }
            LockLevel::Unlocked => writer_is_source_of_truth,
        }
    }

    /// Batch reclassification: recompute the tier from durable signals.
    ///
    /// Idempotent by construction; running it twice over unchanged
    /// signals yields the same tier, so an over-broad earlier pass is
    /// corrected simply by re-running with the narrower rule.
    pub fn classify(signals: &LockSignals) -> LockLevel {
        if signals.manually_edited || signals.distinct_provider_count >= 2 {
            return LockLevel::FullLock;
        }
        if signals.distinct_provider_count == 1 {
            return LockLevel::Unlocked;
        }
        // No provider enrichment at all: record came from somewhere odd
        // (legacy import); freeze everything but billing status.
        LockLevel::PartialLock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_blank_is_always_permitted() {
        for level in [LockLevel::FullLock, LockLevel::PartialLock, LockLevel::Unlocked] {
            for field in [FieldClass::BillingStatus, FieldClass::Enrichment] {
                assert!(ImportLockPolicy::permits(
                    level,
                    field,
                    false,
                    WriteKind::FillBlank
                ));
            }
        }
    }

    #[test]
    fn full_lock_denies_every_overwrite() {
        for field in [FieldClass::BillingStatus, FieldClass::Enrichment] {
            for sot in [true, false] {
                assert!(!ImportLockPolicy::permits(
                    LockLevel::FullLock,
                    field,
                    sot,
                    WriteKind::Overwrite
                ));
            }
        }
    }

    #[test]
    fn partial_lock_permits_only_billing_by_source_of_truth() {
        assert!(ImportLockPolicy::permits(
            LockLevel::PartialLock,
            FieldClass::BillingStatus,
            true,
            WriteKind::Overwrite
        ));
        assert!(!ImportLockPolicy::permits(
            LockLevel::PartialLock,
            FieldClass::BillingStatus,
            false,
            WriteKind::Overwrite
        ));
        assert!(!ImportLockPolicy::permits(
            LockLevel::PartialLock,
            FieldClass::Enrichment,
            true,
            WriteKind::Overwrite
        ));
    }

    #[test]
    fn unlocked_permits_source_of_truth_only() {
        assert!(ImportLockPolicy::permits(
            LockLevel::Unlocked,
            FieldClass::Enrichment,
            true,
            WriteKind::Overwrite
        ));
        assert!(!ImportLockPolicy::permits(
            LockLevel::Unlocked,
            FieldClass::Enrichment,
            false,
            WriteKind::Overwrite
        ));
    }

    #[test]
    fn classify_is_idempotent_and_ignores_bookkeeping_churn() {
        let signals = LockSignals {
            distinct_provider_count: 1,
            manually_edited: false,
        };
        // Single-provider record stays unlocked no matter how often the
        // rule runs; updated_at churn never enters the signals.
        assert_eq!(ImportLockPolicy::classify(&signals), LockLevel::Unlocked);
        assert_eq!(ImportLockPolicy::classify(&signals), LockLevel::Unlocked);
    }

    #[test]
    fn classify_locks_multi_source_and_curated_records() {
        assert_eq!(
            ImportLockPolicy::classify(&LockSignals {
                distinct_provider_count: 2,
                manually_edited: false,
            }),
            LockLevel::FullLock
        );
        assert_eq!(
            ImportLockPolicy::classify(&LockSignals {
                distinct_provider_count: 1,
                manually_edited: true,
            }),
            LockLevel::FullLock
        );
    }
}
