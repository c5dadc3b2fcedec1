//! Monetary transaction record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// One monetary event.
///
/// (source_system, external_transaction_id) is the first-seen idempotency
/// key from one provider; cross-provider duplicates of the same purchase
/// carry different pairs and are detected by the reconciler instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub source_system: String,
    pub external_transaction_id: String,
    /// Amount in integer cents. Stored as an integer so the duplicate
    /// heuristic's equality check never trips over float representation.
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub txn_type: String,
    pub txn_date: DateTime<Utc>,
    pub payment_method: Option<String>,
    /// Processor-side reference (e.g. the other provider's id when a
    /// cross-provider merge attached it)
    pub processor_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parse a decimal amount string ("50.00", "50", "50.5") into cents.
///
/// Providers send amounts as JSON strings; parsing into cents here keeps
/// the rest of the system away from floating point money.
pub fn parse_amount_cents(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    let negative = raw.starts_with('-');
    let unsigned = raw.trim_start_matches('-');

    let (whole, frac) = match unsigned.split_once('.') {
        Some((w, f)) => (w, f),
        None => (unsigned, ""),
    };

    if whole.is_empty() && frac.is_empty() {
        return Err(Error::InvalidInput(format!("invalid amount: {:?}", raw)));
    }
    if frac.len() > 2 {
        return Err(Error::InvalidInput(format!(
            "amount has more than two decimal places: {:?}",
            raw
        )));
    }

    let whole_cents: i64 = if whole.is_empty() {
        0
    } else {
        whole
            .parse::<i64>()
            .map_err(|_| Error::InvalidInput(format!("invalid amount: {:?}", raw)))?
            * 100
    };

    let frac_cents: i64 = if frac.is_empty() {
        0
    } else {
        // "5" means 50 cents, "05" means 5 cents
        let padded = format!("{:0<2}", frac);
        padded
            .parse()
            .map_err(|_| Error::InvalidInput(format!("invalid amount: {:?}", raw)))?
    };

    let cents = whole_cents + frac_cents;
    Ok(if negative { -cents } else { cents })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_amounts() {
        assert_eq!(parse_amount_cents("50.00").unwrap(), 5000);
        assert_eq!(parse_amount_cents("50").unwrap(), 5000);
        assert_eq!(parse_amount_cents("50.5").unwrap(), 5050);
        assert_eq!(parse_amount_cents("0.99").unwrap(), 99);
        assert_eq!(parse_amount_cents(".99").unwrap(), 99);
        assert_eq!(parse_amount_cents("-12.34").unwrap(), -1234);
    }

    #[test]
    fn rejects_garbage_amounts() {
        assert!(parse_amount_cents("").is_err());
        assert!(parse_amount_cents("abc").is_err());
        assert!(parse_amount_cents("1.234").is_err());
        assert!(parse_amount_cents(".").is_err());
    }
}
