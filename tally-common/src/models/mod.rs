//! Data models shared across the Tally services

pub mod contact;
pub mod subscription;
pub mod transaction;
pub mod webhook_event;

pub use contact::Contact;
pub use subscription::{Subscription, SubscriptionStatus};
pub use transaction::{parse_amount_cents, Transaction};
pub use webhook_event::{WebhookEvent, WebhookStatus};

/// Originating system for a record, used as half of the provenance key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceSystem {
    Kajabi,
    Paypal,
}

impl SourceSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceSystem::Kajabi => "kajabi",
            SourceSystem::Paypal => "paypal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "kajabi" => Some(SourceSystem::Kajabi),
            "paypal" => Some(SourceSystem::Paypal),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
