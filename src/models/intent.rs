use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use super::{EventId, Side, UserId};

/// Idempotency key: `sha256(trigger_event_id | target_id)`, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn derive(trigger: &EventId, target: &IntentTarget) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(trigger.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(target.id().as_bytes());
        Fingerprint(hex::encode(hasher.finalize()))
    }

    /// Wrap a fingerprint loaded from storage or an API path.
    pub fn from_hex(s: &str) -> Option<Self> {
        let ok = s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit());
        ok.then(|| Fingerprint(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What matched the event: a copy config or a limit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum IntentTarget {
    CopyConfig(Uuid),
    LimitOrder(Uuid),
}

impl IntentTarget {
    pub fn id(&self) -> Uuid {
        match self {
            IntentTarget::CopyConfig(id) | IntentTarget::LimitOrder(id) => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IntentTarget::CopyConfig(_) => "copy_config",
            IntentTarget::LimitOrder(_) => "limit_order",
        }
    }

    pub fn from_parts(kind: &str, id: Uuid) -> Option<Self> {
        match kind {
            "copy_config" => Some(IntentTarget::CopyConfig(id)),
            "limit_order" => Some(IntentTarget::LimitOrder(id)),
            _ => None,
        }
    }
}

impl fmt::Display for IntentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// The trade the venue is asked to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSpec {
    pub chain_id: String,
    pub instrument: String,
    pub side: Side,
    pub max_slippage_bps: u32,
}

/// Ephemeral output of the trigger evaluator. Only its outcome is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionIntent {
    pub trigger_event_id: EventId,
    pub target: IntentTarget,
    pub owner_user_id: UserId,
    pub trade: TradeSpec,
    pub computed_amount: Decimal,
    pub deadline: DateTime<Utc>,
    pub fingerprint: Fingerprint,
}

impl ExecutionIntent {
    pub fn new(
        trigger_event_id: EventId,
        target: IntentTarget,
        owner_user_id: UserId,
        trade: TradeSpec,
        computed_amount: Decimal,
        deadline: DateTime<Utc>,
    ) -> Self {
        let fingerprint = Fingerprint::derive(&trigger_event_id, &target);
        Self {
            trigger_event_id,
            target,
            owner_user_id,
            trade,
            computed_amount,
            deadline,
            fingerprint,
        }
    }
}
