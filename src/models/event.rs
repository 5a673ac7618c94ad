use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{short_addr, EntityKey, Side};

/// Globally unique id of a trade event: `(source, sequence)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId {
    pub source_id: String,
    pub sequence: u64,
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_id, self.sequence)
    }
}

/// A swap executed by a watched wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapDetails {
    pub chain_id: String,
    pub wallet: String,
    pub tx_hash: String,
    /// The non-quote token that was bought or sold.
    pub token: String,
    pub side: Side,
    pub token_amount: Decimal,
    /// Amount of quote currency (e.g. SOL) spent or received.
    pub quote_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub chain_id: String,
    pub instrument: String,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Swap(SwapDetails),
    PriceTick(PriceTick),
}

// ---------------------------------------------------------------------------
// TradeEvent: core pipeline message
// ---------------------------------------------------------------------------

/// Immutable normalized event. `sequence` is strictly increasing per source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub source_id: String,
    pub sequence: u64,
    pub observed_at: DateTime<Utc>,
    pub payload: EventPayload,
}

impl TradeEvent {
    pub fn id(&self) -> EventId {
        EventId {
            source_id: self.source_id.clone(),
            sequence: self.sequence,
        }
    }

    pub fn entity_key(&self) -> EntityKey {
        match &self.payload {
            EventPayload::Swap(s) => EntityKey::wallet(&s.chain_id, &s.wallet),
            EventPayload::PriceTick(t) => EntityKey::instrument(&t.chain_id, &t.instrument),
        }
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.observed_at
    }
}

impl fmt::Display for TradeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            EventPayload::Swap(s) => write!(
                f,
                "Swap[{}:{}]: wallet={} side={} token={} quote={}",
                self.source_id,
                self.sequence,
                short_addr(&s.wallet),
                s.side,
                short_addr(&s.token),
                s.quote_amount,
            ),
            EventPayload::PriceTick(t) => write!(
                f,
                "Tick[{}:{}]: instrument={} price={}",
                self.source_id,
                self.sequence,
                short_addr(&t.instrument),
                t.price,
            ),
        }
    }
}
