use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{EntityKey, Side, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Triggered,
    Filled,
    Cancelled,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Triggered => "triggered",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Expired
        )
    }

    /// Allowed lifecycle moves. Everything else is rejected by the store.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Open, OrderStatus::Triggered)
                | (OrderStatus::Open, OrderStatus::Cancelled)
                | (OrderStatus::Open, OrderStatus::Expired)
                | (OrderStatus::Triggered, OrderStatus::Filled)
                | (OrderStatus::Triggered, OrderStatus::Cancelled)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(OrderStatus::Open),
            "triggered" => Ok(OrderStatus::Triggered),
            "filled" => Ok(OrderStatus::Filled),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "expired" => Ok(OrderStatus::Expired),
            other => Err(anyhow::anyhow!("unknown order status: {other}")),
        }
    }
}

/// Standing instruction to trade `amount` of `instrument` once price crosses `trigger_price`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitOrder {
    pub id: Uuid,
    pub owner_user_id: UserId,
    pub chain_id: String,
    pub instrument: String,
    pub side: Side,
    pub trigger_price: Decimal,
    pub amount: Decimal,
    pub max_slippage_bps: u32,
    pub expiry: DateTime<Utc>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub external_tx_ref: Option<String>,
}

impl LimitOrder {
    pub fn entity_key(&self) -> EntityKey {
        EntityKey::instrument(&self.chain_id, &self.instrument)
    }

    /// Buy triggers at or below the trigger price, sell at or above.
    pub fn crosses(&self, price: Decimal) -> bool {
        match self.side {
            Side::Buy => price <= self.trigger_price,
            Side::Sell => price >= self.trigger_price,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn order(side: Side, trigger: Decimal) -> LimitOrder {
        LimitOrder {
            id: Uuid::new_v4(),
            owner_user_id: 1,
            chain_id: "solana".into(),
            instrument: "BONK".into(),
            side,
            trigger_price: trigger,
            amount: Decimal::ONE,
            max_slippage_bps: 100,
            expiry: Utc::now() + Duration::hours(1),
            status: OrderStatus::Open,
            created_at: Utc::now(),
            closed_at: None,
            external_tx_ref: None,
        }
    }

    #[test]
    fn buy_crosses_at_or_below_trigger() {
        let o = order(Side::Buy, Decimal::from(100));
        assert!(o.crosses(Decimal::from(100)));
        assert!(o.crosses(Decimal::new(999, 1)));
        assert!(!o.crosses(Decimal::new(1001, 1)));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for s in [OrderStatus::Filled, OrderStatus::Cancelled, OrderStatus::Expired] {
            for next in [
                OrderStatus::Open,
                OrderStatus::Triggered,
                OrderStatus::Filled,
                OrderStatus::Cancelled,
                OrderStatus::Expired,
            ] {
                assert!(!s.can_transition_to(next), "{s} -> {next} must be rejected");
            }
        }
        assert!(OrderStatus::Open.can_transition_to(OrderStatus::Triggered));
        assert!(!OrderStatus::Triggered.can_transition_to(OrderStatus::Expired));
    }

    #[test]
    fn status_parses_its_own_strings() {
        for s in [OrderStatus::Open, OrderStatus::Triggered, OrderStatus::Filled] {
            assert_eq!(s.as_str().parse::<OrderStatus>().unwrap(), s);
        }
        assert!("active".parse::<OrderStatus>().is_err());
    }
}
