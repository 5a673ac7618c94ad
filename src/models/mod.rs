pub mod attempt;
pub mod event;
pub mod intent;
pub mod limit_order;
pub mod subscription;

pub use attempt::{AttemptOutcome, ExecutionAttempt};
pub use event::{EventId, EventPayload, PriceTick, SwapDetails, TradeEvent};
pub use intent::{ExecutionIntent, Fingerprint, IntentTarget, TradeSpec};
pub use limit_order::{LimitOrder, OrderStatus};
pub use subscription::{CopyTradeConfig, CopyUsage, CopyWatcher, SizingRule, WalletSubscription};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Telegram-style numeric user id of the subscription / order owner.
pub type UserId = i64;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_api_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "buy" | "0" => Some(Side::Buy),
            "sell" | "1" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// EntityKey: what a subscriber watches
// ---------------------------------------------------------------------------

/// Key used to index the registry and to shard events across evaluator workers.
///
/// Addresses are kept verbatim (base58 addresses are case-sensitive); only
/// surrounding whitespace is trimmed when keys are built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityKey {
    Wallet { chain_id: String, address: String },
    Instrument { chain_id: String, instrument: String },
}

impl EntityKey {
    pub fn wallet(chain_id: &str, address: &str) -> Self {
        EntityKey::Wallet {
            chain_id: chain_id.trim().to_string(),
            address: address.trim().to_string(),
        }
    }

    pub fn instrument(chain_id: &str, instrument: &str) -> Self {
        EntityKey::Instrument {
            chain_id: chain_id.trim().to_string(),
            instrument: instrument.trim().to_string(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Wallet { chain_id, address } => write!(f, "wallet:{chain_id}:{address}"),
            EntityKey::Instrument {
                chain_id,
                instrument,
            } => write!(f, "instrument:{chain_id}:{instrument}"),
        }
    }
}

/// Shorten an address for log lines and notifications.
pub fn short_addr(addr: &str) -> String {
    let count = addr.chars().count();
    if count > 10 {
        let head: String = addr.chars().take(6).collect();
        let tail: String = addr.chars().skip(count - 4).collect();
        format!("{head}...{tail}")
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_parses_api_strings() {
        assert_eq!(Side::from_api_str("BUY"), Some(Side::Buy));
        assert_eq!(Side::from_api_str("sell"), Some(Side::Sell));
        assert_eq!(Side::from_api_str("1"), Some(Side::Sell));
        assert_eq!(Side::from_api_str("hold"), None);
    }

    #[test]
    fn wallet_keys_keep_case_but_trim() {
        let a = EntityKey::wallet("solana", " 2heHTw2ywe7kzA21F1XBF4unFEWrkMRogcHpT3uEyp56 ");
        let b = EntityKey::wallet("solana", "2heHTw2ywe7kzA21F1XBF4unFEWrkMRogcHpT3uEyp56");
        assert_eq!(a, b);
        assert_ne!(a, EntityKey::wallet("solana", "2HEHTW2YWE7KZA21F1XBF4UNFEWRKMROGCHPT3UEYP56"));
    }

    #[test]
    fn short_addr_truncates_long_addresses() {
        assert_eq!(short_addr("0x1234567890abcdef"), "0x1234...cdef");
        assert_eq!(short_addr("abc"), "abc");
    }

    #[test]
    fn short_addr_counts_characters_not_bytes() {
        assert_eq!(short_addr("ключ-пользователя"), "ключ-п...теля");
        assert_eq!(short_addr("ébène-noir"), "ébène-noir");
    }
}
