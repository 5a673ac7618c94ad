use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{EntityKey, UserId};

/// A user's request to watch a wallet. Never mutated except for `active`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletSubscription {
    pub id: Uuid,
    pub owner_user_id: UserId,
    pub watched_address: String,
    pub chain_id: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

impl WalletSubscription {
    pub fn new(owner_user_id: UserId, watched_address: &str, chain_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_user_id,
            watched_address: watched_address.trim().to_string(),
            chain_id: chain_id.trim().to_string(),
            created_at: Utc::now(),
            active: true,
        }
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey::wallet(&self.chain_id, &self.watched_address)
    }
}

/// How the copied amount is derived from the leader's swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SizingRule {
    /// Always trade this quote amount.
    Fixed { amount: Decimal },
    /// Trade `percent`% of the leader's quote amount.
    Proportional { percent: Decimal },
}

impl SizingRule {
    pub fn kind(&self) -> &'static str {
        match self {
            SizingRule::Fixed { .. } => "fixed",
            SizingRule::Proportional { .. } => "proportional",
        }
    }

    pub fn value(&self) -> Decimal {
        match self {
            SizingRule::Fixed { amount } => *amount,
            SizingRule::Proportional { percent } => *percent,
        }
    }

    pub fn from_parts(kind: &str, value: Decimal) -> Option<Self> {
        match kind {
            "fixed" => Some(SizingRule::Fixed { amount: value }),
            "proportional" => Some(SizingRule::Proportional { percent: value }),
            _ => None,
        }
    }
}

/// Per-subscription copy settings. Mutated only by the owning user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyTradeConfig {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub name: Option<String>,
    pub sizing_rule: SizingRule,
    pub max_slippage_bps: u32,
    pub per_trade_capital_limit: Decimal,
    pub cooldown_seconds: u32,
    pub min_amount: Option<Decimal>,
    /// Budget across all successful copies of this config.
    #[serde(default)]
    pub total_amount: Option<Decimal>,
    /// Successful copies allowed per token.
    #[serde(default)]
    pub max_copies_per_token: Option<u32>,
    pub copy_sells: bool,
    pub excluded_tokens: Vec<String>,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("max_slippage_bps must be within 0..=10000, got {0}")]
    SlippageOutOfRange(u32),

    #[error("per_trade_capital_limit must be positive")]
    NonPositiveCapitalLimit,

    #[error("fixed amount must be positive")]
    NonPositiveFixedAmount,

    #[error("proportional percent must be within (0, 1000], got {0}")]
    PercentOutOfRange(Decimal),

    #[error("min_amount must not be negative")]
    NegativeMinAmount,

    #[error("total_amount must be positive")]
    NonPositiveTotalAmount,

    #[error("max_copies_per_token must be at least 1")]
    ZeroMaxCopies,
}

/// What a config has already copied successfully.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyUsage {
    /// Sum of the amounts of succeeded copies.
    pub spent: Decimal,
    /// Succeeded copies of the token at hand.
    pub copies_of_token: u64,
}

impl CopyTradeConfig {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.max_slippage_bps > 10_000 {
            return Err(ConfigValidationError::SlippageOutOfRange(self.max_slippage_bps));
        }
        if self.per_trade_capital_limit <= Decimal::ZERO {
            return Err(ConfigValidationError::NonPositiveCapitalLimit);
        }
        match self.sizing_rule {
            SizingRule::Fixed { amount } if amount <= Decimal::ZERO => {
                return Err(ConfigValidationError::NonPositiveFixedAmount);
            }
            SizingRule::Proportional { percent }
                if percent <= Decimal::ZERO || percent > Decimal::from(1_000) =>
            {
                return Err(ConfigValidationError::PercentOutOfRange(percent));
            }
            _ => {}
        }
        if matches!(self.min_amount, Some(m) if m < Decimal::ZERO) {
            return Err(ConfigValidationError::NegativeMinAmount);
        }
        if matches!(self.total_amount, Some(t) if t <= Decimal::ZERO) {
            return Err(ConfigValidationError::NonPositiveTotalAmount);
        }
        if self.max_copies_per_token == Some(0) {
            return Err(ConfigValidationError::ZeroMaxCopies);
        }
        Ok(())
    }

    /// Reason another copy of `amount` is not allowed, if any.
    pub fn limit_refusal(&self, usage: &CopyUsage, amount: Decimal) -> Option<&'static str> {
        if let Some(total) = self.total_amount {
            let over = usage.spent.checked_add(amount).map_or(true, |after| after > total);
            if over {
                return Some("total amount limit reached");
            }
        }
        if let Some(max) = self.max_copies_per_token {
            if usage.copies_of_token >= u64::from(max) {
                return Some("max copies per token reached");
            }
        }
        None
    }

    /// Whether the config carries limits that depend on past copies.
    pub fn has_usage_limits(&self) -> bool {
        self.total_amount.is_some() || self.max_copies_per_token.is_some()
    }

    pub fn excludes(&self, token: &str) -> bool {
        self.excluded_tokens.iter().any(|t| t == token)
    }
}

/// A subscription paired with its copy config, as held by the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyWatcher {
    pub subscription: WalletSubscription,
    pub config: CopyTradeConfig,
}

impl CopyWatcher {
    pub fn is_live(&self) -> bool {
        self.subscription.active && self.config.active
    }
}
