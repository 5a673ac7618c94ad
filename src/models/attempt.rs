use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{ExecutionIntent, Fingerprint, IntentTarget, Side, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    Succeeded,
    Failed,
    Abandoned,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Pending => "pending",
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptOutcome::Pending)
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptOutcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AttemptOutcome::Pending),
            "succeeded" => Ok(AttemptOutcome::Succeeded),
            "failed" => Ok(AttemptOutcome::Failed),
            "abandoned" => Ok(AttemptOutcome::Abandoned),
            other => Err(anyhow::anyhow!("unknown attempt outcome: {other}")),
        }
    }
}

/// Durable record of one intent's execution. One row per fingerprint;
/// `attempt_number` counts venue submissions made for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub fingerprint: Fingerprint,
    pub trigger_event_id: String,
    pub target: IntentTarget,
    pub owner_user_id: UserId,
    pub chain_id: String,
    pub instrument: String,
    pub side: Side,
    pub amount: Decimal,
    pub max_slippage_bps: u32,
    pub deadline: DateTime<Utc>,
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub external_tx_ref: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionAttempt {
    /// Fresh Pending record for an intent that has not been submitted yet.
    pub fn pending(intent: &ExecutionIntent) -> Self {
        let now = Utc::now();
        Self {
            fingerprint: intent.fingerprint.clone(),
            trigger_event_id: intent.trigger_event_id.to_string(),
            target: intent.target,
            owner_user_id: intent.owner_user_id,
            chain_id: intent.trade.chain_id.clone(),
            instrument: intent.trade.instrument.clone(),
            side: intent.trade.side,
            amount: intent.computed_amount,
            max_slippage_bps: intent.trade.max_slippage_bps,
            deadline: intent.deadline,
            attempt_number: 0,
            outcome: AttemptOutcome::Pending,
            external_tx_ref: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}
