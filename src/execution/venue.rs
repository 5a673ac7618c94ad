use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::models::{ExecutionIntent, Fingerprint, Side};

/// What the venue is asked to do. `client_ref` is the intent fingerprint,
/// which the venue uses to deduplicate resubmissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRequest {
    pub client_ref: Fingerprint,
    pub chain_id: String,
    pub instrument: String,
    pub side: Side,
    pub amount: Decimal,
    pub max_slippage_bps: u32,
}

impl From<&ExecutionIntent> for TradeRequest {
    fn from(intent: &ExecutionIntent) -> Self {
        Self {
            client_ref: intent.fingerprint.clone(),
            chain_id: intent.trade.chain_id.clone(),
            instrument: intent.trade.instrument.clone(),
            side: intent.trade.side,
            amount: intent.computed_amount,
            max_slippage_bps: intent.trade.max_slippage_bps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SubmissionStatus {
    Confirmed,
    Pending,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub tx_ref: String,
    pub status: SubmissionStatus,
}

/// Business-rule refusals. Never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    InsufficientBalance,
    SlippageExceeded,
    AlreadyFilled,
    OrderClosed,
    Other(String),
}

impl RejectReason {
    pub fn from_code(code: &str) -> Self {
        match code {
            "insufficient_balance" | "insufficient_funds" => RejectReason::InsufficientBalance,
            "slippage_exceeded" | "slippage" => RejectReason::SlippageExceeded,
            "already_filled" => RejectReason::AlreadyFilled,
            "order_closed" => RejectReason::OrderClosed,
            other => RejectReason::Other(other.to_string()),
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::InsufficientBalance => f.write_str("insufficient balance"),
            RejectReason::SlippageExceeded => f.write_str("slippage exceeded"),
            RejectReason::AlreadyFilled => f.write_str("already filled"),
            RejectReason::OrderClosed => f.write_str("order closed"),
            RejectReason::Other(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VenueError {
    /// Timeouts, 5xx, rate limiting, node unavailable.
    #[error("transient venue failure: {0}")]
    Transient(String),

    #[error("rejected by venue: {0}")]
    Rejected(RejectReason),
}

impl VenueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VenueError::Transient(_))
    }
}

/// External trade-execution collaborator (DEX/swap API).
#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    async fn submit(&self, request: &TradeRequest) -> Result<Submission, VenueError>;

    async fn query(&self, tx_ref: &str) -> Result<SubmissionStatus, VenueError>;

    /// Look up a previous submission by the caller's idempotency key.
    async fn find_by_client_ref(&self, client_ref: &Fingerprint) -> Result<Option<Submission>, VenueError>;
}

/// Venue that confirms everything without touching a chain. Used when
/// `DRY_RUN` is on.
#[derive(Default)]
pub struct DryRunVenue {
    submissions: Mutex<HashMap<Fingerprint, Submission>>,
}

impl DryRunVenue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionVenue for DryRunVenue {
    async fn submit(&self, request: &TradeRequest) -> Result<Submission, VenueError> {
        let mut submissions = self.submissions.lock();
        let submission = submissions
            .entry(request.client_ref.clone())
            .or_insert_with(|| Submission {
                tx_ref: format!("dry-run-{}", Uuid::new_v4()),
                status: SubmissionStatus::Confirmed,
            })
            .clone();

        tracing::info!(
            client_ref = %request.client_ref,
            instrument = %request.instrument,
            side = %request.side,
            amount = %request.amount,
            tx_ref = %submission.tx_ref,
            "[DRY RUN] Would submit swap"
        );

        Ok(submission)
    }

    async fn query(&self, tx_ref: &str) -> Result<SubmissionStatus, VenueError> {
        let submissions = self.submissions.lock();
        Ok(submissions
            .values()
            .find(|s| s.tx_ref == tx_ref)
            .map(|s| s.status.clone())
            .unwrap_or(SubmissionStatus::Failed("unknown tx_ref".into())))
    }

    async fn find_by_client_ref(&self, client_ref: &Fingerprint) -> Result<Option<Submission>, VenueError> {
        Ok(self.submissions.lock().get(client_ref).cloned())
    }
}
