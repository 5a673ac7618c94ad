use async_trait::async_trait;
use futures_util::stream::BoxStream;
use rand::Rng;
use std::time::Duration;

use crate::models::TradeEvent;

pub const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("source disconnected: {0}")]
    Disconnected(String),

    #[error("malformed event: {0}")]
    Malformed(String),

    /// The source cannot replay from `requested`; the oldest it still has is `earliest`.
    #[error("history unavailable from seq {requested}, earliest is {earliest}")]
    HistoryUnavailable { requested: u64, earliest: u64 },
}

pub type EventStream = BoxStream<'static, Result<TradeEvent, FeedError>>;

/// An upstream source of wallet activity or price ticks with a resumable
/// sequence cursor.
///
/// `connect(Some(n))` asks the source to replay starting at sequence `n`.
/// Events come back in strictly increasing sequence order. A stream ending
/// (or yielding `Disconnected`) means the connection is gone.
#[async_trait]
pub trait FeedSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn connect(&self, from_seq: Option<u64>) -> Result<EventStream, FeedError>;
}

/// Exponential backoff with full jitter: a uniform delay in `[0, min(cap, base * 2^attempt)]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Upper bound of the next delay, before jitter.
    pub fn ceiling(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        let millis = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::rng().random_range(0..=millis))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BASE_RECONNECT_DELAY, MAX_RECONNECT_DELAY)
    }
}
