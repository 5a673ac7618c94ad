pub mod attempt_repo;
pub mod feed_repo;
pub mod limit_order_repo;
pub mod memory;
pub mod subscription_repo;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{
    AttemptOutcome, CopyTradeConfig, CopyUsage, CopyWatcher, ExecutionAttempt, Fingerprint,
    LimitOrder, OrderStatus, UserId, WalletSubscription,
};

pub use memory::MemoryStore;

pub async fn init_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    // Verify connectivity
    sqlx::query("SELECT 1").execute(&pool).await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Result of inserting a Pending attempt keyed by fingerprint.
#[derive(Debug, Clone)]
pub enum BeginAttempt {
    /// No record existed; this caller owns the execution.
    Started(ExecutionAttempt),
    /// A record already exists (duplicate intent or restart replay).
    Existing(ExecutionAttempt),
}

/// Result of moving an attempt out of Pending.
#[derive(Debug, Clone)]
pub enum Completion {
    Recorded(ExecutionAttempt),
    /// Someone else already settled it; nothing was written.
    AlreadyTerminal(ExecutionAttempt),
}

/// A sequence range a feed source could not replay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedGap {
    pub id: Uuid,
    pub source_id: String,
    pub expected_seq: u64,
    pub resumed_seq: u64,
    pub detected_at: DateTime<Utc>,
}

/// Durable source of truth for subscriptions, orders, execution history and
/// feed cursors.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn ping(&self) -> anyhow::Result<()>;

    // --- subscriptions -----------------------------------------------------
    async fn insert_subscription(&self, sub: &WalletSubscription) -> anyhow::Result<()>;
    async fn get_subscription(&self, id: Uuid) -> anyhow::Result<Option<WalletSubscription>>;
    async fn list_subscriptions(&self, owner: UserId) -> anyhow::Result<Vec<WalletSubscription>>;
    /// Returns false when the subscription was missing or already inactive.
    async fn deactivate_subscription(&self, id: Uuid) -> anyhow::Result<bool>;
    /// Insert or replace the config of `config.subscription_id`. The id of an
    /// existing config is preserved.
    async fn upsert_copy_config(&self, config: &CopyTradeConfig) -> anyhow::Result<CopyTradeConfig>;
    async fn get_copy_config(&self, id: Uuid) -> anyhow::Result<Option<CopyTradeConfig>>;
    async fn get_copy_config_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> anyhow::Result<Option<CopyTradeConfig>>;
    async fn load_active_copy_watchers(&self) -> anyhow::Result<Vec<CopyWatcher>>;
    /// Config active and its subscription active.
    async fn copy_config_is_live(&self, config_id: Uuid) -> anyhow::Result<bool>;

    // --- limit orders ------------------------------------------------------
    async fn insert_limit_order(&self, order: &LimitOrder) -> anyhow::Result<()>;
    async fn get_limit_order(&self, id: Uuid) -> anyhow::Result<Option<LimitOrder>>;
    async fn load_open_limit_orders(&self) -> anyhow::Result<Vec<LimitOrder>>;
    /// Compare-and-set on status. Returns true only if the row was in `from`.
    async fn transition_limit_order(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        tx_ref: Option<&str>,
    ) -> anyhow::Result<bool>;
    /// Open orders whose expiry is at or before `now`.
    async fn due_limit_orders(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<LimitOrder>>;

    // --- execution attempts -----------------------------------------------
    async fn begin_attempt(&self, attempt: &ExecutionAttempt) -> anyhow::Result<BeginAttempt>;
    /// Bump the attempt counter of a Pending attempt. False when the attempt
    /// is missing or already terminal, in which case nothing may be submitted.
    async fn record_submission(&self, fingerprint: &Fingerprint, attempt_number: u32) -> anyhow::Result<bool>;
    async fn record_tx_ref(&self, fingerprint: &Fingerprint, tx_ref: &str) -> anyhow::Result<()>;
    async fn complete_attempt(
        &self,
        fingerprint: &Fingerprint,
        outcome: AttemptOutcome,
        tx_ref: Option<&str>,
        error: Option<&str>,
    ) -> anyhow::Result<Completion>;
    async fn get_attempt(&self, fingerprint: &Fingerprint) -> anyhow::Result<Option<ExecutionAttempt>>;
    /// Pending attempts not touched since `older_than`.
    async fn stale_pending_attempts(
        &self,
        older_than: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ExecutionAttempt>>;
    async fn recent_attempts(&self, limit: i64) -> anyhow::Result<Vec<ExecutionAttempt>>;
    /// Spend and per-token copy count over a config's succeeded attempts.
    async fn copy_usage(&self, config_id: Uuid, instrument: &str) -> anyhow::Result<CopyUsage>;

    // --- feeds -------------------------------------------------------------
    /// Next sequence number to read for a source, if one was checkpointed.
    async fn load_cursor(&self, source_id: &str) -> anyhow::Result<Option<u64>>;
    async fn save_cursor(&self, source_id: &str, next_seq: u64) -> anyhow::Result<()>;
    async fn record_gap(&self, gap: &FeedGap) -> anyhow::Result<()>;
    async fn recent_gaps(&self, limit: i64) -> anyhow::Result<Vec<FeedGap>>;
}

/// Postgres-backed store; each method delegates to a repo module.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StateStore for PgStore {
    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_subscription(&self, sub: &WalletSubscription) -> anyhow::Result<()> {
        subscription_repo::insert_subscription(&self.pool, sub).await
    }

    async fn get_subscription(&self, id: Uuid) -> anyhow::Result<Option<WalletSubscription>> {
        subscription_repo::get_subscription(&self.pool, id).await
    }

    async fn list_subscriptions(&self, owner: UserId) -> anyhow::Result<Vec<WalletSubscription>> {
        subscription_repo::list_subscriptions(&self.pool, owner).await
    }

    async fn deactivate_subscription(&self, id: Uuid) -> anyhow::Result<bool> {
        subscription_repo::deactivate_subscription(&self.pool, id).await
    }

    async fn upsert_copy_config(&self, config: &CopyTradeConfig) -> anyhow::Result<CopyTradeConfig> {
        subscription_repo::upsert_copy_config(&self.pool, config).await
    }

    async fn get_copy_config(&self, id: Uuid) -> anyhow::Result<Option<CopyTradeConfig>> {
        subscription_repo::get_copy_config(&self.pool, id).await
    }

    async fn get_copy_config_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> anyhow::Result<Option<CopyTradeConfig>> {
        subscription_repo::get_copy_config_for_subscription(&self.pool, subscription_id).await
    }

    async fn load_active_copy_watchers(&self) -> anyhow::Result<Vec<CopyWatcher>> {
        subscription_repo::load_active_copy_watchers(&self.pool).await
    }

    async fn copy_config_is_live(&self, config_id: Uuid) -> anyhow::Result<bool> {
        subscription_repo::copy_config_is_live(&self.pool, config_id).await
    }

    async fn insert_limit_order(&self, order: &LimitOrder) -> anyhow::Result<()> {
        limit_order_repo::insert_limit_order(&self.pool, order).await
    }

    async fn get_limit_order(&self, id: Uuid) -> anyhow::Result<Option<LimitOrder>> {
        limit_order_repo::get_limit_order(&self.pool, id).await
    }

    async fn load_open_limit_orders(&self) -> anyhow::Result<Vec<LimitOrder>> {
        limit_order_repo::load_open_limit_orders(&self.pool).await
    }

    async fn transition_limit_order(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        tx_ref: Option<&str>,
    ) -> anyhow::Result<bool> {
        limit_order_repo::transition_limit_order(&self.pool, id, from, to, tx_ref).await
    }

    async fn due_limit_orders(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<LimitOrder>> {
        limit_order_repo::due_limit_orders(&self.pool, now).await
    }

    async fn begin_attempt(&self, attempt: &ExecutionAttempt) -> anyhow::Result<BeginAttempt> {
        attempt_repo::begin_attempt(&self.pool, attempt).await
    }

    async fn record_submission(&self, fingerprint: &Fingerprint, attempt_number: u32) -> anyhow::Result<bool> {
        attempt_repo::record_submission(&self.pool, fingerprint, attempt_number).await
    }

    async fn record_tx_ref(&self, fingerprint: &Fingerprint, tx_ref: &str) -> anyhow::Result<()> {
        attempt_repo::record_tx_ref(&self.pool, fingerprint, tx_ref).await
    }

    async fn complete_attempt(
        &self,
        fingerprint: &Fingerprint,
        outcome: AttemptOutcome,
        tx_ref: Option<&str>,
        error: Option<&str>,
    ) -> anyhow::Result<Completion> {
        attempt_repo::complete_attempt(&self.pool, fingerprint, outcome, tx_ref, error).await
    }

    async fn get_attempt(&self, fingerprint: &Fingerprint) -> anyhow::Result<Option<ExecutionAttempt>> {
        attempt_repo::get_attempt(&self.pool, fingerprint).await
    }

    async fn stale_pending_attempts(
        &self,
        older_than: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ExecutionAttempt>> {
        attempt_repo::stale_pending_attempts(&self.pool, older_than).await
    }

    async fn recent_attempts(&self, limit: i64) -> anyhow::Result<Vec<ExecutionAttempt>> {
        attempt_repo::recent_attempts(&self.pool, limit).await
    }

    async fn copy_usage(&self, config_id: Uuid, instrument: &str) -> anyhow::Result<CopyUsage> {
        attempt_repo::copy_usage(&self.pool, config_id, instrument).await
    }

    async fn load_cursor(&self, source_id: &str) -> anyhow::Result<Option<u64>> {
        feed_repo::load_cursor(&self.pool, source_id).await
    }

    async fn save_cursor(&self, source_id: &str, next_seq: u64) -> anyhow::Result<()> {
        feed_repo::save_cursor(&self.pool, source_id, next_seq).await
    }

    async fn record_gap(&self, gap: &FeedGap) -> anyhow::Result<()> {
        feed_repo::record_gap(&self.pool, gap).await
    }

    async fn recent_gaps(&self, limit: i64) -> anyhow::Result<Vec<FeedGap>> {
        feed_repo::recent_gaps(&self.pool, limit).await
    }
}
