use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::models::{CopyTradeConfig, CopyWatcher, SizingRule, UserId, WalletSubscription};

/// Database row for wallet_subscriptions table.
#[derive(Debug, Clone, FromRow)]
pub struct SubscriptionRow {
    pub id: Uuid,
    pub owner_user_id: i64,
    pub watched_address: String,
    pub chain_id: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

impl From<SubscriptionRow> for WalletSubscription {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            id: row.id,
            owner_user_id: row.owner_user_id,
            watched_address: row.watched_address,
            chain_id: row.chain_id,
            created_at: row.created_at,
            active: row.active,
        }
    }
}

/// Database row for copy_trade_configs table.
#[derive(Debug, Clone, FromRow)]
pub struct CopyConfigRow {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub name: Option<String>,
    pub sizing_kind: String,
    pub sizing_value: Decimal,
    pub max_slippage_bps: i32,
    pub per_trade_capital_limit: Decimal,
    pub cooldown_seconds: i32,
    pub min_amount: Option<Decimal>,
    pub total_amount: Option<Decimal>,
    pub max_copies_per_token: Option<i32>,
    pub copy_sells: bool,
    pub excluded_tokens: Vec<String>,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<CopyConfigRow> for CopyTradeConfig {
    type Error = anyhow::Error;

    fn try_from(row: CopyConfigRow) -> Result<Self, Self::Error> {
        let sizing_rule = SizingRule::from_parts(&row.sizing_kind, row.sizing_value)
            .ok_or_else(|| anyhow::anyhow!("unknown sizing kind: {}", row.sizing_kind))?;

        Ok(Self {
            id: row.id,
            subscription_id: row.subscription_id,
            name: row.name,
            sizing_rule,
            max_slippage_bps: u32::try_from(row.max_slippage_bps)?,
            per_trade_capital_limit: row.per_trade_capital_limit,
            cooldown_seconds: u32::try_from(row.cooldown_seconds)?,
            min_amount: row.min_amount,
            total_amount: row.total_amount,
            max_copies_per_token: row.max_copies_per_token.map(u32::try_from).transpose()?,
            copy_sells: row.copy_sells,
            excluded_tokens: row.excluded_tokens,
            active: row.active,
            updated_at: row.updated_at,
        })
    }
}

/// Insert a new wallet subscription.
pub async fn insert_subscription(pool: &PgPool, sub: &WalletSubscription) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO wallet_subscriptions (id, owner_user_id, watched_address, chain_id, created_at, active)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(sub.id)
    .bind(sub.owner_user_id)
    .bind(&sub.watched_address)
    .bind(&sub.chain_id)
    .bind(sub.created_at)
    .bind(sub.active)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_subscription(pool: &PgPool, id: Uuid) -> anyhow::Result<Option<WalletSubscription>> {
    let row = sqlx::query_as::<_, SubscriptionRow>("SELECT * FROM wallet_subscriptions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(Into::into))
}

/// All subscriptions of an owner, newest first.
pub async fn list_subscriptions(pool: &PgPool, owner: UserId) -> anyhow::Result<Vec<WalletSubscription>> {
    let rows = sqlx::query_as::<_, SubscriptionRow>(
        "SELECT * FROM wallet_subscriptions WHERE owner_user_id = $1 ORDER BY created_at DESC",
    )
    .bind(owner)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

/// Deactivate a subscription and its config in one transaction.
pub async fn deactivate_subscription(pool: &PgPool, id: Uuid) -> anyhow::Result<bool> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        "UPDATE wallet_subscriptions SET active = false WHERE id = $1 AND active = true",
    )
    .bind(id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE copy_trade_configs SET active = false, updated_at = NOW() WHERE subscription_id = $1",
    )
    .bind(id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(result.rows_affected() == 1)
}

/// Insert or replace the config for a subscription, keeping an existing id.
pub async fn upsert_copy_config(pool: &PgPool, config: &CopyTradeConfig) -> anyhow::Result<CopyTradeConfig> {
    let row = sqlx::query_as::<_, CopyConfigRow>(
        r#"
        INSERT INTO copy_trade_configs (
            id, subscription_id, name, sizing_kind, sizing_value, max_slippage_bps,
            per_trade_capital_limit, cooldown_seconds, min_amount, copy_sells,
            excluded_tokens, active, total_amount, max_copies_per_token, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW())
        ON CONFLICT (subscription_id) DO UPDATE SET
            name = EXCLUDED.name,
            sizing_kind = EXCLUDED.sizing_kind,
            sizing_value = EXCLUDED.sizing_value,
            max_slippage_bps = EXCLUDED.max_slippage_bps,
            per_trade_capital_limit = EXCLUDED.per_trade_capital_limit,
            cooldown_seconds = EXCLUDED.cooldown_seconds,
            min_amount = EXCLUDED.min_amount,
            copy_sells = EXCLUDED.copy_sells,
            excluded_tokens = EXCLUDED.excluded_tokens,
            active = EXCLUDED.active,
            total_amount = EXCLUDED.total_amount,
            max_copies_per_token = EXCLUDED.max_copies_per_token,
            updated_at = NOW()
        RETURNING *
        "#,
    )
    .bind(config.id)
    .bind(config.subscription_id)
    .bind(&config.name)
    .bind(config.sizing_rule.kind())
    .bind(config.sizing_rule.value())
    .bind(i32::try_from(config.max_slippage_bps)?)
    .bind(config.per_trade_capital_limit)
    .bind(i32::try_from(config.cooldown_seconds)?)
    .bind(config.min_amount)
    .bind(config.copy_sells)
    .bind(&config.excluded_tokens)
    .bind(config.active)
    .bind(config.total_amount)
    .bind(config.max_copies_per_token.map(i32::try_from).transpose()?)
    .fetch_one(pool)
    .await?;

    row.try_into()
}

pub async fn get_copy_config(pool: &PgPool, id: Uuid) -> anyhow::Result<Option<CopyTradeConfig>> {
    let row = sqlx::query_as::<_, CopyConfigRow>("SELECT * FROM copy_trade_configs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.map(TryInto::try_into).transpose()
}

pub async fn get_copy_config_for_subscription(
    pool: &PgPool,
    subscription_id: Uuid,
) -> anyhow::Result<Option<CopyTradeConfig>> {
    let row = sqlx::query_as::<_, CopyConfigRow>(
        "SELECT * FROM copy_trade_configs WHERE subscription_id = $1",
    )
    .bind(subscription_id)
    .fetch_optional(pool)
    .await?;

    row.map(TryInto::try_into).transpose()
}

/// Active subscriptions joined with their active configs. Used to warm the
/// registry at startup.
pub async fn load_active_copy_watchers(pool: &PgPool) -> anyhow::Result<Vec<CopyWatcher>> {
    let subs = sqlx::query_as::<_, SubscriptionRow>(
        r#"
        SELECT s.* FROM wallet_subscriptions s
        JOIN copy_trade_configs c ON c.subscription_id = s.id
        WHERE s.active = true AND c.active = true
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut watchers = Vec::with_capacity(subs.len());
    for sub in subs {
        let sub: WalletSubscription = sub.into();
        if let Some(config) = get_copy_config_for_subscription(pool, sub.id).await? {
            watchers.push(CopyWatcher {
                subscription: sub,
                config,
            });
        }
    }

    Ok(watchers)
}

pub async fn copy_config_is_live(pool: &PgPool, config_id: Uuid) -> anyhow::Result<bool> {
    let row: Option<(bool,)> = sqlx::query_as(
        r#"
        SELECT (c.active AND s.active) FROM copy_trade_configs c
        JOIN wallet_subscriptions s ON s.id = c.subscription_id
        WHERE c.id = $1
        "#,
    )
    .bind(config_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.0).unwrap_or(false))
}
