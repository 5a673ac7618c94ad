use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::models::{LimitOrder, OrderStatus, Side};

/// Database row for limit_orders table.
#[derive(Debug, Clone, FromRow)]
pub struct LimitOrderRow {
    pub id: Uuid,
    pub owner_user_id: i64,
    pub chain_id: String,
    pub instrument: String,
    pub side: String,
    pub trigger_price: Decimal,
    pub amount: Decimal,
    pub max_slippage_bps: i32,
    pub expiry: DateTime<Utc>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub external_tx_ref: Option<String>,
}

impl TryFrom<LimitOrderRow> for LimitOrder {
    type Error = anyhow::Error;

    fn try_from(row: LimitOrderRow) -> Result<Self, Self::Error> {
        let side = Side::from_api_str(&row.side)
            .ok_or_else(|| anyhow::anyhow!("unknown side: {}", row.side))?;

        Ok(Self {
            id: row.id,
            owner_user_id: row.owner_user_id,
            chain_id: row.chain_id,
            instrument: row.instrument,
            side,
            trigger_price: row.trigger_price,
            amount: row.amount,
            max_slippage_bps: u32::try_from(row.max_slippage_bps)?,
            expiry: row.expiry,
            status: row.status.parse()?,
            created_at: row.created_at,
            closed_at: row.closed_at,
            external_tx_ref: row.external_tx_ref,
        })
    }
}

fn convert_all(rows: Vec<LimitOrderRow>) -> anyhow::Result<Vec<LimitOrder>> {
    rows.into_iter().map(TryInto::try_into).collect()
}

/// Insert a new limit order.
pub async fn insert_limit_order(pool: &PgPool, order: &LimitOrder) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO limit_orders (
            id, owner_user_id, chain_id, instrument, side, trigger_price, amount,
            max_slippage_bps, expiry, status, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(order.id)
    .bind(order.owner_user_id)
    .bind(&order.chain_id)
    .bind(&order.instrument)
    .bind(order.side.as_str())
    .bind(order.trigger_price)
    .bind(order.amount)
    .bind(i32::try_from(order.max_slippage_bps)?)
    .bind(order.expiry)
    .bind(order.status.as_str())
    .bind(order.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_limit_order(pool: &PgPool, id: Uuid) -> anyhow::Result<Option<LimitOrder>> {
    let row = sqlx::query_as::<_, LimitOrderRow>("SELECT * FROM limit_orders WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.map(TryInto::try_into).transpose()
}

pub async fn load_open_limit_orders(pool: &PgPool) -> anyhow::Result<Vec<LimitOrder>> {
    let rows = sqlx::query_as::<_, LimitOrderRow>(
        "SELECT * FROM limit_orders WHERE status = 'open' ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await?;

    convert_all(rows)
}

/// Compare-and-set the status. Terminal targets stamp `closed_at`.
pub async fn transition_limit_order(
    pool: &PgPool,
    id: Uuid,
    from: OrderStatus,
    to: OrderStatus,
    tx_ref: Option<&str>,
) -> anyhow::Result<bool> {
    if !from.can_transition_to(to) {
        anyhow::bail!("illegal limit order transition {from} -> {to}");
    }

    let closed_at = to.is_terminal().then(Utc::now);

    let result = sqlx::query(
        r#"
        UPDATE limit_orders
        SET status = $3,
            closed_at = COALESCE($4, closed_at),
            external_tx_ref = COALESCE($5, external_tx_ref)
        WHERE id = $1 AND status = $2
        "#,
    )
    .bind(id)
    .bind(from.as_str())
    .bind(to.as_str())
    .bind(closed_at)
    .bind(tx_ref)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn due_limit_orders(pool: &PgPool, now: DateTime<Utc>) -> anyhow::Result<Vec<LimitOrder>> {
    let rows = sqlx::query_as::<_, LimitOrderRow>(
        "SELECT * FROM limit_orders WHERE status = 'open' AND expiry <= $1 ORDER BY expiry ASC",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;

    convert_all(rows)
}
