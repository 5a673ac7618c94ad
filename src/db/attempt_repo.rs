use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{BeginAttempt, Completion};
use crate::models::{AttemptOutcome, CopyUsage, ExecutionAttempt, Fingerprint, IntentTarget, Side};

/// Database row for execution_attempts table.
#[derive(Debug, Clone, FromRow)]
pub struct AttemptRow {
    pub fingerprint: String,
    pub trigger_event_id: String,
    pub target_kind: String,
    pub target_id: Uuid,
    pub owner_user_id: i64,
    pub chain_id: String,
    pub instrument: String,
    pub side: String,
    pub amount: Decimal,
    pub max_slippage_bps: i32,
    pub deadline: DateTime<Utc>,
    pub attempt_number: i32,
    pub outcome: String,
    pub external_tx_ref: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<AttemptRow> for ExecutionAttempt {
    type Error = anyhow::Error;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        let fingerprint = Fingerprint::from_hex(&row.fingerprint)
            .ok_or_else(|| anyhow::anyhow!("malformed fingerprint: {}", row.fingerprint))?;
        let target = IntentTarget::from_parts(&row.target_kind, row.target_id)
            .ok_or_else(|| anyhow::anyhow!("unknown target kind: {}", row.target_kind))?;
        let side = Side::from_api_str(&row.side)
            .ok_or_else(|| anyhow::anyhow!("unknown side: {}", row.side))?;

        Ok(Self {
            fingerprint,
            trigger_event_id: row.trigger_event_id,
            target,
            owner_user_id: row.owner_user_id,
            chain_id: row.chain_id,
            instrument: row.instrument,
            side,
            amount: row.amount,
            max_slippage_bps: u32::try_from(row.max_slippage_bps)?,
            deadline: row.deadline,
            attempt_number: u32::try_from(row.attempt_number)?,
            outcome: row.outcome.parse()?,
            external_tx_ref: row.external_tx_ref,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn convert_all(rows: Vec<AttemptRow>) -> anyhow::Result<Vec<ExecutionAttempt>> {
    rows.into_iter().map(TryInto::try_into).collect()
}

/// Insert a Pending attempt unless one already exists for the fingerprint.
pub async fn begin_attempt(pool: &PgPool, attempt: &ExecutionAttempt) -> anyhow::Result<BeginAttempt> {
    let inserted = sqlx::query_as::<_, AttemptRow>(
        r#"
        INSERT INTO execution_attempts (
            fingerprint, trigger_event_id, target_kind, target_id, owner_user_id,
            chain_id, instrument, side, amount, max_slippage_bps, deadline,
            attempt_number, outcome, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 0, 'pending', NOW(), NOW())
        ON CONFLICT (fingerprint) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(attempt.fingerprint.as_str())
    .bind(&attempt.trigger_event_id)
    .bind(attempt.target.kind())
    .bind(attempt.target.id())
    .bind(attempt.owner_user_id)
    .bind(&attempt.chain_id)
    .bind(&attempt.instrument)
    .bind(attempt.side.as_str())
    .bind(attempt.amount)
    .bind(i32::try_from(attempt.max_slippage_bps)?)
    .bind(attempt.deadline)
    .fetch_optional(pool)
    .await?;

    if let Some(row) = inserted {
        return Ok(BeginAttempt::Started(row.try_into()?));
    }

    let existing = get_attempt(pool, &attempt.fingerprint)
        .await?
        .ok_or_else(|| anyhow::anyhow!("attempt {} vanished after conflict", attempt.fingerprint))?;

    Ok(BeginAttempt::Existing(existing))
}

/// Bump the attempt counter right before a venue submission.
pub async fn record_submission(
    pool: &PgPool,
    fingerprint: &Fingerprint,
    attempt_number: u32,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE execution_attempts
        SET attempt_number = $2, updated_at = NOW()
        WHERE fingerprint = $1 AND outcome = 'pending'
        "#,
    )
    .bind(fingerprint.as_str())
    .bind(i32::try_from(attempt_number)?)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn record_tx_ref(pool: &PgPool, fingerprint: &Fingerprint, tx_ref: &str) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE execution_attempts
        SET external_tx_ref = $2, updated_at = NOW()
        WHERE fingerprint = $1 AND outcome = 'pending'
        "#,
    )
    .bind(fingerprint.as_str())
    .bind(tx_ref)
    .execute(pool)
    .await?;

    Ok(())
}

/// Move a Pending attempt to a terminal outcome. A row that is already
/// terminal is returned untouched.
pub async fn complete_attempt(
    pool: &PgPool,
    fingerprint: &Fingerprint,
    outcome: AttemptOutcome,
    tx_ref: Option<&str>,
    error: Option<&str>,
) -> anyhow::Result<Completion> {
    if !outcome.is_terminal() {
        anyhow::bail!("complete_attempt requires a terminal outcome, got {outcome}");
    }

    let updated = sqlx::query_as::<_, AttemptRow>(
        r#"
        UPDATE execution_attempts
        SET outcome = $2,
            external_tx_ref = COALESCE($3, external_tx_ref),
            error_message = $4,
            updated_at = NOW()
        WHERE fingerprint = $1 AND outcome = 'pending'
        RETURNING *
        "#,
    )
    .bind(fingerprint.as_str())
    .bind(outcome.as_str())
    .bind(tx_ref)
    .bind(error)
    .fetch_optional(pool)
    .await?;

    if let Some(row) = updated {
        return Ok(Completion::Recorded(row.try_into()?));
    }

    let existing = get_attempt(pool, fingerprint)
        .await?
        .ok_or_else(|| anyhow::anyhow!("attempt {fingerprint} not found"))?;

    Ok(Completion::AlreadyTerminal(existing))
}

pub async fn get_attempt(pool: &PgPool, fingerprint: &Fingerprint) -> anyhow::Result<Option<ExecutionAttempt>> {
    let row = sqlx::query_as::<_, AttemptRow>("SELECT * FROM execution_attempts WHERE fingerprint = $1")
        .bind(fingerprint.as_str())
        .fetch_optional(pool)
        .await?;

    row.map(TryInto::try_into).transpose()
}

pub async fn stale_pending_attempts(
    pool: &PgPool,
    older_than: DateTime<Utc>,
) -> anyhow::Result<Vec<ExecutionAttempt>> {
    let rows = sqlx::query_as::<_, AttemptRow>(
        r#"
        SELECT * FROM execution_attempts
        WHERE outcome = 'pending' AND updated_at <= $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(older_than)
    .fetch_all(pool)
    .await?;

    convert_all(rows)
}

pub async fn recent_attempts(pool: &PgPool, limit: i64) -> anyhow::Result<Vec<ExecutionAttempt>> {
    let rows = sqlx::query_as::<_, AttemptRow>(
        "SELECT * FROM execution_attempts ORDER BY created_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    convert_all(rows)
}

/// Spend and per-token copy count over a config's succeeded attempts.
pub async fn copy_usage(pool: &PgPool, config_id: Uuid, instrument: &str) -> anyhow::Result<CopyUsage> {
    let (spent, copies): (Option<Decimal>, i64) = sqlx::query_as(
        r#"
        SELECT SUM(amount), COUNT(*) FILTER (WHERE instrument = $2)
        FROM execution_attempts
        WHERE target_kind = 'copy_config' AND target_id = $1 AND outcome = 'succeeded'
        "#,
    )
    .bind(config_id)
    .bind(instrument)
    .fetch_one(pool)
    .await?;

    Ok(CopyUsage {
        spent: spent.unwrap_or_default(),
        copies_of_token: u64::try_from(copies)?,
    })
}
