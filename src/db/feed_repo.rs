use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::FeedGap;

#[derive(Debug, Clone, FromRow)]
struct FeedGapRow {
    id: Uuid,
    source_id: String,
    expected_seq: i64,
    resumed_seq: i64,
    detected_at: DateTime<Utc>,
}

pub async fn load_cursor(pool: &PgPool, source_id: &str) -> anyhow::Result<Option<u64>> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT next_seq FROM feed_cursors WHERE source_id = $1")
        .bind(source_id)
        .fetch_optional(pool)
        .await?;

    row.map(|r| u64::try_from(r.0).map_err(Into::into)).transpose()
}

/// Persist the checkpoint. Cursors only move forward.
pub async fn save_cursor(pool: &PgPool, source_id: &str, next_seq: u64) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO feed_cursors (source_id, next_seq, updated_at)
        VALUES ($1, $2, NOW())
        ON CONFLICT (source_id) DO UPDATE
            SET next_seq = GREATEST(feed_cursors.next_seq, EXCLUDED.next_seq), updated_at = NOW()
        "#,
    )
    .bind(source_id)
    .bind(i64::try_from(next_seq)?)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn record_gap(pool: &PgPool, gap: &FeedGap) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO feed_gaps (id, source_id, expected_seq, resumed_seq, detected_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(gap.id)
    .bind(&gap.source_id)
    .bind(i64::try_from(gap.expected_seq)?)
    .bind(i64::try_from(gap.resumed_seq)?)
    .bind(gap.detected_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn recent_gaps(pool: &PgPool, limit: i64) -> anyhow::Result<Vec<FeedGap>> {
    let rows = sqlx::query_as::<_, FeedGapRow>(
        "SELECT * FROM feed_gaps ORDER BY detected_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| {
            Ok(FeedGap {
                id: r.id,
                source_id: r.source_id,
                expected_seq: u64::try_from(r.expected_seq)?,
                resumed_seq: u64::try_from(r.resumed_seq)?,
                detected_at: r.detected_at,
            })
        })
        .collect()
}
