//! Verdict audit trail
//!
//! Verdict rows are only ever appended. The current verdict for a submission is
//! its newest row. A PENDING row is never appended once a terminal verdict
//! exists, which keeps status monotonic.

use super::{from_db_timestamp, parse_uuid, to_db_timestamp};
use crate::types::{ValidationStatus, ValidationVerdict};
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};
use payproof_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

fn verdict_from_row(row: &SqliteRow) -> Result<ValidationVerdict> {
    let id: String = row.get("payment_submission_id");
    let status: String = row.get("status");
    let validated_at: String = row.get("validated_at");
    let confidence_score: f64 = row.get("confidence_score");

    Ok(ValidationVerdict {
        payment_submission_id: parse_uuid(&id)?,
        status: ValidationStatus::parse(&status)
            .ok_or_else(|| Error::Internal(format!("Unknown verdict status '{}'", status)))?,
        confidence_score: confidence_score as f32,
        reason: row.get("reason"),
        validated_at: from_db_timestamp(&validated_at)?,
    })
}

/// Append a verdict row
pub async fn append_verdict(pool: &SqlitePool, verdict: &ValidationVerdict) -> Result<()> {
    let submission = verdict.payment_submission_id.to_string();
    let validated_at = to_db_timestamp(verdict.validated_at);

    retry_on_lock("append_verdict", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            "INSERT INTO validation_verdicts \
             (payment_submission_id, status, confidence_score, reason, validated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&submission)
        .bind(verdict.status.as_str())
        .bind(f64::from(verdict.confidence_score))
        .bind(&verdict.reason)
        .bind(&validated_at)
        .execute(pool)
        .await?;
        Ok::<_, Error>(())
    })
    .await
}

/// Append a PENDING row unless a terminal verdict already exists or the newest
/// row is already PENDING with the same reason
///
/// The checks and the insert are one statement. Returns whether a row was written.
pub async fn record_pending(pool: &SqlitePool, payment_submission_id: Uuid, reason: &str) -> Result<bool> {
    let submission = payment_submission_id.to_string();
    let now = to_db_timestamp(chrono::Utc::now());

    retry_on_lock("record_pending", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let written = sqlx::query(
            r#"
            INSERT INTO validation_verdicts
                (payment_submission_id, status, confidence_score, reason, validated_at)
            SELECT ?, ?, 0.0, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM validation_verdicts
                WHERE payment_submission_id = ? AND status != ?
            )
            AND NOT EXISTS (
                SELECT 1 FROM (
                    SELECT status, reason FROM validation_verdicts
                    WHERE payment_submission_id = ?
                    ORDER BY id DESC LIMIT 1
                ) AS newest
                WHERE newest.status = ? AND newest.reason = ?
            )
            "#,
        )
        .bind(&submission)
        .bind(ValidationStatus::Pending.as_str())
        .bind(reason)
        .bind(&now)
        .bind(&submission)
        .bind(ValidationStatus::Pending.as_str())
        .bind(&submission)
        .bind(ValidationStatus::Pending.as_str())
        .bind(reason)
        .execute(pool)
        .await?
        .rows_affected();
        Ok::<_, Error>(written == 1)
    })
    .await
}

/// Newest verdict for a submission
pub async fn current_verdict(
    pool: &SqlitePool,
    payment_submission_id: Uuid,
) -> Result<Option<ValidationVerdict>> {
    let row = sqlx::query(
        "SELECT payment_submission_id, status, confidence_score, reason, validated_at \
         FROM validation_verdicts WHERE payment_submission_id = ? \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(payment_submission_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(verdict_from_row).transpose()
}

/// Full audit trail, oldest first
pub async fn verdict_history(
    pool: &SqlitePool,
    payment_submission_id: Uuid,
) -> Result<Vec<ValidationVerdict>> {
    let rows = sqlx::query(
        "SELECT payment_submission_id, status, confidence_score, reason, validated_at \
         FROM validation_verdicts WHERE payment_submission_id = ? \
         ORDER BY id ASC",
    )
    .bind(payment_submission_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(verdict_from_row).collect()
}
