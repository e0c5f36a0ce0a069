//! Per-submission signal rows
//!
//! Each run replaces the OCR, extraction, classification and image rows of its
//! submission in one transaction, so a reader never sees a mix of two runs.

use super::{from_db_timestamp, parse_uuid, to_db_timestamp};
use crate::ocr::OcrOutcome;
use crate::types::{
    ClassificationResult, DuplicateMatch, ExtractedFields, ImageSignal, PaymentStatusKeyword,
    ProofDocument,
};
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};
use chrono::Utc;
use payproof_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Signals produced by one run
#[derive(Debug, Clone, Copy)]
pub struct SignalBundle<'a> {
    pub ocr: &'a OcrOutcome,
    pub fields: &'a ExtractedFields,
    pub classification: &'a ClassificationResult,
    pub image: &'a ImageSignal,
}

fn status_keyword_str(keyword: PaymentStatusKeyword) -> &'static str {
    match keyword {
        PaymentStatusKeyword::Success => "success",
        PaymentStatusKeyword::Failed => "failed",
        PaymentStatusKeyword::Pending => "pending",
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| Error::Internal(format!("Failed to serialize signal: {}", e)))
}

/// Record the proof document, keeping the first record of a re-submitted URL
pub async fn record_document(pool: &SqlitePool, document: &ProofDocument) -> Result<ProofDocument> {
    let id = document.id.to_string();
    let submission = document.payment_submission_id.to_string();
    let uploaded_at = to_db_timestamp(document.uploaded_at);

    retry_on_lock("record_document", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            "INSERT OR IGNORE INTO proof_documents \
             (id, payment_submission_id, image_url, file_type, uploaded_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&submission)
        .bind(&document.image_url)
        .bind(&document.file_type)
        .bind(&uploaded_at)
        .execute(pool)
        .await?;
        Ok::<_, Error>(())
    })
    .await?;

    let row = sqlx::query(
        "SELECT id, payment_submission_id, image_url, file_type, uploaded_at \
         FROM proof_documents WHERE payment_submission_id = ? AND image_url = ?",
    )
    .bind(&submission)
    .bind(&document.image_url)
    .fetch_one(pool)
    .await?;

    let id: String = row.get("id");
    let submission: String = row.get("payment_submission_id");
    let uploaded_at: String = row.get("uploaded_at");
    Ok(ProofDocument {
        id: parse_uuid(&id)?,
        payment_submission_id: parse_uuid(&submission)?,
        image_url: row.get("image_url"),
        file_type: row.get("file_type"),
        uploaded_at: from_db_timestamp(&uploaded_at)?,
    })
}

/// Replace every signal row of a submission with this run's results
pub async fn save_signals(
    pool: &SqlitePool,
    payment_submission_id: Uuid,
    signals: SignalBundle<'_>,
) -> Result<()> {
    let submission = payment_submission_id.to_string();
    let matches_json = to_json(&signals.image.duplicate_matches)?;
    let anomalies_json = to_json(&signals.image.anomalies)?;
    let winner = signals.ocr.winner_result().map(|r| r.engine_name.clone());

    retry_on_lock("save_signals", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let now = to_db_timestamp(Utc::now());
        let mut tx = pool.begin().await?;

        // OCR: the engine set can differ between runs, so replace wholesale
        sqlx::query("DELETE FROM ocr_results WHERE payment_submission_id = ?")
            .bind(&submission)
            .execute(&mut *tx)
            .await?;
        for result in signals.ocr.results() {
            sqlx::query(
                "INSERT INTO ocr_results \
                 (payment_submission_id, engine_name, text, confidence, processing_time_ms, error, is_winner, recorded_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&submission)
            .bind(&result.engine_name)
            .bind(&result.text)
            .bind(f64::from(result.confidence))
            .bind(result.processing_time_ms as i64)
            .bind(&result.error)
            .bind(winner.as_deref() == Some(result.engine_name.as_str()))
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        let fields = signals.fields;
        sqlx::query(
            r#"
            INSERT INTO extracted_fields (
                payment_submission_id, amount, payment_date, transaction_ref, platform,
                bank_name, status_keyword, has_amount, has_transaction_ref, has_date,
                has_status_keyword, has_payment_keyword, has_bank_name, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(payment_submission_id) DO UPDATE SET
                amount = excluded.amount,
                payment_date = excluded.payment_date,
                transaction_ref = excluded.transaction_ref,
                platform = excluded.platform,
                bank_name = excluded.bank_name,
                status_keyword = excluded.status_keyword,
                has_amount = excluded.has_amount,
                has_transaction_ref = excluded.has_transaction_ref,
                has_date = excluded.has_date,
                has_status_keyword = excluded.has_status_keyword,
                has_payment_keyword = excluded.has_payment_keyword,
                has_bank_name = excluded.has_bank_name,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(&submission)
        .bind(fields.amount)
        .bind(fields.date.map(|d| d.to_string()))
        .bind(&fields.transaction_ref)
        .bind(&fields.platform)
        .bind(&fields.bank_name)
        .bind(fields.status_keyword.map(status_keyword_str))
        .bind(fields.has_amount)
        .bind(fields.has_transaction_ref)
        .bind(fields.has_date)
        .bind(fields.has_status_keyword)
        .bind(fields.has_payment_keyword)
        .bind(fields.has_bank_name)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let classification = signals.classification;
        sqlx::query(
            r#"
            INSERT INTO classification_results (
                payment_submission_id, document_type, confidence_score, confidence_level,
                reasoning, is_fallback, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(payment_submission_id) DO UPDATE SET
                document_type = excluded.document_type,
                confidence_score = excluded.confidence_score,
                confidence_level = excluded.confidence_level,
                reasoning = excluded.reasoning,
                is_fallback = excluded.is_fallback,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(&submission)
        .bind(classification.document_type.as_str())
        .bind(f64::from(classification.confidence_score))
        .bind(classification.confidence_level.as_str())
        .bind(&classification.reasoning)
        .bind(classification.fallback)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let image = signals.image;
        sqlx::query(
            r#"
            INSERT INTO image_signals (
                payment_submission_id, perceptual_hash, duplicate_detected,
                similarity_percentage, duplicate_matches, upload_count, exif_available,
                exif_editor_detected, looks_like_screenshot, aspect_ratio, resolution_w,
                resolution_h, text_density_score, anomalies, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(payment_submission_id) DO UPDATE SET
                perceptual_hash = excluded.perceptual_hash,
                duplicate_detected = excluded.duplicate_detected,
                similarity_percentage = excluded.similarity_percentage,
                duplicate_matches = excluded.duplicate_matches,
                upload_count = excluded.upload_count,
                exif_available = excluded.exif_available,
                exif_editor_detected = excluded.exif_editor_detected,
                looks_like_screenshot = excluded.looks_like_screenshot,
                aspect_ratio = excluded.aspect_ratio,
                resolution_w = excluded.resolution_w,
                resolution_h = excluded.resolution_h,
                text_density_score = excluded.text_density_score,
                anomalies = excluded.anomalies,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(&submission)
        .bind(&image.perceptual_hash)
        .bind(image.duplicate_detected)
        .bind(image.similarity_percentage.map(f64::from))
        .bind(&matches_json)
        .bind(image.upload_count)
        .bind(image.exif_available)
        .bind(&image.exif_editor_detected)
        .bind(image.looks_like_screenshot)
        .bind(f64::from(image.aspect_ratio))
        .bind(i64::from(image.resolution_w))
        .bind(i64::from(image.resolution_h))
        .bind(f64::from(image.text_density_score))
        .bind(&anomalies_json)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok::<_, Error>(())
    })
    .await?;

    tracing::debug!(payment_submission_id = %payment_submission_id, "Signals persisted");
    Ok(())
}

/// Stored image signal of a submission
pub async fn load_image_signal(
    pool: &SqlitePool,
    payment_submission_id: Uuid,
) -> Result<Option<ImageSignal>> {
    let row = sqlx::query("SELECT * FROM image_signals WHERE payment_submission_id = ?")
        .bind(payment_submission_id.to_string())
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let matches_json: String = row.get("duplicate_matches");
    let anomalies_json: String = row.get("anomalies");
    let duplicate_matches: Vec<DuplicateMatch> = serde_json::from_str(&matches_json)
        .map_err(|e| Error::Internal(format!("Corrupt duplicate_matches: {}", e)))?;
    let anomalies: Vec<String> = serde_json::from_str(&anomalies_json)
        .map_err(|e| Error::Internal(format!("Corrupt anomalies: {}", e)))?;
    let similarity: Option<f64> = row.get("similarity_percentage");
    let aspect_ratio: f64 = row.get("aspect_ratio");
    let text_density: f64 = row.get("text_density_score");
    let resolution_w: i64 = row.get("resolution_w");
    let resolution_h: i64 = row.get("resolution_h");

    Ok(Some(ImageSignal {
        perceptual_hash: row.get("perceptual_hash"),
        duplicate_detected: row.get("duplicate_detected"),
        similarity_percentage: similarity.map(|s| s as f32),
        duplicate_matches,
        upload_count: row.get("upload_count"),
        exif_available: row.get("exif_available"),
        exif_editor_detected: row.get("exif_editor_detected"),
        looks_like_screenshot: row.get("looks_like_screenshot"),
        aspect_ratio: aspect_ratio as f32,
        resolution_w: resolution_w as u32,
        resolution_h: resolution_h as u32,
        text_density_score: text_density as f32,
        anomalies,
    }))
}

/// Stored classification of a submission
pub async fn load_classification(
    pool: &SqlitePool,
    payment_submission_id: Uuid,
) -> Result<Option<ClassificationResult>> {
    let row = sqlx::query(
        "SELECT document_type, confidence_score, reasoning, is_fallback \
         FROM classification_results WHERE payment_submission_id = ?",
    )
    .bind(payment_submission_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(|row| {
        let label: String = row.get("document_type");
        let score: f64 = row.get("confidence_score");
        let document_type = crate::types::DocumentType::parse(&label)
            .ok_or_else(|| Error::Internal(format!("Unknown document type '{}'", label)))?;
        let reasoning: String = row.get("reasoning");
        if row.get::<bool, _>("is_fallback") {
            return Ok(ClassificationResult {
                reasoning,
                ..ClassificationResult::fallback("")
            });
        }
        Ok(ClassificationResult::new(document_type, score as f32, reasoning))
    })
    .transpose()
}

/// Number of OCR rows stored for a submission
pub async fn ocr_result_count(pool: &SqlitePool, payment_submission_id: Uuid) -> Result<i64> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM ocr_results WHERE payment_submission_id = ?",
    )
    .bind(payment_submission_id.to_string())
    .fetch_one(pool)
    .await?;
    Ok(count)
}
