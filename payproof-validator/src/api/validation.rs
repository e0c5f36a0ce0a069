//! Validation API handlers
//!
//! POST /validations, POST /validations/async, GET /validations/:id,
//! GET /validations/:id/history, GET /validations/:id/duplicates

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    db,
    error::{ApiError, ApiResult},
    pipeline::{ValidationOutcome, ValidationPipeline, ValidationRequest},
    types::{DuplicateMatch, ValidationStatus, ValidationVerdict},
    AppState,
};

/// Fields surfaced to the submitter
#[derive(Debug, Serialize)]
pub struct ExtractedData {
    pub amount: Option<f64>,
    pub date: Option<NaiveDate>,
    pub transaction_ref: Option<String>,
    pub payment_type: Option<&'static str>,
    pub platform: Option<String>,
}

/// POST /validations response
#[derive(Debug, Serialize)]
pub struct ValidationResponse {
    pub payment_submission_id: Uuid,
    pub validation_status: ValidationStatus,
    pub confidence_score: f32,
    pub reason: String,
    pub extracted_data: ExtractedData,
}

impl From<ValidationOutcome> for ValidationResponse {
    fn from(outcome: ValidationOutcome) -> Self {
        Self {
            payment_submission_id: outcome.verdict.payment_submission_id,
            validation_status: outcome.verdict.status,
            confidence_score: outcome.verdict.confidence_score,
            reason: outcome.verdict.reason,
            extracted_data: ExtractedData {
                amount: outcome.fields.amount,
                date: outcome.fields.date,
                transaction_ref: outcome.fields.transaction_ref,
                payment_type: outcome.payment_type,
                platform: outcome.fields.platform,
            },
        }
    }
}

/// POST /validations/async response
#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub payment_submission_id: Uuid,
    pub validation_status: ValidationStatus,
}

/// GET /validations/:id response
#[derive(Debug, Serialize)]
pub struct VerdictResponse {
    pub payment_submission_id: Uuid,
    pub validation_status: ValidationStatus,
    pub confidence_score: f32,
    pub reason: String,
    pub validated_at: chrono::DateTime<chrono::Utc>,
}

impl From<ValidationVerdict> for VerdictResponse {
    fn from(verdict: ValidationVerdict) -> Self {
        Self {
            payment_submission_id: verdict.payment_submission_id,
            validation_status: verdict.status,
            confidence_score: verdict.confidence_score,
            reason: verdict.reason,
            validated_at: verdict.validated_at,
        }
    }
}

/// GET /validations/:id/history response
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub payment_submission_id: Uuid,
    pub verdicts: Vec<VerdictResponse>,
}

/// GET /validations/:id/duplicates response
#[derive(Debug, Serialize)]
pub struct DuplicatesResponse {
    pub payment_submission_id: Uuid,
    pub perceptual_hash: String,
    pub upload_count: i64,
    pub duplicate_detected: bool,
    pub similarity_percentage: Option<f32>,
    pub matches: Vec<DuplicateMatch>,
}

fn check_request(request: &ValidationRequest) -> ApiResult<()> {
    if request.file_url.trim().is_empty() {
        return Err(ApiError::BadRequest("file_url must not be empty".to_string()));
    }
    if request.file_type.trim().is_empty() {
        return Err(ApiError::BadRequest("file_type must not be empty".to_string()));
    }
    Ok(())
}

async fn record_failure(state: &AppState, submission_id: Uuid, message: String) {
    error!(payment_submission_id = %submission_id, "Validation failed: {}", message);
    *state.last_error.write().await = Some(message);
}

/// POST /validations
///
/// Runs the whole pipeline and answers with the verdict.
pub async fn validate(
    State(state): State<AppState>,
    Json(request): Json<ValidationRequest>,
) -> ApiResult<Json<ValidationResponse>> {
    check_request(&request)?;

    match state.pipeline.validate(&request).await {
        Ok(outcome) => Ok(Json(outcome.into())),
        Err(e) => {
            record_failure(&state, request.payment_submission_id, e.to_string()).await;
            Err(e.into())
        }
    }
}

/// POST /validations/async
///
/// Records PENDING and returns 202; the run continues in the background and
/// its verdict is published on the event bus.
pub async fn validate_async(
    State(state): State<AppState>,
    Json(request): Json<ValidationRequest>,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    check_request(&request)?;

    let submission_id = request.payment_submission_id;
    state.pipeline.mark_pending(submission_id).await?;

    let pipeline: Arc<ValidationPipeline> = Arc::clone(&state.pipeline);
    let last_error = Arc::clone(&state.last_error);
    tokio::spawn(async move {
        if let Err(e) = pipeline.validate(&request).await {
            error!(payment_submission_id = %submission_id, error = %e, "Background validation failed");
            *last_error.write().await = Some(e.to_string());
        }
    });

    info!(payment_submission_id = %submission_id, "Validation accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            payment_submission_id: submission_id,
            validation_status: ValidationStatus::Pending,
        }),
    ))
}

/// GET /validations/:id
pub async fn get_verdict(
    State(state): State<AppState>,
    Path(submission_id): Path<Uuid>,
) -> ApiResult<Json<VerdictResponse>> {
    let verdict = db::verdicts::current_verdict(&state.db, submission_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No validation for {}", submission_id)))?;
    Ok(Json(verdict.into()))
}

/// GET /validations/:id/history
pub async fn get_history(
    State(state): State<AppState>,
    Path(submission_id): Path<Uuid>,
) -> ApiResult<Json<HistoryResponse>> {
    let history = db::verdicts::verdict_history(&state.db, submission_id).await?;
    if history.is_empty() {
        return Err(ApiError::NotFound(format!("No validation for {}", submission_id)));
    }

    Ok(Json(HistoryResponse {
        payment_submission_id: submission_id,
        verdicts: history.into_iter().map(VerdictResponse::from).collect(),
    }))
}

/// GET /validations/:id/duplicates
pub async fn get_duplicates(
    State(state): State<AppState>,
    Path(submission_id): Path<Uuid>,
) -> ApiResult<Json<DuplicatesResponse>> {
    let signal = db::signals::load_image_signal(&state.db, submission_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No image signal for {}", submission_id)))?;

    Ok(Json(DuplicatesResponse {
        payment_submission_id: submission_id,
        perceptual_hash: signal.perceptual_hash,
        upload_count: signal.upload_count,
        duplicate_detected: signal.duplicate_detected,
        similarity_percentage: signal.similarity_percentage,
        matches: signal.duplicate_matches,
    }))
}

/// Build validation routes
pub fn validation_routes() -> Router<AppState> {
    Router::new()
        .route("/validations", post(validate))
        .route("/validations/async", post(validate_async))
        .route("/validations/:id", get(get_verdict))
        .route("/validations/:id/history", get(get_history))
        .route("/validations/:id/duplicates", get(get_duplicates))
}
