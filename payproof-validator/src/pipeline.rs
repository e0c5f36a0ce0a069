//! Validation pipeline
//!
//! One run per submission:
//! 1. Fetch the proof image (the only fatal step)
//! 2. Record the document and a PENDING verdict
//! 3. Concurrently: OCR → field extraction → classification, duplicate lookup, heuristics
//! 4. Decide, persist every signal, append the verdict, publish the event
//!
//! Runs are independent; the perceptual-hash index is the only state two runs share.

use crate::classify::ClassificationService;
use crate::config::HeuristicsConfig;
use crate::db::{self, signals::SignalBundle};
use crate::decision::{DecisionEngine, DecisionInputs};
use crate::duplicate::{DuplicateCheck, DuplicateDetector};
use crate::extract::{self, ExtractionSource};
use crate::heuristics::{HeuristicsAnalyzer, HeuristicsReport};
use crate::ocr::OcrOrchestrator;
use crate::storage::ImageFetcher;
use crate::types::{ClassificationResult, ExtractedFields, ImageSignal, ProofDocument, ValidationVerdict};
use chrono::Utc;
use payproof_common::events::{EventBus, VerdictEvent};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Default Hamming distance for near-duplicate matches
pub const DEFAULT_NEAR_MATCH_MAX_DISTANCE: u32 = 6;

/// Reason recorded on the PENDING row while a run is in flight
const IN_PROGRESS_REASON: &str = "validation in progress";

/// A request to validate one uploaded proof
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationRequest {
    pub payment_submission_id: Uuid,
    pub file_url: String,
    pub file_type: String,
}

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub verdict: ValidationVerdict,
    pub fields: ExtractedFields,
    pub classification: ClassificationResult,
    pub image_signal: ImageSignal,
    pub payment_type: Option<&'static str>,
}

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The image could not be read; the submission stays PENDING and may be retried
    #[error("storage fetch failed: {0}")]
    StorageFetch(String),

    #[error(transparent)]
    Database(#[from] payproof_common::Error),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::StorageFetch(_))
    }
}

/// Orchestrates the signal producers for one submission at a time
pub struct ValidationPipeline {
    db: SqlitePool,
    fetcher: Arc<dyn ImageFetcher>,
    ocr: OcrOrchestrator,
    classifier: ClassificationService,
    duplicates: DuplicateDetector,
    heuristics: HeuristicsAnalyzer,
    decision: DecisionEngine,
    extraction_source: ExtractionSource,
    event_bus: EventBus,
}

impl ValidationPipeline {
    pub fn new(
        db: SqlitePool,
        fetcher: Arc<dyn ImageFetcher>,
        ocr: OcrOrchestrator,
        classifier: ClassificationService,
        event_bus: EventBus,
    ) -> Self {
        Self {
            duplicates: DuplicateDetector::new(db.clone(), DEFAULT_NEAR_MATCH_MAX_DISTANCE),
            db,
            fetcher,
            ocr,
            classifier,
            heuristics: HeuristicsAnalyzer::new(HeuristicsConfig::default()),
            decision: DecisionEngine::default(),
            extraction_source: ExtractionSource::default(),
            event_bus,
        }
    }

    pub fn with_near_match_max_distance(mut self, distance: u32) -> Self {
        self.duplicates = DuplicateDetector::new(self.db.clone(), distance);
        self
    }

    pub fn with_heuristics(mut self, config: HeuristicsConfig) -> Self {
        self.heuristics = HeuristicsAnalyzer::new(config);
        self
    }

    pub fn with_decision_engine(mut self, decision: DecisionEngine) -> Self {
        self.decision = decision;
        self
    }

    pub fn with_extraction_source(mut self, source: ExtractionSource) -> Self {
        self.extraction_source = source;
        self
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Record the PENDING row a background run starts from
    pub async fn mark_pending(&self, payment_submission_id: Uuid) -> Result<(), PipelineError> {
        db::verdicts::record_pending(&self.db, payment_submission_id, IN_PROGRESS_REASON).await?;
        Ok(())
    }

    /// Validate one proof end to end
    pub async fn validate(&self, request: &ValidationRequest) -> Result<ValidationOutcome, PipelineError> {
        let started = Instant::now();
        let submission_id = request.payment_submission_id;
        info!(
            payment_submission_id = %submission_id,
            file_type = %request.file_type,
            "Validation started"
        );

        let image = match self.fetcher.fetch(&request.file_url, &request.file_type).await {
            Ok(image) => image,
            Err(e) => {
                let reason = format!("storage fetch failed: {}", e);
                error!(payment_submission_id = %submission_id, error = %e, "Proof image unreadable");
                if let Err(db_err) = db::verdicts::record_pending(&self.db, submission_id, &reason).await {
                    warn!(payment_submission_id = %submission_id, error = %db_err, "Failed to record pending verdict");
                }
                self.event_bus.emit_lossy(VerdictEvent::ValidationFailed {
                    payment_submission_id: submission_id,
                    reason,
                    retryable: true,
                    timestamp: Utc::now(),
                });
                return Err(PipelineError::StorageFetch(e.to_string()));
            }
        };

        let document = ProofDocument::new(
            submission_id,
            request.file_url.clone(),
            request.file_type.clone(),
        );
        db::signals::record_document(&self.db, &document).await?;
        db::verdicts::record_pending(&self.db, submission_id, IN_PROGRESS_REASON).await?;

        let text_branch = async {
            let ocr = self.ocr.run(&image).await;
            let (fields, classification) = {
                let text = self.extraction_source.source_text(&ocr);
                let fields = extract::extract_fields(&text);
                let classification = self.classifier.classify(&text).await;
                (fields, classification)
            };
            (ocr, fields, classification)
        };
        let ((ocr, fields, classification), duplicate, report) = tokio::join!(
            text_branch,
            self.duplicates.check(&image, submission_id),
            self.heuristics.analyze(&image),
        );

        let image_signal = build_image_signal(submission_id, duplicate, report);
        let inputs = DecisionInputs {
            ocr: &ocr,
            fields: &fields,
            classification: &classification,
            image: &image_signal,
        };
        let verdict = self.decision.decide(submission_id, &inputs);

        db::signals::save_signals(
            &self.db,
            submission_id,
            SignalBundle {
                ocr: &ocr,
                fields: &fields,
                classification: &classification,
                image: &image_signal,
            },
        )
        .await?;
        db::verdicts::append_verdict(&self.db, &verdict).await?;

        self.event_bus.emit_lossy(VerdictEvent::VerdictIssued {
            payment_submission_id: submission_id,
            status: verdict.status,
            confidence_score: verdict.confidence_score,
            reason: verdict.reason.clone(),
            timestamp: verdict.validated_at,
        });

        info!(
            payment_submission_id = %submission_id,
            status = verdict.status.as_str(),
            confidence_score = verdict.confidence_score,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Validation finished"
        );

        let payment_type = extract::payment_type(&fields, &classification);
        Ok(ValidationOutcome {
            verdict,
            fields,
            classification,
            image_signal,
            payment_type,
        })
    }
}

/// Merge the duplicate lookup and heuristics into one image signal
///
/// A failed lookup becomes an anomaly so the run still reaches a verdict.
fn build_image_signal(
    submission_id: Uuid,
    duplicate: payproof_common::Result<DuplicateCheck>,
    report: HeuristicsReport,
) -> ImageSignal {
    let mut anomalies = report.anomalies;
    let (perceptual_hash, upload_count, matches) = match duplicate {
        Ok(check) => (check.perceptual_hash, check.upload_count, check.matches),
        Err(e) => {
            warn!(payment_submission_id = %submission_id, error = %e, "Duplicate check unavailable");
            anomalies.push(format!("duplicate check unavailable: {}", e));
            (String::new(), 0, Vec::new())
        }
    };

    ImageSignal {
        perceptual_hash,
        duplicate_detected: !matches.is_empty(),
        similarity_percentage: matches.first().map(|m| m.similarity_percentage),
        duplicate_matches: matches,
        upload_count,
        exif_available: report.exif_available,
        exif_editor_detected: report.exif_editor_detected,
        looks_like_screenshot: report.looks_like_screenshot,
        aspect_ratio: report.aspect_ratio,
        resolution_w: report.resolution_w,
        resolution_h: report.resolution_h,
        text_density_score: report.text_density_score,
        anomalies,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DuplicateMatch;

    fn clean_report() -> HeuristicsReport {
        HeuristicsReport {
            decodable: true,
            exif_available: false,
            exif_editor_detected: None,
            looks_like_screenshot: true,
            aspect_ratio: 2.0,
            resolution_w: 720,
            resolution_h: 1440,
            text_density_score: 6.0,
            anomalies: Vec::new(),
        }
    }

    #[test]
    fn test_duplicate_matches_set_similarity() {
        let prior = Uuid::new_v4();
        let check = DuplicateCheck {
            perceptual_hash: "00ff00ff00ff00ff".to_string(),
            upload_count: 2,
            matches: vec![DuplicateMatch {
                payment_submission_id: prior,
                flat_id: None,
                collection_id: None,
                submission_status: None,
                similarity_percentage: 100.0,
                first_seen_at: Utc::now(),
            }],
        };

        let signal = build_image_signal(Uuid::new_v4(), Ok(check), clean_report());
        assert!(signal.duplicate_detected);
        assert_eq!(signal.similarity_percentage, Some(100.0));
        assert_eq!(signal.upload_count, 2);
        assert!(signal.heuristics_normal());
    }

    #[test]
    fn test_failed_lookup_becomes_anomaly() {
        let signal = build_image_signal(
            Uuid::new_v4(),
            Err(payproof_common::Error::Internal("pool closed".to_string())),
            clean_report(),
        );
        assert!(!signal.duplicate_detected);
        assert_eq!(signal.similarity_percentage, None);
        assert_eq!(signal.anomalies.len(), 1);
        assert!(signal.anomalies[0].starts_with("duplicate check unavailable"));
    }

    #[test]
    fn test_only_fetch_failures_are_retryable() {
        assert!(PipelineError::StorageFetch("404".into()).is_retryable());
        assert!(!PipelineError::Database(payproof_common::Error::NotFound("x".into())).is_retryable());
    }
}
