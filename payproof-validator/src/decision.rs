//! Fraud-signal aggregation
//!
//! Fuses the four signal bundles into one verdict. Rules are evaluated in a
//! fixed order and the first that fires decides the status:
//!
//! 1. confident non-payment classification → REJECTED
//! 2. total signal failure (OCR ran cleanly, found nothing) → REJECTED
//! 3. any review trigger → MANUAL_REVIEW
//! 4. otherwise → AUTO_APPROVED
//!
//! Duplicates and image heuristics appear only among the review triggers, so
//! on their own they can never reject a submission.

use crate::ocr::OcrOutcome;
use crate::types::{
    clamp_score, ClassificationResult, ConfidenceLevel, DocumentType, ExtractedFields, ImageSignal,
    PaymentStatusKeyword, ValidationStatus, ValidationVerdict,
};
use payproof_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

/// Decision weights and thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionPolicy {
    pub ocr_weight: f32,
    pub fields_weight: f32,
    pub classification_weight: f32,
    /// OCR winner confidence needed for auto-approval
    pub ocr_high_confidence: f32,
    /// Classification confidence needed for auto-approval
    pub classification_high_confidence: f32,
    /// Non-payment classification at or above this rejects
    pub non_payment_reject_confidence: f32,
    /// Weighted score needed for auto-approval
    pub auto_approve_score: f32,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            ocr_weight: 0.35,
            fields_weight: 0.35,
            classification_weight: 0.30,
            ocr_high_confidence: 80.0,
            classification_high_confidence: 80.0,
            non_payment_reject_confidence: 80.0,
            auto_approve_score: 80.0,
        }
    }
}

impl DecisionPolicy {
    /// Weights must be non-negative and sum to 1; thresholds lie in 0-100
    pub fn validate(&self) -> Result<()> {
        let weights = [
            ("ocr_weight", self.ocr_weight),
            ("fields_weight", self.fields_weight),
            ("classification_weight", self.classification_weight),
        ];
        for (name, weight) in weights {
            if !weight.is_finite() || weight < 0.0 {
                return Err(Error::Config(format!(
                    "decision.{} must be a non-negative number, got {}",
                    name, weight
                )));
            }
        }

        let sum: f32 = weights.iter().map(|(_, w)| w).sum();
        if (sum - 1.0).abs() > 0.01 {
            return Err(Error::Config(format!(
                "decision weights must sum to 1.0, got {:.3}",
                sum
            )));
        }

        let thresholds = [
            ("ocr_high_confidence", self.ocr_high_confidence),
            (
                "classification_high_confidence",
                self.classification_high_confidence,
            ),
            (
                "non_payment_reject_confidence",
                self.non_payment_reject_confidence,
            ),
            ("auto_approve_score", self.auto_approve_score),
        ];
        for (name, threshold) in thresholds {
            if !(0.0..=100.0).contains(&threshold) {
                return Err(Error::Config(format!(
                    "decision.{} must be within 0-100, got {}",
                    name, threshold
                )));
            }
        }

        Ok(())
    }
}

/// Everything the engine looks at for one submission
#[derive(Debug, Clone, Copy)]
pub struct DecisionInputs<'a> {
    pub ocr: &'a OcrOutcome,
    pub fields: &'a ExtractedFields,
    pub classification: &'a ClassificationResult,
    pub image: &'a ImageSignal,
}

/// Verdict engine
#[derive(Debug, Clone, Default)]
pub struct DecisionEngine {
    policy: DecisionPolicy,
}

impl DecisionEngine {
    pub fn new(policy: DecisionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    /// Weighted confidence that the upload is a genuine payment proof
    ///
    /// Classification confidence only counts for payment categories.
    pub fn score(&self, inputs: &DecisionInputs<'_>) -> f32 {
        let classification = if inputs.classification.document_type.is_payment() {
            inputs.classification.confidence_score
        } else {
            0.0
        };

        clamp_score(
            self.policy.ocr_weight * inputs.ocr.winner_confidence()
                + self.policy.fields_weight * inputs.fields.completeness_ratio() * 100.0
                + self.policy.classification_weight * classification,
        )
    }

    /// Decide the terminal verdict
    pub fn decide(&self, payment_submission_id: Uuid, inputs: &DecisionInputs<'_>) -> ValidationVerdict {
        let score = self.score(inputs);
        let (status, reason) = self.evaluate(inputs, score);

        info!(
            payment_submission_id = %payment_submission_id,
            status = status.as_str(),
            score,
            reason = %reason,
            "Verdict decided"
        );

        ValidationVerdict::new(payment_submission_id, status, score, reason)
    }

    fn evaluate(&self, inputs: &DecisionInputs<'_>, score: f32) -> (ValidationStatus, String) {
        let classification = inputs.classification;

        if classification.document_type == DocumentType::NonPaymentDocument
            && classification.confidence_score >= self.policy.non_payment_reject_confidence
        {
            return (
                ValidationStatus::Rejected,
                format!(
                    "classification={}, confidence {:.0} → rejected",
                    classification.document_type.short_label(),
                    classification.confidence_score
                ),
            );
        }

        if inputs.ocr.both_failed() && !inputs.ocr.any_engine_errored() && inputs.fields.is_empty() {
            return (
                ValidationStatus::Rejected,
                "no text recognized by either OCR engine and no fields extracted → rejected"
                    .to_string(),
            );
        }

        let mut triggers = self.review_triggers(inputs);
        if score < self.policy.auto_approve_score {
            triggers.push(format!(
                "confidence score {:.0} below {:.0}",
                score, self.policy.auto_approve_score
            ));
        }
        if !triggers.is_empty() {
            return (
                ValidationStatus::ManualReview,
                format!("{} → manual review", triggers.join("; ")),
            );
        }

        (
            ValidationStatus::AutoApproved,
            format!(
                "classification={}, confidence {:.0}; OCR confidence {:.0}; required fields present; score {:.0} → auto-approved",
                classification.document_type.short_label(),
                classification.confidence_score,
                inputs.ocr.winner_confidence(),
                score
            ),
        )
    }

    /// Every reason the submission needs a human, strongest first
    fn review_triggers(&self, inputs: &DecisionInputs<'_>) -> Vec<String> {
        let DecisionInputs {
            ocr,
            fields,
            classification,
            image,
        } = *inputs;
        let mut triggers = Vec::new();

        if image.duplicate_detected {
            let n = image.duplicate_matches.len();
            triggers.push(format!(
                "duplicate match with {} prior {}",
                n,
                if n == 1 { "submission" } else { "submissions" }
            ));
        }

        match fields.status_keyword {
            Some(PaymentStatusKeyword::Failed) => {
                triggers.push("payment status reads failed".to_string())
            }
            Some(PaymentStatusKeyword::Pending) => {
                triggers.push("payment status reads pending".to_string())
            }
            _ => {}
        }

        if ocr.both_failed() && ocr.any_engine_errored() {
            let errors: Vec<String> = ocr
                .results()
                .iter()
                .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {}", r.engine_name, e)))
                .collect();
            triggers.push(format!("OCR unavailable ({})", errors.join(", ")));
        }

        if classification.is_fallback() {
            triggers.push("classification unavailable".to_string());
        } else if !classification.document_type.is_payment() {
            triggers.push(format!(
                "classification={}, confidence {:.0}",
                classification.document_type.short_label(),
                classification.confidence_score
            ));
        } else if classification.confidence_level != ConfidenceLevel::High
            || classification.confidence_score < self.policy.classification_high_confidence
        {
            triggers.push(format!(
                "classification={}, confidence {:.0} ({})",
                classification.document_type.short_label(),
                classification.confidence_score,
                classification.confidence_level.as_str()
            ));
        }

        let missing = missing_required_fields(fields);
        if !missing.is_empty() && !ocr.both_failed() {
            triggers.push(format!("partial extraction: missing {}", missing.join(", ")));
        }

        let ocr_confidence = ocr.winner_confidence();
        if !ocr.both_failed() && ocr_confidence < self.policy.ocr_high_confidence {
            triggers.push(format!(
                "OCR confidence {:.0} below {:.0}",
                ocr_confidence, self.policy.ocr_high_confidence
            ));
        }

        if !image.anomalies.is_empty() {
            triggers.push(format!("image anomalies: {}", image.anomalies.join(", ")));
        }

        triggers
    }
}

/// Required for approval: amount, date, and a reference or success keyword
fn missing_required_fields(fields: &ExtractedFields) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if !fields.has_amount {
        missing.push("amount");
    }
    if !fields.has_date {
        missing.push("date");
    }
    let success_keyword = fields.status_keyword == Some(PaymentStatusKeyword::Success);
    if !fields.has_transaction_ref && !success_keyword {
        missing.push("transaction reference");
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DuplicateMatch, OcrResult, RecognizedText};
    use chrono::{NaiveDate, Utc};

    fn ocr(text: &str, confidence: f32) -> OcrOutcome {
        OcrOutcome::new(
            OcrResult::succeeded(
                "primary",
                RecognizedText {
                    text: text.to_string(),
                    confidence,
                },
                100,
            ),
            None,
        )
    }

    fn complete_fields() -> ExtractedFields {
        ExtractedFields {
            amount: Some(5000.0),
            date: NaiveDate::from_ymd_opt(2024, 3, 12),
            transaction_ref: Some("412345678901".to_string()),
            platform: Some("Google Pay".to_string()),
            bank_name: None,
            status_keyword: Some(PaymentStatusKeyword::Success),
            has_amount: true,
            has_transaction_ref: true,
            has_date: true,
            has_status_keyword: true,
            has_payment_keyword: true,
            has_bank_name: false,
        }
    }

    fn clean_image() -> ImageSignal {
        ImageSignal {
            perceptual_hash: "00ff00ff00ff00ff".to_string(),
            duplicate_detected: false,
            similarity_percentage: None,
            duplicate_matches: Vec::new(),
            upload_count: 1,
            exif_available: false,
            exif_editor_detected: None,
            looks_like_screenshot: true,
            aspect_ratio: 2.0,
            resolution_w: 720,
            resolution_h: 1440,
            text_density_score: 8.0,
            anomalies: Vec::new(),
        }
    }

    fn upi_high() -> ClassificationResult {
        ClassificationResult::new(DocumentType::UpiConfirmation, 95.0, "UPI success screen".into())
    }

    fn decide(
        ocr: &OcrOutcome,
        fields: &ExtractedFields,
        classification: &ClassificationResult,
        image: &ImageSignal,
    ) -> ValidationVerdict {
        DecisionEngine::default().decide(
            Uuid::new_v4(),
            &DecisionInputs {
                ocr,
                fields,
                classification,
                image,
            },
        )
    }

    #[test]
    fn test_all_signals_clean_auto_approves() {
        let verdict = decide(&ocr("Paid ₹5,000", 92.0), &complete_fields(), &upi_high(), &clean_image());
        assert_eq!(verdict.status, ValidationStatus::AutoApproved);
        assert!(verdict.confidence_score >= 80.0, "{}", verdict.confidence_score);
        assert!(verdict.reason.contains("auto-approved"));
    }

    #[test]
    fn test_minimal_receipt_at_high_boundary_scores_above_threshold() {
        let fields = crate::extract::extract_fields("₹5,000\n12/03/2024\nUTR 412345678901\nsuccessful");
        assert!(fields.bank_name.is_none());
        assert!(!fields.has_payment_keyword);
        let classification =
            ClassificationResult::new(DocumentType::UpiConfirmation, 85.0, "UPI receipt".into());

        let verdict = decide(&ocr("₹5,000", 85.0), &fields, &classification, &clean_image());
        assert_eq!(verdict.status, ValidationStatus::AutoApproved, "{}", verdict.reason);
        assert!(verdict.confidence_score >= 80.0, "{}", verdict.confidence_score);
    }

    #[test]
    fn test_score_below_threshold_blocks_approval() {
        let engine = DecisionEngine::new(DecisionPolicy {
            auto_approve_score: 99.0,
            ..DecisionPolicy::default()
        });
        let outcome = ocr("Paid ₹5,000", 92.0);
        let fields = complete_fields();
        let classification = upi_high();
        let image = clean_image();
        let verdict = engine.decide(
            Uuid::new_v4(),
            &DecisionInputs {
                ocr: &outcome,
                fields: &fields,
                classification: &classification,
                image: &image,
            },
        );
        assert_eq!(verdict.status, ValidationStatus::ManualReview);
        assert!(verdict.reason.contains("below 99"), "{}", verdict.reason);
    }

    #[test]
    fn test_confident_non_payment_rejects() {
        let photo = ClassificationResult::new(DocumentType::NonPaymentDocument, 92.0, "beach".into());
        let verdict = decide(&ocr("Sunset", 70.0), &ExtractedFields::default(), &photo, &clean_image());
        assert_eq!(verdict.status, ValidationStatus::Rejected);
        assert_eq!(verdict.reason, "classification=non-payment, confidence 92 → rejected");
    }

    #[test]
    fn test_non_payment_rejects_even_with_duplicate() {
        let photo = ClassificationResult::new(DocumentType::NonPaymentDocument, 80.0, String::new());
        let mut image = clean_image();
        image.duplicate_detected = true;
        image.similarity_percentage = Some(100.0);
        let verdict = decide(&ocr("", 0.0), &ExtractedFields::default(), &photo, &image);
        assert_eq!(verdict.status, ValidationStatus::Rejected);
    }

    #[test]
    fn test_uncertain_non_payment_goes_to_review() {
        let photo = ClassificationResult::new(DocumentType::NonPaymentDocument, 79.0, String::new());
        let verdict = decide(&ocr("Paid", 90.0), &complete_fields(), &photo, &clean_image());
        assert_eq!(verdict.status, ValidationStatus::ManualReview);
    }

    #[test]
    fn test_clean_empty_ocr_is_total_failure() {
        let outcome = OcrOutcome::new(
            OcrResult::succeeded("primary", RecognizedText { text: String::new(), confidence: 0.0 }, 5),
            Some(OcrResult::succeeded("fallback", RecognizedText { text: " ".into(), confidence: 0.0 }, 5)),
        );
        let verdict = decide(
            &outcome,
            &ExtractedFields::default(),
            &ClassificationResult::fallback("no OCR text to classify"),
            &clean_image(),
        );
        assert_eq!(verdict.status, ValidationStatus::Rejected);
    }

    #[test]
    fn test_engine_errors_go_to_review_not_rejection() {
        let outcome = OcrOutcome::new(
            OcrResult::failed("primary", "timed out after 8000 ms", 8000),
            Some(OcrResult::failed("fallback", "tesseract not installed", 2)),
        );
        let verdict = decide(
            &outcome,
            &ExtractedFields::default(),
            &ClassificationResult::fallback("no OCR text to classify"),
            &clean_image(),
        );
        assert_eq!(verdict.status, ValidationStatus::ManualReview);
        assert!(verdict.reason.starts_with("OCR unavailable"));
        assert!(verdict.reason.contains("classification unavailable"));
    }

    #[test]
    fn test_duplicate_alone_reviews_with_reason_first() {
        let mut image = clean_image();
        image.duplicate_detected = true;
        image.similarity_percentage = Some(100.0);
        let prior = |id| DuplicateMatch {
            payment_submission_id: id,
            flat_id: Some("A-101".into()),
            collection_id: None,
            submission_status: None,
            similarity_percentage: 100.0,
            first_seen_at: Utc::now(),
        };
        image.duplicate_matches = vec![prior(Uuid::new_v4()), prior(Uuid::new_v4())];

        let verdict = decide(&ocr("Paid ₹5,000", 92.0), &complete_fields(), &upi_high(), &image);
        assert_eq!(verdict.status, ValidationStatus::ManualReview);
        assert_eq!(
            verdict.reason,
            "duplicate match with 2 prior submissions → manual review"
        );
    }

    #[test]
    fn test_medium_classification_and_partial_fields_review() {
        let mut fields = complete_fields();
        fields.transaction_ref = None;
        fields.has_transaction_ref = false;
        fields.status_keyword = None;
        fields.has_status_keyword = false;
        let medium = ClassificationResult::new(DocumentType::UpiConfirmation, 65.0, String::new());

        let verdict = decide(&ocr("Rs 500 12/03/2024", 61.0), &fields, &medium, &clean_image());
        assert_eq!(verdict.status, ValidationStatus::ManualReview);
        assert!(verdict.reason.contains("(Medium)"));
        assert!(verdict.reason.contains("missing transaction reference"));
        assert!(verdict.reason.contains("OCR confidence 61 below 80"));
    }

    #[test]
    fn test_anomalies_only_push_to_review() {
        let mut image = clean_image();
        image.anomalies = vec!["edited with GIMP 2.10".into(), "no EXIF metadata".into()];
        let verdict = decide(&ocr("Paid ₹5,000", 92.0), &complete_fields(), &upi_high(), &image);
        assert_eq!(verdict.status, ValidationStatus::ManualReview);
        assert!(verdict.reason.contains("edited with GIMP"));
    }

    #[test]
    fn test_failed_status_keyword_reviews() {
        let mut fields = complete_fields();
        fields.status_keyword = Some(PaymentStatusKeyword::Failed);
        let verdict = decide(&ocr("Payment failed", 92.0), &fields, &upi_high(), &clean_image());
        assert_eq!(verdict.status, ValidationStatus::ManualReview);
        assert!(verdict.reason.contains("status reads failed"));
    }

    #[test]
    fn test_score_stays_in_range() {
        let engine = DecisionEngine::new(DecisionPolicy {
            ocr_weight: 1.0,
            fields_weight: 0.0,
            classification_weight: 0.0,
            ..DecisionPolicy::default()
        });
        let outcome = ocr("x", 100.0);
        let fields = complete_fields();
        let classification = upi_high();
        let image = clean_image();
        let score = engine.score(&DecisionInputs {
            ocr: &outcome,
            fields: &fields,
            classification: &classification,
            image: &image,
        });
        assert!((0.0..=100.0).contains(&score));
        assert_eq!(score, 100.0);
    }

    #[test]
    fn test_policy_validation() {
        assert!(DecisionPolicy::default().validate().is_ok());

        let unbalanced = DecisionPolicy {
            ocr_weight: 0.9,
            ..DecisionPolicy::default()
        };
        assert!(unbalanced.validate().is_err());

        let bad_threshold = DecisionPolicy {
            ocr_high_confidence: 120.0,
            ..DecisionPolicy::default()
        };
        assert!(bad_threshold.validate().is_err());
    }
}
