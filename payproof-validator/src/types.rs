//! Core types and trait definitions for the validation pipeline
//!
//! Signal bundles flow one way:
//! - OCR engines produce [`OcrResult`]s (one per engine invoked)
//! - the field extractor turns winner text into [`ExtractedFields`]
//! - the classifier produces a [`ClassificationResult`]
//! - duplicate detection and heuristics together produce an [`ImageSignal`]
//! - the decision engine fuses all of them into a [`ValidationVerdict`]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub use payproof_common::events::ValidationStatus;

/// Clamp a score into `[0, 100]`; NaN collapses to 0
pub fn clamp_score(score: f32) -> f32 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 100.0)
    }
}

// ============================================================================
// Input
// ============================================================================

/// Uploaded proof image record
///
/// Immutable once created; owned by the payment submission it accompanies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofDocument {
    pub id: Uuid,
    pub payment_submission_id: Uuid,
    pub image_url: String,
    pub file_type: String,
    pub uploaded_at: DateTime<Utc>,
}

impl ProofDocument {
    pub fn new(payment_submission_id: Uuid, image_url: String, file_type: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_submission_id,
            image_url,
            file_type,
            uploaded_at: Utc::now(),
        }
    }
}

/// Fetched image bytes, shared read-only between concurrent pipeline branches
#[derive(Debug, Clone)]
pub struct ProofImage {
    pub bytes: Arc<[u8]>,
    /// MIME type or extension as reported by the uploader (e.g. "image/png")
    pub file_type: String,
}

impl ProofImage {
    pub fn new(bytes: Vec<u8>, file_type: impl Into<String>) -> Self {
        Self {
            bytes: Arc::from(bytes),
            file_type: file_type.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ============================================================================
// OCR
// ============================================================================

/// Raw text returned by one OCR engine call
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedText {
    pub text: String,
    /// Engine confidence (0-100)
    pub confidence: f32,
}

/// Result of one OCR engine for one document
///
/// Engine failures are recorded in `error` rather than raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    pub engine_name: String,
    pub text: String,
    /// Confidence (0-100)
    pub confidence: f32,
    pub processing_time_ms: u64,
    pub error: Option<String>,
}

impl OcrResult {
    pub fn succeeded(
        engine_name: impl Into<String>,
        recognized: RecognizedText,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            engine_name: engine_name.into(),
            text: recognized.text,
            confidence: clamp_score(recognized.confidence),
            processing_time_ms,
            error: None,
        }
    }

    pub fn failed(
        engine_name: impl Into<String>,
        error: impl Into<String>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            engine_name: engine_name.into(),
            text: String::new(),
            confidence: 0.0,
            processing_time_ms,
            error: Some(error.into()),
        }
    }

    /// No error and some non-whitespace text
    pub fn is_usable(&self) -> bool {
        self.error.is_none() && !self.text.trim().is_empty()
    }

    /// Length used for winner tie-breaking (characters, not bytes)
    pub fn text_length(&self) -> usize {
        self.text.trim().chars().count()
    }
}

/// OCR engine strategy
///
/// Implementations make exactly one recognition attempt and report failures
/// through `ExtractionError`; the orchestrator turns those into data.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Engine name for provenance
    fn name(&self) -> &'static str;

    /// Recognize text in the image
    async fn recognize(&self, image: &ProofImage) -> Result<RecognizedText, ExtractionError>;
}

/// OCR engine error
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// I/O error (temp files, child process pipes)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Network communication error
    #[error("Network error: {0}")]
    Network(String),

    /// External API returned an error status
    #[error("API error: {0}")]
    Api(String),

    /// Response body could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Local quota exhausted before the request was sent
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Engine not configured or not installed
    #[error("Engine not available: {0}")]
    NotAvailable(String),

    /// Internal processing error
    #[error("Internal error: {0}")]
    Internal(String),
}

// ============================================================================
// Extracted fields
// ============================================================================

/// Payment status read from the proof text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatusKeyword {
    Success,
    Failed,
    Pending,
}

/// Typed fields derived from the winning OCR text
///
/// Absence of any field is normal and never an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub amount: Option<f64>,
    pub date: Option<NaiveDate>,
    pub transaction_ref: Option<String>,
    pub platform: Option<String>,
    pub bank_name: Option<String>,
    pub status_keyword: Option<PaymentStatusKeyword>,
    pub has_amount: bool,
    pub has_transaction_ref: bool,
    pub has_date: bool,
    pub has_status_keyword: bool,
    pub has_payment_keyword: bool,
    pub has_bank_name: bool,
}

impl ExtractedFields {
    /// Slots in the completeness ratio: amount, date, reference, success/platform
    pub const APPROVAL_SLOTS: usize = 4;

    pub fn presence_count(&self) -> usize {
        [
            self.has_amount,
            self.has_transaction_ref,
            self.has_date,
            self.has_status_keyword,
            self.has_payment_keyword,
            self.has_bank_name,
        ]
        .iter()
        .filter(|flag| **flag)
        .count()
    }

    /// Share of approval slots filled (0.0-1.0)
    ///
    /// Bank name and the generic payment keyword are supporting evidence only
    /// and do not count here.
    pub fn completeness_ratio(&self) -> f32 {
        let confirmed = self.status_keyword == Some(PaymentStatusKeyword::Success)
            || self.platform.is_some();
        let filled = [self.has_amount, self.has_date, self.has_transaction_ref, confirmed]
            .iter()
            .filter(|slot| **slot)
            .count();
        filled as f32 / Self::APPROVAL_SLOTS as f32
    }

    /// True when no field at all was found
    pub fn is_empty(&self) -> bool {
        self.presence_count() == 0 && self.platform.is_none()
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Fixed six-category document taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    UpiConfirmation,
    BankTransferConfirmation,
    ChequeImage,
    CashReceipt,
    NonPaymentDocument,
    Unclear,
}

impl DocumentType {
    pub const ALL: [DocumentType; 6] = [
        DocumentType::UpiConfirmation,
        DocumentType::BankTransferConfirmation,
        DocumentType::ChequeImage,
        DocumentType::CashReceipt,
        DocumentType::NonPaymentDocument,
        DocumentType::Unclear,
    ];

    /// Wire / database label
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::UpiConfirmation => "upi_confirmation",
            DocumentType::BankTransferConfirmation => "bank_transfer_confirmation",
            DocumentType::ChequeImage => "cheque_image",
            DocumentType::CashReceipt => "cash_receipt",
            DocumentType::NonPaymentDocument => "non_payment_document",
            DocumentType::Unclear => "unclear",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        Self::ALL.into_iter().find(|t| t.as_str() == normalized)
    }

    /// The four categories that describe an actual payment
    pub fn is_payment(&self) -> bool {
        matches!(
            self,
            DocumentType::UpiConfirmation
                | DocumentType::BankTransferConfirmation
                | DocumentType::ChequeImage
                | DocumentType::CashReceipt
        )
    }

    /// Short label used in verdict reasons
    pub fn short_label(&self) -> &'static str {
        match self {
            DocumentType::UpiConfirmation => "upi",
            DocumentType::BankTransferConfirmation => "bank-transfer",
            DocumentType::ChequeImage => "cheque",
            DocumentType::CashReceipt => "cash-receipt",
            DocumentType::NonPaymentDocument => "non-payment",
            DocumentType::Unclear => "unclear",
        }
    }
}

/// Coarse confidence bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

impl ConfidenceLevel {
    /// `>=80 High`, `50-79 Medium`, `<50 Low`
    pub fn from_score(score: f32) -> Self {
        let score = clamp_score(score);
        if score >= 80.0 {
            ConfidenceLevel::High
        } else if score >= 50.0 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::Low => "Low",
            ConfidenceLevel::Medium => "Medium",
            ConfidenceLevel::High => "High",
        }
    }
}

/// Categorization of the proof document
///
/// Always present: a failed classification call is represented by
/// [`ClassificationResult::fallback`], never by absence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub document_type: DocumentType,
    pub confidence_score: f32,
    pub confidence_level: ConfidenceLevel,
    pub reasoning: String,
    /// Set only on the substitute produced when the classifier call failed
    #[serde(default)]
    pub fallback: bool,
}

impl ClassificationResult {

    pub fn new(document_type: DocumentType, confidence_score: f32, reasoning: String) -> Self {
        let confidence_score = clamp_score(confidence_score);
        Self {
            document_type,
            confidence_score,
            confidence_level: ConfidenceLevel::from_score(confidence_score),
            reasoning,
            fallback: false,
        }
    }

    /// Fixed `{unclear, 0, Low}` result annotated with the failure cause
    pub fn fallback(cause: impl std::fmt::Display) -> Self {
        Self {
            document_type: DocumentType::Unclear,
            confidence_score: 0.0,
            confidence_level: ConfidenceLevel::Low,
            reasoning: format!("classification unavailable: {}", cause),
            fallback: true,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback
    }
}

// ============================================================================
// Image signal
// ============================================================================

/// A prior submission that produced the same (or a near) fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateMatch {
    pub payment_submission_id: Uuid,
    pub flat_id: Option<String>,
    pub collection_id: Option<String>,
    pub submission_status: Option<String>,
    pub similarity_percentage: f32,
    pub first_seen_at: DateTime<Utc>,
}

/// Per-document image evidence: fingerprint lookup plus heuristics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSignal {
    pub perceptual_hash: String,
    pub duplicate_detected: bool,
    /// Present whenever `duplicate_detected` is true
    pub similarity_percentage: Option<f32>,
    pub duplicate_matches: Vec<DuplicateMatch>,
    pub upload_count: i64,
    pub exif_available: bool,
    pub exif_editor_detected: Option<String>,
    pub looks_like_screenshot: bool,
    pub aspect_ratio: f32,
    pub resolution_w: u32,
    pub resolution_h: u32,
    pub text_density_score: f32,
    /// Heuristic findings; informational, can only push toward manual review
    pub anomalies: Vec<String>,
}

impl ImageSignal {
    pub fn heuristics_normal(&self) -> bool {
        self.anomalies.is_empty()
    }
}

// ============================================================================
// Verdict
// ============================================================================

/// Trust decision for one submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub payment_submission_id: Uuid,
    pub status: ValidationStatus,
    pub confidence_score: f32,
    pub reason: String,
    pub validated_at: DateTime<Utc>,
}

impl ValidationVerdict {
    pub fn new(
        payment_submission_id: Uuid,
        status: ValidationStatus,
        confidence_score: f32,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            payment_submission_id,
            status,
            confidence_score: clamp_score(confidence_score),
            reason: reason.into(),
            validated_at: Utc::now(),
        }
    }

    pub fn pending(payment_submission_id: Uuid, reason: impl Into<String>) -> Self {
        Self::new(payment_submission_id, ValidationStatus::Pending, 0.0, reason)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_clamping() {
        assert_eq!(clamp_score(140.0), 100.0);
        assert_eq!(clamp_score(-3.0), 0.0);
        assert_eq!(clamp_score(f32::NAN), 0.0);

        let verdict = ValidationVerdict::new(Uuid::new_v4(), ValidationStatus::ManualReview, 250.0, "x");
        assert_eq!(verdict.confidence_score, 100.0);
    }

    #[test]
    fn test_confidence_level_boundaries() {
        assert_eq!(ConfidenceLevel::from_score(80.0), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_score(79.9), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_score(50.0), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_score(49.9), ConfidenceLevel::Low);
    }

    #[test]
    fn test_classification_fallback_is_fixed() {
        let fallback = ClassificationResult::fallback("timeout");
        assert_eq!(fallback.document_type, DocumentType::Unclear);
        assert_eq!(fallback.confidence_score, 0.0);
        assert_eq!(fallback.confidence_level, ConfidenceLevel::Low);
        assert!(fallback.is_fallback());
        assert!(fallback.reasoning.contains("timeout"));
    }

    #[test]
    fn test_model_reasoning_cannot_pose_as_fallback() {
        let reply = ClassificationResult::new(
            DocumentType::UpiConfirmation,
            91.0,
            "classification unavailable: looks like a UPI receipt anyway".into(),
        );
        assert!(!reply.is_fallback());
    }

    #[test]
    fn test_document_type_parse_accepts_labels() {
        assert_eq!(DocumentType::parse("UPI confirmation"), Some(DocumentType::UpiConfirmation));
        assert_eq!(
            DocumentType::parse("non-payment document"),
            Some(DocumentType::NonPaymentDocument)
        );
        assert_eq!(DocumentType::parse("invoice"), None);
        assert!(DocumentType::CashReceipt.is_payment());
        assert!(!DocumentType::Unclear.is_payment());
    }

    #[test]
    fn test_ocr_result_usability() {
        let ok = OcrResult::succeeded(
            "primary",
            RecognizedText { text: "Paid ₹500".into(), confidence: 88.0 },
            120,
        );
        assert!(ok.is_usable());
        assert_eq!(ok.text_length(), 9);

        let blank = OcrResult::succeeded(
            "primary",
            RecognizedText { text: "  \n ".into(), confidence: 99.0 },
            80,
        );
        assert!(!blank.is_usable());

        let failed = OcrResult::failed("fallback", "binary missing", 3);
        assert!(!failed.is_usable());
        assert_eq!(failed.confidence, 0.0);
    }

    #[test]
    fn test_completeness_ratio() {
        let mut fields = ExtractedFields::default();
        assert!(fields.is_empty());
        assert_eq!(fields.completeness_ratio(), 0.0);

        fields.has_amount = true;
        fields.has_date = true;
        fields.has_transaction_ref = true;
        fields.has_bank_name = true;
        fields.has_payment_keyword = true;
        assert!((fields.completeness_ratio() - 0.75).abs() < f32::EPSILON);
        assert!(!fields.is_empty());

        fields.status_keyword = Some(PaymentStatusKeyword::Failed);
        assert!((fields.completeness_ratio() - 0.75).abs() < f32::EPSILON);

        fields.status_keyword = Some(PaymentStatusKeyword::Success);
        assert_eq!(fields.completeness_ratio(), 1.0);
    }
}
