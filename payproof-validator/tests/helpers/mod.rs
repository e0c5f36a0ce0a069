//! Shared fakes and fixtures for payproof-validator integration tests
//!
//! Scripted OCR engines, a fixed classifier and an in-memory image store stand
//! in for the external collaborators, so every pipeline run is deterministic.

#![allow(dead_code)]

use async_trait::async_trait;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use payproof_common::events::EventBus;
use payproof_validator::classify::{
    ClassificationError, ClassificationService, DocumentClassifier, RawClassification,
};
use payproof_validator::ocr::OcrOrchestrator;
use payproof_validator::storage::{FetchError, ImageFetcher};
use payproof_validator::types::{ExtractionError, OcrEngine, ProofImage, RecognizedText};
use payproof_validator::ValidationPipeline;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Primary OCR time limit used by the test pipelines
pub const PRIMARY_TIMEOUT: Duration = Duration::from_millis(200);
pub const FALLBACK_TIMEOUT: Duration = Duration::from_secs(2);

pub const UPI_RECEIPT_TEXT: &str = "Google Pay\n\
    Payment successful\n\
    ₹5,000\n\
    Paid to Green Park Society\n\
    12 Mar 2024, 10:42 am\n\
    UPI transaction ID: 412345678901";

pub const SOCIETY_NOTICE_TEXT: &str = "Green Park Society\n\
    Notice of Annual General Meeting\n\
    Agenda: election of committee members, lift renovation, garden upkeep\n\
    Venue: clubhouse, Sunday 10 am";

// ============================================================================
// OCR
// ============================================================================

/// OCR engine returning a canned response after an optional delay
pub struct ScriptedEngine {
    name: &'static str,
    delay: Duration,
    response: Result<RecognizedText, String>,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn text(name: &'static str, text: &str, confidence: f32) -> Arc<Self> {
        Self::build(
            name,
            Duration::ZERO,
            Ok(RecognizedText {
                text: text.to_string(),
                confidence,
            }),
        )
    }

    pub fn failing(name: &'static str, error: &str) -> Arc<Self> {
        Self::build(name, Duration::ZERO, Err(error.to_string()))
    }

    /// Answers only after `delay`, long past any test timeout
    pub fn hanging(name: &'static str, delay: Duration) -> Arc<Self> {
        Self::build(
            name,
            delay,
            Ok(RecognizedText {
                text: "too late".to_string(),
                confidence: 99.0,
            }),
        )
    }

    fn build(
        name: &'static str,
        delay: Duration,
        response: Result<RecognizedText, String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            delay,
            response,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn recognize(&self, _image: &ProofImage) -> Result<RecognizedText, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.response.clone().map_err(ExtractionError::Api)
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Classifier answering every request the same way
pub struct FixedClassifier {
    response: Result<RawClassification, String>,
}

impl FixedClassifier {
    pub fn label(document_type: &str, confidence_score: f32) -> Arc<Self> {
        Arc::new(Self {
            response: Ok(RawClassification {
                document_type: document_type.to_string(),
                confidence_score,
                reasoning: format!("looks like {}", document_type),
            }),
        })
    }

    pub fn unavailable(error: &str) -> Arc<Self> {
        Arc::new(Self {
            response: Err(error.to_string()),
        })
    }
}

#[async_trait]
impl DocumentClassifier for FixedClassifier {
    async fn classify(&self, _text: &str) -> Result<RawClassification, ClassificationError> {
        self.response
            .clone()
            .map_err(ClassificationError::Network)
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Image store keyed by URL; unknown URLs answer 404
#[derive(Default)]
pub struct MemoryFetcher {
    images: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, url: &str, bytes: Vec<u8>) {
        self.images
            .lock()
            .unwrap()
            .insert(url.to_string(), bytes);
    }
}

#[async_trait]
impl ImageFetcher for MemoryFetcher {
    async fn fetch(&self, url: &str, file_type: &str) -> Result<ProofImage, FetchError> {
        let bytes = self.images.lock().unwrap().get(url).cloned();
        match bytes {
            Some(bytes) => Ok(ProofImage::new(bytes, file_type)),
            None => Err(FetchError::Status(404)),
        }
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Portrait PNG that passes every heuristic: 720x1440, dark glyph rows on a
/// light background
///
/// `variant` shifts a soft background gradient so different variants have
/// unrelated perceptual hashes while the glyph rows stay identical.
pub fn receipt_png(variant: u32) -> Vec<u8> {
    let (width, height) = (720u32, 1440u32);
    let shift = f64::from(variant) * 1.3;
    let img = GrayImage::from_fn(width, height, |x, y| {
        let on_text_line = y % 40 < 16;
        let glyph = (x / 12) % 2 == 0;
        if on_text_line && glyph {
            return Luma([20u8]);
        }
        let phase = 3.0 * std::f64::consts::PI * f64::from(x) / f64::from(width)
            + 2.0 * std::f64::consts::PI * f64::from(y) / f64::from(height)
            + shift;
        Luma([(200.0 + 40.0 * phase.sin()) as u8])
    });

    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct TestPipeline {
    pub pipeline: ValidationPipeline,
    pub pool: SqlitePool,
    pub fetcher: Arc<MemoryFetcher>,
    pub event_bus: EventBus,
}

/// Pipeline over an in-memory database with the given collaborators
pub async fn build_pipeline(
    primary: Arc<dyn OcrEngine>,
    fallback: Arc<dyn OcrEngine>,
    classifier: Arc<FixedClassifier>,
) -> TestPipeline {
    let pool = payproof_validator::db::init_memory_pool().await.unwrap();
    let fetcher = MemoryFetcher::new();
    let event_bus = EventBus::new(32);

    let ocr = OcrOrchestrator::new(primary, fallback, PRIMARY_TIMEOUT, FALLBACK_TIMEOUT);
    let pipeline = ValidationPipeline::new(
        pool.clone(),
        fetcher.clone(),
        ocr,
        ClassificationService::new(classifier),
        event_bus.clone(),
    );

    TestPipeline {
        pipeline,
        pool,
        fetcher,
        event_bus,
    }
}

/// Register a submission row as the submissions service would
pub async fn insert_submission(pool: &SqlitePool, id: Uuid, flat_id: &str, collection_id: &str) {
    sqlx::query(
        "INSERT INTO payment_submissions (id, flat_id, collection_id, status, created_at) \
         VALUES (?, ?, ?, 'submitted', datetime('now'))",
    )
    .bind(id.to_string())
    .bind(flat_id)
    .bind(collection_id)
    .execute(pool)
    .await
    .unwrap();
}
