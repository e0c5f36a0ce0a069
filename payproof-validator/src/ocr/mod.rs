//! OCR extraction orchestrator
//!
//! Runs the primary (paid, rate-limited) engine first and the local fallback when
//! the primary times out, errors, or returns no text. Winner selection is a pure
//! function so it can be tested without any engine.
//!
//! Engine failures never escape this module: they are recorded in
//! [`OcrResult::error`].

pub mod cloud_vision;
pub mod tesseract;

pub use cloud_vision::CloudVisionEngine;
pub use tesseract::TesseractEngine;

use crate::types::{OcrEngine, OcrResult, ProofImage};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Which engine slot produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineSlot {
    Primary,
    Fallback,
}

/// Pick the winning OCR result
///
/// A result is a candidate only if it has no error and non-blank text.
/// Candidates compare by `(confidence, text_length)`; the primary wins exact ties.
/// `None` means both engines failed.
pub fn select_winner(primary: &OcrResult, fallback: Option<&OcrResult>) -> Option<EngineSlot> {
    let fallback = fallback.filter(|f| f.is_usable());

    match (primary.is_usable(), fallback) {
        (false, None) => None,
        (true, None) => Some(EngineSlot::Primary),
        (false, Some(_)) => Some(EngineSlot::Fallback),
        (true, Some(fb)) => {
            let ordering = primary
                .confidence
                .total_cmp(&fb.confidence)
                .then_with(|| primary.text_length().cmp(&fb.text_length()));
            if ordering == Ordering::Less {
                Some(EngineSlot::Fallback)
            } else {
                Some(EngineSlot::Primary)
            }
        }
    }
}

/// Both raw engine results plus the chosen winner
#[derive(Debug, Clone)]
pub struct OcrOutcome {
    pub primary: OcrResult,
    /// `None` when the primary succeeded and cross-checking is off
    pub fallback: Option<OcrResult>,
    pub winner: Option<EngineSlot>,
}

impl OcrOutcome {
    pub fn new(primary: OcrResult, fallback: Option<OcrResult>) -> Self {
        let winner = select_winner(&primary, fallback.as_ref());
        Self {
            primary,
            fallback,
            winner,
        }
    }

    /// No engine produced usable text
    pub fn both_failed(&self) -> bool {
        self.winner.is_none()
    }

    pub fn winner_result(&self) -> Option<&OcrResult> {
        match self.winner? {
            EngineSlot::Primary => Some(&self.primary),
            EngineSlot::Fallback => self.fallback.as_ref(),
        }
    }

    /// The non-winning result, if it has usable text
    pub fn runner_up(&self) -> Option<&OcrResult> {
        let other = match self.winner? {
            EngineSlot::Primary => self.fallback.as_ref(),
            EngineSlot::Fallback => Some(&self.primary),
        };
        other.filter(|r| r.is_usable())
    }

    pub fn winner_text(&self) -> &str {
        self.winner_result().map(|r| r.text.as_str()).unwrap_or("")
    }

    pub fn winner_confidence(&self) -> f32 {
        self.winner_result().map(|r| r.confidence).unwrap_or(0.0)
    }

    /// At least one invoked engine reported an error (timeout, network, API...)
    pub fn any_engine_errored(&self) -> bool {
        self.primary.error.is_some()
            || self.fallback.as_ref().is_some_and(|f| f.error.is_some())
    }

    /// Every raw result, primary first
    pub fn results(&self) -> Vec<&OcrResult> {
        std::iter::once(&self.primary)
            .chain(self.fallback.as_ref())
            .collect()
    }
}

/// Primary-then-fallback OCR runner
pub struct OcrOrchestrator {
    primary: Arc<dyn OcrEngine>,
    fallback: Arc<dyn OcrEngine>,
    primary_timeout: Duration,
    fallback_timeout: Duration,
    cross_check: bool,
}

impl OcrOrchestrator {
    pub fn new(
        primary: Arc<dyn OcrEngine>,
        fallback: Arc<dyn OcrEngine>,
        primary_timeout: Duration,
        fallback_timeout: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            primary_timeout,
            fallback_timeout,
            cross_check: false,
        }
    }

    /// Also run the fallback when the primary already succeeded
    pub fn with_cross_check(mut self, cross_check: bool) -> Self {
        self.cross_check = cross_check;
        self
    }

    /// Run OCR for one image
    pub async fn run(&self, image: &ProofImage) -> OcrOutcome {
        let primary = run_engine(Arc::clone(&self.primary), image, self.primary_timeout).await;

        let fallback = if primary.is_usable() && !self.cross_check {
            debug!(engine = %primary.engine_name, "Primary OCR usable, fallback skipped");
            None
        } else {
            if !primary.is_usable() {
                warn!(
                    engine = %primary.engine_name,
                    error = primary.error.as_deref().unwrap_or("empty text"),
                    "Primary OCR unusable, running fallback"
                );
            }
            Some(run_engine(Arc::clone(&self.fallback), image, self.fallback_timeout).await)
        };

        let outcome = OcrOutcome::new(primary, fallback);
        debug!(
            winner = ?outcome.winner,
            winner_confidence = outcome.winner_confidence(),
            "OCR winner selected"
        );
        outcome
    }
}

/// Run one engine in its own task, bounded by `limit`
///
/// On timeout the task is left to finish on its own and its result is dropped.
async fn run_engine(engine: Arc<dyn OcrEngine>, image: &ProofImage, limit: Duration) -> OcrResult {
    let name = engine.name();
    let started = Instant::now();
    let image = image.clone();
    let task = tokio::spawn(async move { engine.recognize(&image).await });

    let result = tokio::time::timeout(limit, task).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(Ok(recognized))) => {
            debug!(engine = name, elapsed_ms, chars = recognized.text.len(), "OCR engine finished");
            OcrResult::succeeded(name, recognized, elapsed_ms)
        }
        Ok(Ok(Err(e))) => {
            warn!(engine = name, elapsed_ms, error = %e, "OCR engine failed");
            OcrResult::failed(name, e.to_string(), elapsed_ms)
        }
        Ok(Err(join_err)) => {
            warn!(engine = name, error = %join_err, "OCR engine task aborted");
            OcrResult::failed(name, format!("engine task aborted: {}", join_err), elapsed_ms)
        }
        Err(_) => {
            warn!(engine = name, timeout_ms = limit.as_millis() as u64, "OCR engine timed out");
            OcrResult::failed(
                name,
                format!("timed out after {} ms", limit.as_millis()),
                elapsed_ms,
            )
        }
    }
}
