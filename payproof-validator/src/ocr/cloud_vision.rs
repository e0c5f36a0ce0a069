//! Primary OCR engine: Google Cloud Vision document text detection
//!
//! Authenticated, paid and rate-limited. The local quota is checked before the
//! request is sent; an exhausted quota fails fast so the orchestrator can move on
//! to the fallback instead of queueing.
//!
//! # API Reference
//! - Endpoint: https://vision.googleapis.com/v1/images:annotate
//! - Feature: DOCUMENT_TEXT_DETECTION

use crate::types::{ExtractionError, OcrEngine, ProofImage, RecognizedText};
use async_trait::async_trait;
use base64::Engine as _;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct AnnotateBatchResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    full_text_annotation: Option<TextAnnotation>,
    error: Option<RpcStatus>,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    text: String,
    #[serde(default)]
    pages: Vec<Page>,
}

#[derive(Debug, Deserialize)]
struct Page {
    confidence: Option<f32>,
    #[serde(default)]
    blocks: Vec<Block>,
}

#[derive(Debug, Deserialize)]
struct Block {
    confidence: Option<f32>,
    #[serde(default)]
    paragraphs: Vec<Paragraph>,
}

#[derive(Debug, Deserialize)]
struct Paragraph {
    #[serde(default)]
    words: Vec<Word>,
}

#[derive(Debug, Deserialize)]
struct Word {
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct RpcStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

/// API key travels in a header, never in the request URL
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Cloud Vision OCR client
pub struct CloudVisionEngine {
    http_client: Client,
    endpoint: String,
    api_key: Option<String>,
    /// `None` means unlimited
    rate_limiter: Option<DefaultDirectRateLimiter>,
}

impl CloudVisionEngine {
    /// Create client
    ///
    /// `requests_per_minute == 0` disables the local quota.
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        requests_per_minute: u32,
        timeout: Duration,
    ) -> Result<Self, ExtractionError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExtractionError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        let rate_limiter =
            NonZeroU32::new(requests_per_minute).map(|n| RateLimiter::direct(Quota::per_minute(n)));

        Ok(Self {
            http_client,
            endpoint,
            api_key,
            rate_limiter,
        })
    }
}

#[async_trait]
impl OcrEngine for CloudVisionEngine {
    fn name(&self) -> &'static str {
        "cloud_vision"
    }

    async fn recognize(&self, image: &ProofImage) -> Result<RecognizedText, ExtractionError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(ExtractionError::NotAvailable(
                "OCR API key not configured".to_string(),
            ));
        };

        if let Some(limiter) = &self.rate_limiter {
            if limiter.check().is_err() {
                return Err(ExtractionError::RateLimited(
                    "primary OCR quota exhausted".to_string(),
                ));
            }
        }

        let content = base64::engine::general_purpose::STANDARD.encode(&image.bytes);
        let body = json!({
            "requests": [{
                "image": { "content": content },
                "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }]
            }]
        });

        debug!(bytes = image.len(), "Calling Cloud Vision");

        let response = self
            .http_client
            .post(&self.endpoint)
            .header(API_KEY_HEADER, api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ExtractionError::Network(format!("Cloud Vision request failed: {}", e.without_url()))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Api(format!(
                "Cloud Vision returned {}: {}",
                status, body
            )));
        }

        let parsed: AnnotateBatchResponse = response.json().await.map_err(|e| {
            ExtractionError::Parse(format!(
                "Failed to parse Cloud Vision response: {}",
                e.without_url()
            ))
        })?;

        recognized_from_response(parsed)
    }
}

/// Convert the batch response for our single request
///
/// No `fullTextAnnotation` means the image has no text, which is an empty
/// result rather than an error.
fn recognized_from_response(
    response: AnnotateBatchResponse,
) -> Result<RecognizedText, ExtractionError> {
    let Some(first) = response.responses.into_iter().next() else {
        return Err(ExtractionError::Parse(
            "Cloud Vision response has no entries".to_string(),
        ));
    };

    if let Some(status) = first.error {
        return Err(ExtractionError::Api(format!(
            "Cloud Vision error {}: {}",
            status.code, status.message
        )));
    }

    let Some(annotation) = first.full_text_annotation else {
        return Ok(RecognizedText {
            text: String::new(),
            confidence: 0.0,
        });
    };

    Ok(RecognizedText {
        confidence: annotation_confidence(&annotation.pages),
        text: annotation.text,
    })
}

/// Mean confidence (0-100) at the coarsest level the response carries
///
/// Pages first, then blocks, then words.
fn annotation_confidence(pages: &[Page]) -> f32 {
    let page_level: Vec<f32> = pages.iter().filter_map(|p| p.confidence).collect();
    if !page_level.is_empty() {
        return mean_percent(&page_level);
    }

    let blocks = || pages.iter().flat_map(|p| p.blocks.iter());
    let block_level: Vec<f32> = blocks().filter_map(|b| b.confidence).collect();
    if !block_level.is_empty() {
        return mean_percent(&block_level);
    }

    let word_level: Vec<f32> = blocks()
        .flat_map(|b| b.paragraphs.iter())
        .flat_map(|p| p.words.iter())
        .filter_map(|w| w.confidence)
        .collect();
    mean_percent(&word_level)
}

fn mean_percent(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32 * 100.0
}
