//! Document classification client
//!
//! Sends OCR text to an OpenAI-compatible chat completions endpoint and asks for
//! one of the six document categories. Output is pinned with temperature 0 and a
//! JSON schema so re-validation sees the same label.
//!
//! [`ClassificationService`] is total: whatever goes wrong, callers get a
//! [`ClassificationResult`] (the fixed fallback on failure). No retries.

use crate::types::{ClassificationResult, DocumentType};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// OCR text beyond this many characters is not sent
const MAX_PROMPT_CHARS: usize = 4_000;

const SYSTEM_PROMPT: &str = "You classify OCR text extracted from images uploaded as proof of a \
housing-society maintenance payment. Pick exactly one document_type: upi_confirmation (UPI app \
success screen), bank_transfer_confirmation (NEFT/IMPS/RTGS or net-banking receipt), cheque_image, \
cash_receipt, non_payment_document (anything that is not a payment proof), or unclear. \
Give confidence_score from 0 to 100 and a one-sentence reasoning.";

/// Classification client errors
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("classifier API key not configured")]
    NotConfigured,

    #[error("no OCR text to classify")]
    EmptyText,

    #[error("network error: {0}")]
    Network(String),

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("malformed response: {0}")]
    Parse(String),

    #[error("unknown document type label: {0}")]
    UnknownLabel(String),
}

/// Classifier output before label validation and level mapping
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawClassification {
    pub document_type: String,
    pub confidence_score: f32,
    #[serde(default)]
    pub reasoning: String,
}

/// Document classification strategy
#[async_trait]
pub trait DocumentClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<RawClassification, ClassificationError>;
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: serde_json::Value,
    response_format: serde_json::Value,
}

/// Chat-completions classifier
pub struct LlmClassifier {
    http_client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl LlmClassifier {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        model: String,
        timeout: Duration,
    ) -> Result<Self, ClassificationError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClassificationError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            endpoint,
            api_key,
            model,
        })
    }

    fn request_body<'a>(&'a self, text: &str) -> ChatCompletionRequest<'a> {
        let labels: Vec<&str> = DocumentType::ALL.iter().map(|t| t.as_str()).collect();
        let excerpt: String = text.chars().take(MAX_PROMPT_CHARS).collect();

        ChatCompletionRequest {
            model: &self.model,
            temperature: 0.0,
            messages: json!([
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": excerpt }
            ]),
            response_format: json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "payment_proof_classification",
                    "strict": true,
                    "schema": {
                        "type": "object",
                        "properties": {
                            "document_type": { "type": "string", "enum": labels },
                            "confidence_score": { "type": "number", "minimum": 0, "maximum": 100 },
                            "reasoning": { "type": "string" }
                        },
                        "required": ["document_type", "confidence_score", "reasoning"],
                        "additionalProperties": false
                    }
                }
            }),
        }
    }
}

#[async_trait]
impl DocumentClassifier for LlmClassifier {
    async fn classify(&self, text: &str) -> Result<RawClassification, ClassificationError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ClassificationError::NotConfigured)?;

        debug!(model = %self.model, chars = text.len(), "Requesting document classification");

        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&self.request_body(text))
            .send()
            .await
            .map_err(|e| ClassificationError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassificationError::Api(status.as_u16(), body));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ClassificationError::Parse(e.to_string()))?;

        parse_completion(completion)
    }
}

fn parse_completion(
    completion: ChatCompletionResponse,
) -> Result<RawClassification, ClassificationError> {
    let content = completion
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| ClassificationError::Parse("no message content".to_string()))?;

    serde_json::from_str(&content).map_err(|e| ClassificationError::Parse(e.to_string()))
}

/// Total classification adapter
#[derive(Clone)]
pub struct ClassificationService {
    classifier: Arc<dyn DocumentClassifier>,
}

impl ClassificationService {
    pub fn new(classifier: Arc<dyn DocumentClassifier>) -> Self {
        Self { classifier }
    }

    /// Classify OCR text; never fails
    pub async fn classify(&self, text: &str) -> ClassificationResult {
        match self.try_classify(text).await {
            Ok(result) => {
                debug!(
                    document_type = result.document_type.as_str(),
                    confidence = result.confidence_score,
                    level = result.confidence_level.as_str(),
                    "Document classified"
                );
                result
            }
            Err(e) => {
                warn!(error = %e, "Classification unavailable, using fallback");
                ClassificationResult::fallback(e)
            }
        }
    }

    async fn try_classify(&self, text: &str) -> Result<ClassificationResult, ClassificationError> {
        if text.trim().is_empty() {
            return Err(ClassificationError::EmptyText);
        }

        let raw = self.classifier.classify(text).await?;
        let document_type = DocumentType::parse(&raw.document_type)
            .ok_or(ClassificationError::UnknownLabel(raw.document_type))?;

        Ok(ClassificationResult::new(
            document_type,
            raw.confidence_score,
            raw.reasoning,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConfidenceLevel;

    struct FixedClassifier(Result<(&'static str, f32), &'static str>);

    #[async_trait]
    impl DocumentClassifier for FixedClassifier {
        async fn classify(&self, _text: &str) -> Result<RawClassification, ClassificationError> {
            match self.0 {
                Ok((label, score)) => Ok(RawClassification {
                    document_type: label.to_string(),
                    confidence_score: score,
                    reasoning: "fixed".to_string(),
                }),
                Err(msg) => Err(ClassificationError::Network(msg.to_string())),
            }
        }
    }

    fn service(response: Result<(&'static str, f32), &'static str>) -> ClassificationService {
        ClassificationService::new(Arc::new(FixedClassifier(response)))
    }

    #[tokio::test]
    async fn test_level_is_computed_locally() {
        let result = service(Ok(("upi_confirmation", 91.0))).classify("Paid").await;
        assert_eq!(result.document_type, DocumentType::UpiConfirmation);
        assert_eq!(result.confidence_level, ConfidenceLevel::High);

        let result = service(Ok(("cash_receipt", 65.0))).classify("Paid").await;
        assert_eq!(result.confidence_level, ConfidenceLevel::Medium);
    }

    #[tokio::test]
    async fn test_out_of_range_score_is_clamped() {
        let result = service(Ok(("cheque_image", 140.0))).classify("cheque").await;
        assert_eq!(result.confidence_score, 100.0);
    }

    #[tokio::test]
    async fn test_failures_become_fallback() {
        let network = service(Err("connection reset")).classify("Paid").await;
        assert!(network.is_fallback());
        assert_eq!(network.document_type, DocumentType::Unclear);
        assert_eq!(network.confidence_level, ConfidenceLevel::Low);

        let unknown = service(Ok(("invoice", 90.0))).classify("Paid").await;
        assert!(unknown.is_fallback());
        assert!(unknown.reasoning.contains("invoice"));

        let empty = service(Ok(("upi_confirmation", 90.0))).classify("   ").await;
        assert!(empty.is_fallback());
    }

    #[tokio::test]
    async fn test_missing_key_is_fallback() {
        let classifier = LlmClassifier::new(
            "http://127.0.0.1:9/unused".to_string(),
            None,
            "gpt-4o-mini".to_string(),
            Duration::from_secs(1),
        )
        .unwrap();
        let result = ClassificationService::new(Arc::new(classifier))
            .classify("Paid Rs 500")
            .await;
        assert!(result.is_fallback());
        assert!(result.reasoning.contains("not configured"));
    }

    #[test]
    fn test_completion_content_parsed() {
        let completion: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"content":"{\"document_type\":\"non_payment_document\",\"confidence_score\":92,\"reasoning\":\"A selfie\"}"}}]}"#,
        )
        .unwrap();
        let raw = parse_completion(completion).unwrap();
        assert_eq!(raw.document_type, "non_payment_document");
        assert_eq!(raw.confidence_score, 92.0);
    }

    #[test]
    fn test_malformed_completion_is_parse_error() {
        let completion: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"not json"}}]}"#).unwrap();
        assert!(matches!(
            parse_completion(completion),
            Err(ClassificationError::Parse(_))
        ));

        let empty: ChatCompletionResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(parse_completion(empty).is_err());
    }

    #[test]
    fn test_request_pins_temperature_and_labels() {
        let classifier = LlmClassifier::new(
            "http://localhost".to_string(),
            Some("k".to_string()),
            "m".to_string(),
            Duration::from_secs(1),
        )
        .unwrap();
        let body = serde_json::to_value(classifier.request_body("Paid")).unwrap();
        assert_eq!(body["temperature"], 0.0);
        let labels = &body["response_format"]["json_schema"]["schema"]["properties"]["document_type"]["enum"];
        assert_eq!(labels.as_array().unwrap().len(), 6);
    }
}
