//! Configuration resolution for payproof-validator
//!
//! Priority per setting: environment variable → TOML file → compiled default.
//! Every tunable of the pipeline (timeouts, quotas, decision weights) lives here
//! so nothing is hard-coded at call sites.

use payproof_common::config::{env_parse, env_string, load_toml_file};
use payproof_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::decision::DecisionPolicy;
use crate::extract::ExtractionSource;

/// Default TOML file name inside the root folder
pub const CONFIG_FILE_NAME: &str = "payproof.toml";

/// Database file name inside the root folder
pub const DATABASE_FILE_NAME: &str = "payproof.db";

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub server: ServerConfig,
    pub ocr: OcrConfig,
    pub classifier: ClassifierConfig,
    pub duplicates: DuplicateConfig,
    pub heuristics: HeuristicsConfig,
    pub decision: DecisionPolicy,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Verdict event bus capacity
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5730".to_string(),
            event_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    /// Cloud Vision `images:annotate` endpoint
    pub primary_endpoint: String,
    pub primary_api_key: Option<String>,
    pub primary_timeout_ms: u64,
    /// Local quota for the paid engine
    pub primary_requests_per_minute: u32,
    pub fallback_timeout_ms: u64,
    pub tesseract_command: String,
    pub tesseract_language: String,
    /// Also run the fallback when the primary succeeded
    pub cross_check: bool,
    pub extraction_source: ExtractionSource,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            primary_endpoint: "https://vision.googleapis.com/v1/images:annotate".to_string(),
            primary_api_key: None,
            primary_timeout_ms: 8_000,
            primary_requests_per_minute: 60,
            fallback_timeout_ms: 20_000,
            tesseract_command: "tesseract".to_string(),
            tesseract_language: "eng".to_string(),
            cross_check: false,
            extraction_source: ExtractionSource::Winner,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// OpenAI-compatible chat completions endpoint
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplicateConfig {
    /// Max Hamming distance (of 64 bits) still reported as a near match; 0 = exact only
    pub near_match_max_distance: u32,
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            near_match_max_distance: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory `file://` URLs may resolve into; unset disables `file://`
    pub local_root: Option<PathBuf>,
    pub max_image_bytes: usize,
    pub fetch_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_root: None,
            max_image_bytes: crate::storage::MAX_IMAGE_BYTES,
            fetch_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicsConfig {
    /// Shorter image side below this is flagged
    pub min_short_side_px: u32,
    /// Height / width bounds outside which the ratio is flagged
    pub min_aspect_ratio: f32,
    pub max_aspect_ratio: f32,
    /// Text density (0-100) below this is flagged
    pub min_text_density: f32,
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            min_short_side_px: 320,
            min_aspect_ratio: 0.4,
            max_aspect_ratio: 3.0,
            min_text_density: 1.0,
        }
    }
}

impl ValidatorConfig {
    /// Load TOML (if present) then apply environment overrides
    pub fn resolve(toml_path: &Path) -> Result<Self> {
        let mut config: ValidatorConfig = load_toml_file(toml_path)?;
        config.apply_env_overrides()?;
        config.decision.validate()?;
        Ok(config)
    }

    /// Environment variables take priority over TOML values
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(bind) = env_string("PAYPROOF_BIND") {
            self.server.bind = bind;
        }
        if let Some(endpoint) = env_string("PAYPROOF_OCR_ENDPOINT") {
            self.ocr.primary_endpoint = endpoint;
        }
        self.ocr.primary_api_key = resolve_secret(
            "OCR API key",
            "PAYPROOF_OCR_API_KEY",
            self.ocr.primary_api_key.take(),
        );
        if let Some(ms) = env_parse::<u64>("PAYPROOF_OCR_TIMEOUT_MS")? {
            self.ocr.primary_timeout_ms = ms;
        }
        if let Some(cmd) = env_string("PAYPROOF_TESSERACT_COMMAND") {
            self.ocr.tesseract_command = cmd;
        }
        if let Some(endpoint) = env_string("PAYPROOF_CLASSIFIER_ENDPOINT") {
            self.classifier.endpoint = endpoint;
        }
        if let Some(model) = env_string("PAYPROOF_CLASSIFIER_MODEL") {
            self.classifier.model = model;
        }
        self.classifier.api_key = resolve_secret(
            "classifier API key",
            "PAYPROOF_CLASSIFIER_API_KEY",
            self.classifier.api_key.take(),
        );
        if let Some(distance) = env_parse::<u32>("PAYPROOF_NEAR_MATCH_MAX_DISTANCE")? {
            self.duplicates.near_match_max_distance = distance;
        }
        if let Some(root) = env_string("PAYPROOF_STORAGE_ROOT") {
            self.storage.local_root = Some(PathBuf::from(root));
        }
        if self.duplicates.near_match_max_distance > 64 {
            return Err(Error::Config(format!(
                "near_match_max_distance must be <= 64, got {}",
                self.duplicates.near_match_max_distance
            )));
        }
        Ok(())
    }
}

/// Pick a secret from ENV over TOML, warning when both are set
fn resolve_secret(label: &str, env_name: &str, toml_value: Option<String>) -> Option<String> {
    let env_value = env_string(env_name);
    let toml_value = toml_value.filter(|k| is_valid_key(k));

    match (env_value, toml_value) {
        (Some(env), Some(_)) => {
            warn!(
                "{} found in both environment and TOML. Using environment ({}).",
                label, env_name
            );
            Some(env)
        }
        (Some(env), None) => {
            info!("{} loaded from environment variable", label);
            Some(env)
        }
        (None, Some(toml)) => {
            info!("{} loaded from TOML config", label);
            Some(toml)
        }
        (None, None) => {
            warn!("{} not configured; dependent signal will degrade", label);
            None
        }
    }
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_sane() {
        let config = ValidatorConfig::default();
        assert_eq!(config.ocr.extraction_source, ExtractionSource::Winner);
        assert!(!config.ocr.cross_check);
        assert!(config.ocr.primary_api_key.is_none());
        assert!(config.decision.validate().is_ok());
        assert!(config.storage.local_root.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[ocr]\nprimary_timeout_ms = 2500\ncross_check = true\n\n[decision]\nocr_weight = 0.5\nfields_weight = 0.25\nclassification_weight = 0.25"
        )
        .unwrap();

        let config: ValidatorConfig = load_toml_file(&path).unwrap();
        assert_eq!(config.ocr.primary_timeout_ms, 2500);
        assert!(config.ocr.cross_check);
        assert_eq!(config.ocr.tesseract_command, "tesseract");
        assert_eq!(config.decision.ocr_weight, 0.5);
        assert_eq!(config.duplicates.near_match_max_distance, 6);
        assert_eq!(config.storage.max_image_bytes, crate::storage::MAX_IMAGE_BYTES);
    }

    #[test]
    fn test_blank_key_rejected() {
        assert!(!is_valid_key("   "));
        assert!(is_valid_key("abc"));
    }
}
