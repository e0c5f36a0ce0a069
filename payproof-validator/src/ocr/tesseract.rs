//! Fallback OCR engine: local Tesseract CLI
//!
//! Unauthenticated and always available where the binary is installed. The image
//! is piped through stdin and TSV output is read from stdout, so no temp files
//! are involved. Confidence is the mean of per-word confidences.

use crate::types::{ExtractionError, OcrEngine, ProofImage, RecognizedText};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Tesseract CLI engine
pub struct TesseractEngine {
    command: String,
    language: String,
}

impl TesseractEngine {
    pub fn new(command: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            language: language.into(),
        }
    }
}

impl Default for TesseractEngine {
    fn default() -> Self {
        Self::new("tesseract", "eng")
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    async fn recognize(&self, image: &ProofImage) -> Result<RecognizedText, ExtractionError> {
        let mut child = Command::new(&self.command)
            .args(["stdin", "stdout", "-l", &self.language, "tsv"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ExtractionError::NotAvailable(format!("{} not installed", self.command))
                } else {
                    ExtractionError::Io(e)
                }
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExtractionError::Internal("tesseract stdin unavailable".to_string()))?;
        let bytes = image.bytes.clone();
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&bytes).await;
            drop(stdin);
            result
        });

        let output = child.wait_with_output().await?;
        let written = writer
            .await
            .map_err(|e| ExtractionError::Internal(format!("stdin writer failed: {}", e)))?;

        // A failing process usually closes stdin early; report its stderr instead of EPIPE
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractionError::Internal(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        written?;

        let tsv = String::from_utf8_lossy(&output.stdout);
        let recognized = parse_tsv(&tsv);
        debug!(
            chars = recognized.text.len(),
            confidence = recognized.confidence,
            "Tesseract finished"
        );
        Ok(recognized)
    }
}

/// Rebuild text and mean word confidence from Tesseract TSV
///
/// Columns: level page block par line word left top width height conf text.
/// Only word rows (level 5) with `conf >= 0` and non-blank text count.
pub fn parse_tsv(tsv: &str) -> RecognizedText {
    let mut lines: Vec<String> = Vec::new();
    let mut current_key: Option<(u32, u32, u32, u32)> = None;
    let mut confidence_sum = 0.0f32;
    let mut word_count = 0usize;

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.splitn(12, '\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let word = cols[11].trim();
        let Ok(conf) = cols[10].trim().parse::<f32>() else {
            continue;
        };
        if conf < 0.0 || word.is_empty() {
            continue;
        }

        let key = (
            cols[1].parse().unwrap_or(0),
            cols[2].parse().unwrap_or(0),
            cols[3].parse().unwrap_or(0),
            cols[4].parse().unwrap_or(0),
        );
        match lines.last_mut() {
            Some(line) if current_key == Some(key) => {
                line.push(' ');
                line.push_str(word);
            }
            _ => {
                lines.push(word.to_string());
                current_key = Some(key);
            }
        }

        confidence_sum += conf;
        word_count += 1;
    }

    RecognizedText {
        text: lines.join("\n"),
        confidence: if word_count == 0 {
            0.0
        } else {
            confidence_sum / word_count as f32
        },
    }
}
