//! Image heuristics
//!
//! Cheap forensic signals read from the upload itself: EXIF metadata, editing
//! software, geometry, and a text-density estimate. Findings are informational.
//! They can send a submission to manual review but never reject it.

use crate::config::HeuristicsConfig;
use crate::types::ProofImage;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use std::io::Cursor;
use tracing::{debug, warn};

/// Software tag fragments that indicate an image editor
const EDITOR_SIGNATURES: &[&str] = &[
    "photoshop",
    "gimp",
    "snapseed",
    "lightroom",
    "picsart",
    "canva",
    "pixlr",
    "paint.net",
    "affinity",
    "facetune",
];

/// Portrait height/width range of phone screenshots
const SCREENSHOT_RATIO: (f32, f32) = (1.6, 2.4);

/// Width the text-density estimate works at
const DENSITY_WIDTH: u32 = 512;

/// Luma step counted as a glyph edge
const EDGE_THRESHOLD: i16 = 40;

/// Heuristic findings for one image
#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicsReport {
    pub decodable: bool,
    pub exif_available: bool,
    pub exif_editor_detected: Option<String>,
    pub looks_like_screenshot: bool,
    /// Height / width
    pub aspect_ratio: f32,
    pub resolution_w: u32,
    pub resolution_h: u32,
    /// Share of strong horizontal edges, 0-100
    pub text_density_score: f32,
    pub anomalies: Vec<String>,
}

#[derive(Debug, Default)]
struct ExifSummary {
    available: bool,
    software: Option<String>,
    has_camera: bool,
}

fn ascii_field(reader: &exif::Exif, tag: exif::Tag) -> Option<String> {
    let field = reader.get_field(tag, exif::In::PRIMARY)?;
    match &field.value {
        exif::Value::Ascii(parts) => parts
            .first()
            .map(|raw| String::from_utf8_lossy(raw).trim().to_string())
            .filter(|s| !s.is_empty()),
        _ => None,
    }
}

fn read_exif(bytes: &[u8]) -> ExifSummary {
    let mut cursor = Cursor::new(bytes);
    let reader = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(r) => r,
        Err(_) => return ExifSummary::default(),
    };

    ExifSummary {
        available: true,
        software: ascii_field(&reader, exif::Tag::Software),
        has_camera: ascii_field(&reader, exif::Tag::Make).is_some()
            || ascii_field(&reader, exif::Tag::Model).is_some(),
    }
}

/// Editor name if the Software tag matches a known editor
pub fn editor_signature(software: &str) -> Option<String> {
    let lower = software.to_ascii_lowercase();
    EDITOR_SIGNATURES
        .iter()
        .any(|sig| lower.contains(sig))
        .then(|| software.to_string())
}

/// Text density score of a decoded image (0-100)
pub fn text_density(img: &DynamicImage) -> f32 {
    let (w, h) = img.dimensions();
    if w < 2 || h == 0 {
        return 0.0;
    }

    let gray = if w > DENSITY_WIDTH {
        let scaled_h = ((h as f32 * DENSITY_WIDTH as f32 / w as f32).round() as u32).max(1);
        img.resize_exact(DENSITY_WIDTH, scaled_h, FilterType::Triangle)
            .to_luma8()
    } else {
        img.to_luma8()
    };

    let (gw, gh) = gray.dimensions();
    let mut edges = 0u64;
    for y in 0..gh {
        for x in 0..gw - 1 {
            let a = gray.get_pixel(x, y)[0] as i16;
            let b = gray.get_pixel(x + 1, y)[0] as i16;
            if (a - b).abs() >= EDGE_THRESHOLD {
                edges += 1;
            }
        }
    }

    let total = u64::from(gw - 1) * u64::from(gh);
    (edges as f32 / total as f32 * 100.0).clamp(0.0, 100.0)
}

/// Analyze raw bytes; CPU bound
pub fn analyze_bytes(bytes: &[u8], file_type: &str, config: &HeuristicsConfig) -> HeuristicsReport {
    let exif = read_exif(bytes);
    let exif_editor_detected = exif.software.as_deref().and_then(editor_signature);
    let is_png = image::guess_format(bytes).ok() == Some(ImageFormat::Png)
        || file_type.to_ascii_lowercase().contains("png");

    let mut anomalies = Vec::new();
    if let Some(editor) = &exif_editor_detected {
        anomalies.push(format!("edited with {}", editor));
    }

    let decoded = image::load_from_memory(bytes);
    let report = match decoded {
        Ok(img) => {
            let (w, h) = img.dimensions();
            let aspect_ratio = if w == 0 { 0.0 } else { h as f32 / w as f32 };
            let text_density_score = text_density(&img);
            let phone_portrait =
                (SCREENSHOT_RATIO.0..=SCREENSHOT_RATIO.1).contains(&aspect_ratio);

            if w.min(h) < config.min_short_side_px {
                anomalies.push(format!(
                    "resolution {}x{} below minimum {} px",
                    w, h, config.min_short_side_px
                ));
            }
            if !(config.min_aspect_ratio..=config.max_aspect_ratio).contains(&aspect_ratio) {
                anomalies.push(format!(
                    "aspect ratio {:.2} outside [{:.2}, {:.2}]",
                    aspect_ratio, config.min_aspect_ratio, config.max_aspect_ratio
                ));
            }
            if text_density_score < config.min_text_density {
                anomalies.push(format!(
                    "text density {:.1} below floor {:.1}",
                    text_density_score, config.min_text_density
                ));
            }

            HeuristicsReport {
                decodable: true,
                exif_available: exif.available,
                exif_editor_detected,
                looks_like_screenshot: is_png || (!exif.has_camera && phone_portrait),
                aspect_ratio,
                resolution_w: w,
                resolution_h: h,
                text_density_score,
                anomalies,
            }
        }
        Err(e) => {
            debug!(error = %e, "Image not decodable for heuristics");
            anomalies.push("image could not be decoded".to_string());
            HeuristicsReport {
                decodable: false,
                exif_available: exif.available,
                exif_editor_detected,
                looks_like_screenshot: false,
                aspect_ratio: 0.0,
                resolution_w: 0,
                resolution_h: 0,
                text_density_score: 0.0,
                anomalies,
            }
        }
    };

    with_exif_note(report)
}

/// Missing EXIF is normal for screenshots; it only counts alongside another finding
fn with_exif_note(mut report: HeuristicsReport) -> HeuristicsReport {
    if !report.exif_available && !report.anomalies.is_empty() {
        report.anomalies.push("no EXIF metadata".to_string());
    }
    report
}

/// Runs heuristics off the async runtime
#[derive(Debug, Clone)]
pub struct HeuristicsAnalyzer {
    config: HeuristicsConfig,
}

impl HeuristicsAnalyzer {
    pub fn new(config: HeuristicsConfig) -> Self {
        Self { config }
    }

    pub async fn analyze(&self, image: &ProofImage) -> HeuristicsReport {
        let bytes = image.bytes.clone();
        let file_type = image.file_type.clone();
        let config = self.config.clone();

        match tokio::task::spawn_blocking(move || analyze_bytes(&bytes, &file_type, &config)).await {
            Ok(report) => {
                debug!(
                    anomalies = report.anomalies.len(),
                    screenshot = report.looks_like_screenshot,
                    text_density = report.text_density_score,
                    "Heuristics complete"
                );
                report
            }
            Err(e) => {
                warn!(error = %e, "Heuristics task failed");
                HeuristicsReport {
                    decodable: false,
                    exif_available: false,
                    exif_editor_detected: None,
                    looks_like_screenshot: false,
                    aspect_ratio: 0.0,
                    resolution_w: 0,
                    resolution_h: 0,
                    text_density_score: 0.0,
                    anomalies: vec![format!("heuristics unavailable: {}", e)],
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    /// Light page with dark "glyph" runs on regularly spaced text lines
    fn receipt(width: u32, height: u32) -> DynamicImage {
        let img = GrayImage::from_fn(width, height, |x, y| {
            let on_text_line = y % 40 < 16;
            let glyph = (x / 12) % 2 == 0;
            if on_text_line && glyph {
                Luma([20u8])
            } else {
                Luma([235u8])
            }
        });
        DynamicImage::ImageLuma8(img)
    }

    fn png_bytes(img: &DynamicImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_clean_screenshot_has_no_anomalies() {
        let bytes = png_bytes(&receipt(720, 1440));
        let report = analyze_bytes(&bytes, "image/png", &HeuristicsConfig::default());

        assert!(report.decodable);
        assert!(report.looks_like_screenshot);
        assert_eq!((report.resolution_w, report.resolution_h), (720, 1440));
        assert!((report.aspect_ratio - 2.0).abs() < 0.01);
        assert!(report.text_density_score > 1.0);
        assert!(report.anomalies.is_empty(), "{:?}", report.anomalies);
    }

    #[test]
    fn test_tiny_blank_image_is_flagged() {
        let blank = DynamicImage::ImageLuma8(GrayImage::from_pixel(100, 100, Luma([255u8])));
        let report = analyze_bytes(&png_bytes(&blank), "image/png", &HeuristicsConfig::default());

        assert!(report.anomalies.iter().any(|a| a.contains("resolution")));
        assert!(report.anomalies.iter().any(|a| a.contains("text density")));
        assert!(report.anomalies.iter().any(|a| a == "no EXIF metadata"));
        assert_eq!(report.text_density_score, 0.0);
    }

    #[test]
    fn test_extreme_aspect_ratio_is_flagged() {
        let strip = receipt(400, 1600);
        let report = analyze_bytes(&png_bytes(&strip), "image/png", &HeuristicsConfig::default());
        assert!(report.anomalies.iter().any(|a| a.starts_with("aspect ratio")));
    }

    #[test]
    fn test_undecodable_bytes() {
        let report = analyze_bytes(b"not an image", "image/jpeg", &HeuristicsConfig::default());
        assert!(!report.decodable);
        assert!(report
            .anomalies
            .contains(&"image could not be decoded".to_string()));
    }

    #[test]
    fn test_editor_signatures() {
        assert_eq!(
            editor_signature("Adobe Photoshop 25.0 (Windows)").as_deref(),
            Some("Adobe Photoshop 25.0 (Windows)")
        );
        assert!(editor_signature("GIMP 2.10.34").is_some());
        assert!(editor_signature("Android 14").is_none());
    }

    #[tokio::test]
    async fn test_analyzer_runs_off_runtime() {
        let analyzer = HeuristicsAnalyzer::new(HeuristicsConfig::default());
        let image = ProofImage::new(png_bytes(&receipt(720, 1440)), "image/png");
        let report = analyzer.analyze(&image).await;
        assert!(report.anomalies.is_empty());
    }
}
