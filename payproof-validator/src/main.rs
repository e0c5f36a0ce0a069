//! payproof-validator - payment proof validation service
//!
//! Validates uploaded payment screenshots for a housing-society collections
//! system and publishes one verdict per submission (AUTO_APPROVED,
//! MANUAL_REVIEW or REJECTED).

use anyhow::{Context, Result};
use clap::Parser;
use payproof_common::events::EventBus;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use payproof_validator::classify::{ClassificationService, LlmClassifier};
use payproof_validator::config::{ValidatorConfig, CONFIG_FILE_NAME, DATABASE_FILE_NAME};
use payproof_validator::decision::DecisionEngine;
use payproof_validator::ocr::{CloudVisionEngine, OcrOrchestrator, TesseractEngine};
use payproof_validator::storage::HttpImageFetcher;
use payproof_validator::{AppState, ValidationPipeline};

#[derive(Debug, Parser)]
#[command(name = "payproof-validator", version, about = "Payment proof validation service")]
struct Args {
    /// Root folder holding the database and default config
    #[arg(long, env = "PAYPROOF_ROOT")]
    root_folder: Option<String>,

    /// Config file (defaults to payproof.toml in the root folder)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overrides config
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("payproof_validator=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    info!("Starting payproof-validator");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Root folder: CLI → env → OS default
    let root_folder =
        payproof_common::config::resolve_root_folder(args.root_folder.as_deref(), "PAYPROOF_ROOT");
    let db_path = payproof_common::config::prepare_root_folder(&root_folder, DATABASE_FILE_NAME)
        .context("Failed to initialize root folder")?;

    let config_path = args
        .config
        .unwrap_or_else(|| root_folder.join(CONFIG_FILE_NAME));
    let mut config = ValidatorConfig::resolve(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    info!("Database: {}", db_path.display());
    let db_pool = payproof_validator::db::init_database_pool(&db_path).await?;

    let event_bus = EventBus::new(config.server.event_capacity);

    let primary = CloudVisionEngine::new(
        config.ocr.primary_endpoint.clone(),
        config.ocr.primary_api_key.clone(),
        config.ocr.primary_requests_per_minute,
        Duration::from_millis(config.ocr.primary_timeout_ms),
    )?;
    let fallback = TesseractEngine::new(
        config.ocr.tesseract_command.clone(),
        config.ocr.tesseract_language.clone(),
    );
    let ocr = OcrOrchestrator::new(
        Arc::new(primary),
        Arc::new(fallback),
        Duration::from_millis(config.ocr.primary_timeout_ms),
        Duration::from_millis(config.ocr.fallback_timeout_ms),
    )
    .with_cross_check(config.ocr.cross_check);

    let classifier = LlmClassifier::new(
        config.classifier.endpoint.clone(),
        config.classifier.api_key.clone(),
        config.classifier.model.clone(),
        Duration::from_millis(config.classifier.timeout_ms),
    )?;

    let mut fetcher =
        HttpImageFetcher::new(Duration::from_millis(config.storage.fetch_timeout_ms))?
            .with_max_image_bytes(config.storage.max_image_bytes);
    match &config.storage.local_root {
        Some(root) => {
            info!("file:// proofs allowed under {}", root.display());
            fetcher = fetcher.with_local_root(root.clone());
        }
        None => info!("file:// proofs disabled (no storage root configured)"),
    }

    let pipeline = ValidationPipeline::new(
        db_pool,
        Arc::new(fetcher),
        ocr,
        ClassificationService::new(Arc::new(classifier)),
        event_bus,
    )
    .with_near_match_max_distance(config.duplicates.near_match_max_distance)
    .with_heuristics(config.heuristics.clone())
    .with_decision_engine(DecisionEngine::new(config.decision.clone()))
    .with_extraction_source(config.ocr.extraction_source);

    let app = payproof_validator::build_router(AppState::new(pipeline));

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!("Listening on http://{}", config.server.bind);
    info!("Health check: http://{}/health", config.server.bind);

    axum::serve(listener, app).await?;

    Ok(())
}
