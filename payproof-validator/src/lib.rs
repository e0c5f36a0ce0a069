//! payproof-validator library interface
//!
//! The validation pipeline and its signal producers, plus the HTTP surface the
//! binary serves. Exposed as a library for integration testing.

pub mod api;
pub mod classify;
pub mod config;
pub mod db;
pub mod decision;
pub mod duplicate;
pub mod error;
pub mod extract;
pub mod heuristics;
pub mod ocr;
pub mod pipeline;
pub mod storage;
pub mod types;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};
pub use crate::pipeline::{PipelineError, ValidationOutcome, ValidationPipeline, ValidationRequest};

use axum::Router;
use chrono::{DateTime, Utc};
use payproof_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub pipeline: Arc<ValidationPipeline>,
    /// Same bus the pipeline publishes on; SSE clients subscribe here
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last failed run, for diagnostics
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(pipeline: ValidationPipeline) -> Self {
        Self {
            db: pipeline.db().clone(),
            event_bus: pipeline.event_bus().clone(),
            pipeline: Arc::new(pipeline),
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::validation_routes())
        .route("/events", get(api::verdict_event_stream))
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
