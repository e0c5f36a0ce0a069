//! Database access for payproof-validator
//!
//! One SQLite file in the root folder. Signal rows are keyed by
//! `payment_submission_id`; verdicts are append-only; the perceptual-hash
//! tables are the only state shared between concurrent runs.

pub mod hash_index;
pub mod signals;
pub mod verdicts;

use chrono::{DateTime, SecondsFormat, Utc};
use payproof_common::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// How long a connection waits on a locked database before failing
pub const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Initialize database connection pool and create tables
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let newly_created = !db_path.exists();
    tracing::debug!("Connecting to database: {}", db_path.display());

    // Applied to every pooled connection; WAL lets verdict reads proceed while a run is writing
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(db_path)
                .busy_timeout(BUSY_TIMEOUT)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .create_if_missing(true),
        )
        .await?;

    if newly_created {
        tracing::info!("Initialized new database: {}", db_path.display());
    } else {
        tracing::info!("Opened existing database: {}", db_path.display());
    }

    init_tables(&pool).await?;
    Ok(pool)
}

/// Single-connection in-memory database with all tables
///
/// Every handle shares the one connection, so the data lives as long as the pool.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Create every table used by the pipeline (idempotent)
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    // Owned by the submissions service; read here to annotate duplicate matches
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS payment_submissions (
            id TEXT PRIMARY KEY,
            flat_id TEXT,
            collection_id TEXT,
            status TEXT,
            created_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS proof_documents (
            id TEXT PRIMARY KEY,
            payment_submission_id TEXT NOT NULL,
            image_url TEXT NOT NULL,
            file_type TEXT NOT NULL,
            uploaded_at TEXT NOT NULL,
            UNIQUE (payment_submission_id, image_url)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ocr_results (
            payment_submission_id TEXT NOT NULL,
            engine_name TEXT NOT NULL,
            text TEXT NOT NULL,
            confidence REAL NOT NULL,
            processing_time_ms INTEGER NOT NULL,
            error TEXT,
            is_winner INTEGER NOT NULL DEFAULT 0,
            recorded_at TEXT NOT NULL,
            PRIMARY KEY (payment_submission_id, engine_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS extracted_fields (
            payment_submission_id TEXT PRIMARY KEY,
            amount REAL,
            payment_date TEXT,
            transaction_ref TEXT,
            platform TEXT,
            bank_name TEXT,
            status_keyword TEXT,
            has_amount INTEGER NOT NULL,
            has_transaction_ref INTEGER NOT NULL,
            has_date INTEGER NOT NULL,
            has_status_keyword INTEGER NOT NULL,
            has_payment_keyword INTEGER NOT NULL,
            has_bank_name INTEGER NOT NULL,
            recorded_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS classification_results (
            payment_submission_id TEXT PRIMARY KEY,
            document_type TEXT NOT NULL,
            confidence_score REAL NOT NULL,
            confidence_level TEXT NOT NULL,
            reasoning TEXT NOT NULL,
            is_fallback INTEGER NOT NULL DEFAULT 0,
            recorded_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS image_signals (
            payment_submission_id TEXT PRIMARY KEY,
            perceptual_hash TEXT NOT NULL,
            duplicate_detected INTEGER NOT NULL,
            similarity_percentage REAL,
            duplicate_matches TEXT NOT NULL DEFAULT '[]',
            upload_count INTEGER NOT NULL,
            exif_available INTEGER NOT NULL,
            exif_editor_detected TEXT,
            looks_like_screenshot INTEGER NOT NULL,
            aspect_ratio REAL NOT NULL,
            resolution_w INTEGER NOT NULL,
            resolution_h INTEGER NOT NULL,
            text_density_score REAL NOT NULL,
            anomalies TEXT NOT NULL DEFAULT '[]',
            recorded_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only audit trail; the current verdict is the newest row
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS validation_verdicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            payment_submission_id TEXT NOT NULL,
            status TEXT NOT NULL,
            confidence_score REAL NOT NULL,
            reason TEXT NOT NULL,
            validated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_validation_verdicts_submission \
         ON validation_verdicts (payment_submission_id, id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS perceptual_hash_index (
            hash TEXT PRIMARY KEY,
            first_payment_id TEXT NOT NULL,
            upload_count INTEGER NOT NULL,
            dhash_bits INTEGER,
            dhash_popcount INTEGER,
            first_seen_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_perceptual_hash_popcount \
         ON perceptual_hash_index (dhash_popcount)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS perceptual_hash_sightings (
            hash TEXT NOT NULL,
            payment_submission_id TEXT NOT NULL,
            first_seen_at TEXT NOT NULL,
            PRIMARY KEY (hash, payment_submission_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::debug!("Database tables initialized");
    Ok(())
}

/// Fixed-width UTC timestamp so text ordering matches time ordering
pub(crate) fn to_db_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn from_db_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Invalid timestamp '{}': {}", raw, e)))
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::Internal(format!("Invalid UUID '{}': {}", raw, e)))
}
