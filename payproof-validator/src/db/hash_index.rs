//! Perceptual-hash index
//!
//! `perceptual_hash_index` holds one row per fingerprint with its first
//! submission and upload count. `perceptual_hash_sightings` records which
//! submissions produced each fingerprint, which is what duplicate matches are
//! read from.
//!
//! A sighting is recorded once per `(hash, submission)` pair, so re-validating
//! the same submission never inflates `upload_count`.
//!
//! Each dHash row also stores its popcount. Two hashes within Hamming distance
//! `d` differ in popcount by at most `d`, so near-match candidates are narrowed
//! by an indexed popcount band before any distance is computed.

use super::{from_db_timestamp, parse_uuid, to_db_timestamp};
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};
use chrono::{DateTime, Utc};
use payproof_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Index entry after a sighting was recorded
#[derive(Debug, Clone, PartialEq)]
pub struct HashIndexEntry {
    pub hash: String,
    pub first_payment_id: Uuid,
    pub upload_count: i64,
    /// True when this call created the `(hash, submission)` sighting
    pub newly_sighted: bool,
}

/// A submission that sighted some hash
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    pub payment_submission_id: Uuid,
    pub first_seen_at: DateTime<Utc>,
    pub flat_id: Option<String>,
    pub collection_id: Option<String>,
    pub submission_status: Option<String>,
}

/// Record that `submission_id` produced `hash`
///
/// One transaction: insert the sighting if new, atomically insert-or-increment
/// the index row, read the row back. Retried on lock contention.
pub async fn record_sighting(
    pool: &SqlitePool,
    hash: &str,
    dhash_bits: Option<u64>,
    submission_id: Uuid,
) -> Result<HashIndexEntry> {
    let submission = submission_id.to_string();
    let popcount = dhash_bits.map(|bits| i64::from(bits.count_ones()));
    // Stored as the same 64 bits reinterpreted; SQLite integers are signed
    let dhash_bits = dhash_bits.map(|bits| bits as i64);

    retry_on_lock("record_sighting", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let now = to_db_timestamp(Utc::now());
        let mut tx = pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO perceptual_hash_sightings (hash, payment_submission_id, first_seen_at) \
             VALUES (?, ?, ?)",
        )
        .bind(hash)
        .bind(&submission)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            sqlx::query(
                r#"
                INSERT INTO perceptual_hash_index
                    (hash, first_payment_id, upload_count, dhash_bits, dhash_popcount,
                     first_seen_at, last_seen_at)
                VALUES (?, ?, 1, ?, ?, ?, ?)
                ON CONFLICT(hash) DO UPDATE SET
                    upload_count = upload_count + 1,
                    last_seen_at = excluded.last_seen_at
                "#,
            )
            .bind(hash)
            .bind(&submission)
            .bind(dhash_bits)
            .bind(popcount)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        let row = sqlx::query(
            "SELECT first_payment_id, upload_count FROM perceptual_hash_index WHERE hash = ?",
        )
        .bind(hash)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let first_payment_id: String = row.get("first_payment_id");
        Ok::<_, Error>(HashIndexEntry {
            hash: hash.to_string(),
            first_payment_id: parse_uuid(&first_payment_id)?,
            upload_count: row.get("upload_count"),
            newly_sighted: inserted == 1,
        })
    })
    .await
}

/// A sighting together with the fingerprint it was recorded under
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub hash: String,
    pub dhash_bits: Option<u64>,
    pub sighting: Sighting,
}

/// Sightings by submissions other than `exclude` that share `hash` exactly or
/// whose dHash popcount lies in `popcount_band` (inclusive), oldest first
///
/// One query; annotated with flat / collection / status when the submission is
/// known. `None` for the band returns exact sightings only.
pub async fn candidate_sightings(
    pool: &SqlitePool,
    hash: &str,
    popcount_band: Option<(u32, u32)>,
    exclude: Uuid,
) -> Result<Vec<Candidate>> {
    // (1, 0) is an empty band
    let (low, high) = popcount_band
        .map(|(low, high)| (i64::from(low), i64::from(high)))
        .unwrap_or((1, 0));

    let rows = sqlx::query(
        r#"
        SELECT s.hash, i.dhash_bits, s.payment_submission_id, s.first_seen_at,
               p.flat_id, p.collection_id, p.status
        FROM perceptual_hash_sightings s
        JOIN perceptual_hash_index i ON i.hash = s.hash
        LEFT JOIN payment_submissions p ON p.id = s.payment_submission_id
        WHERE s.payment_submission_id != ?
          AND (s.hash = ? OR i.dhash_popcount BETWEEN ? AND ?)
        ORDER BY s.first_seen_at, s.payment_submission_id
        "#,
    )
    .bind(exclude.to_string())
    .bind(hash)
    .bind(low)
    .bind(high)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let id: String = row.get("payment_submission_id");
            let first_seen_at: String = row.get("first_seen_at");
            let bits: Option<i64> = row.get("dhash_bits");
            Ok(Candidate {
                hash: row.get("hash"),
                dhash_bits: bits.map(|b| b as u64),
                sighting: Sighting {
                    payment_submission_id: parse_uuid(&id)?,
                    first_seen_at: from_db_timestamp(&first_seen_at)?,
                    flat_id: row.get("flat_id"),
                    collection_id: row.get("collection_id"),
                    submission_status: row.get("status"),
                },
            })
        })
        .collect()
}

/// Current entry for a hash, if any
pub async fn get_entry(pool: &SqlitePool, hash: &str) -> Result<Option<(Uuid, i64)>> {
    let row = sqlx::query(
        "SELECT first_payment_id, upload_count FROM perceptual_hash_index WHERE hash = ?",
    )
    .bind(hash)
    .fetch_optional(pool)
    .await?;

    row.map(|row| {
        let first: String = row.get("first_payment_id");
        Ok((parse_uuid(&first)?, row.get("upload_count")))
    })
    .transpose()
}
