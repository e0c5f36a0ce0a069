//! Duplicate image detection
//!
//! Every document is fingerprinted and recorded in the shared hash index
//! before its matches are read, so of two concurrent submissions of the same
//! image at least the later one sees the other. Exact fingerprint matches score
//! 100; perceptual hashes within `near_match_max_distance` bits score by
//! Hamming distance. Near-match candidates come from one indexed query over a
//! popcount band.

pub mod phash;

use crate::db::hash_index::{self, Sighting};
use crate::types::{DuplicateMatch, ProofImage};
use payproof_common::{Error, Result};
use phash::{hamming_distance, similarity_percentage, Fingerprint};
use sqlx::SqlitePool;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Outcome of one duplicate lookup
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateCheck {
    pub perceptual_hash: String,
    /// Distinct submissions that produced this exact fingerprint, including this one
    pub upload_count: i64,
    /// Other submissions, highest similarity first
    pub matches: Vec<DuplicateMatch>,
}

impl DuplicateCheck {
    pub fn duplicate_detected(&self) -> bool {
        !self.matches.is_empty()
    }

    /// Highest similarity among the matches
    pub fn similarity_percentage(&self) -> Option<f32> {
        self.matches.first().map(|m| m.similarity_percentage)
    }
}

/// Fingerprints documents against the shared index
#[derive(Clone)]
pub struct DuplicateDetector {
    db: SqlitePool,
    near_match_max_distance: u32,
}

impl DuplicateDetector {
    /// `near_match_max_distance == 0` restricts matching to identical hashes
    pub fn new(db: SqlitePool, near_match_max_distance: u32) -> Self {
        Self {
            db,
            near_match_max_distance,
        }
    }

    /// Record the document's fingerprint and list prior submissions that share it
    pub async fn check(&self, image: &ProofImage, payment_submission_id: Uuid) -> Result<DuplicateCheck> {
        let bytes = image.bytes.clone();
        let fingerprint = tokio::task::spawn_blocking(move || Fingerprint::from_bytes(&bytes))
            .await
            .map_err(|e| Error::Internal(format!("Fingerprint task failed: {}", e)))?;
        let hash = fingerprint.to_string();

        let entry =
            hash_index::record_sighting(&self.db, &hash, fingerprint.as_dhash(), payment_submission_id)
                .await?;

        let band = fingerprint
            .as_dhash()
            .filter(|_| self.near_match_max_distance > 0)
            .map(|bits| popcount_band(bits, self.near_match_max_distance));
        let candidates =
            hash_index::candidate_sightings(&self.db, &hash, band, payment_submission_id).await?;

        let scored: Vec<(Sighting, f32)> = candidates
            .into_iter()
            .filter_map(|candidate| {
                let similarity = if candidate.hash == hash {
                    100.0
                } else {
                    let distance = hamming_distance(fingerprint.as_dhash()?, candidate.dhash_bits?);
                    if distance > self.near_match_max_distance {
                        return None;
                    }
                    similarity_percentage(distance)
                };
                Some((candidate.sighting, similarity))
            })
            .collect();

        let matches = merge_matches(scored);
        if matches.is_empty() {
            debug!(hash = %hash, "No duplicate found");
        } else {
            info!(
                payment_submission_id = %payment_submission_id,
                hash = %hash,
                matches = matches.len(),
                "Duplicate proof image detected"
            );
        }

        Ok(DuplicateCheck {
            perceptual_hash: hash,
            upload_count: entry.upload_count,
            matches,
        })
    }
}

/// Popcounts a hash within `max_distance` bits of `bits` can have
fn popcount_band(bits: u64, max_distance: u32) -> (u32, u32) {
    let ones = bits.count_ones();
    (ones.saturating_sub(max_distance), (ones + max_distance).min(64))
}

/// One match per submission at its best similarity, best first then oldest first
fn merge_matches(candidates: Vec<(Sighting, f32)>) -> Vec<DuplicateMatch> {
    let mut best: HashMap<Uuid, DuplicateMatch> = HashMap::new();
    for (sighting, similarity) in candidates {
        let candidate = DuplicateMatch {
            payment_submission_id: sighting.payment_submission_id,
            flat_id: sighting.flat_id,
            collection_id: sighting.collection_id,
            submission_status: sighting.submission_status,
            similarity_percentage: similarity,
            first_seen_at: sighting.first_seen_at,
        };
        match best.get(&candidate.payment_submission_id) {
            Some(existing) if existing.similarity_percentage >= similarity => {}
            _ => {
                best.insert(candidate.payment_submission_id, candidate);
            }
        }
    }

    let mut matches: Vec<DuplicateMatch> = best.into_values().collect();
    matches.sort_by(|a, b| {
        b.similarity_percentage
            .total_cmp(&a.similarity_percentage)
            .then_with(|| a.first_seen_at.cmp(&b.first_seen_at))
            .then_with(|| a.payment_submission_id.cmp(&b.payment_submission_id))
    });
    matches
}
