//! Perceptual image fingerprint
//!
//! 64-bit difference hash (dHash): the image is reduced to 9x8 grayscale and
//! each bit records whether a pixel is brighter than its right neighbour. The
//! result survives recompression and resizing, so re-uploads of the same
//! screenshot hash identically or within a few bits.

use image::imageops::FilterType;
use image::DynamicImage;
use sha2::{Digest, Sha256};
use std::fmt;

/// Bits in a dHash
pub const HASH_BITS: u32 = 64;

const SHA256_PREFIX: &str = "sha256:";

/// Stored fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fingerprint {
    /// Perceptual hash of a decodable image
    DHash(u64),
    /// Byte digest of an undecodable file; exact matches only
    Sha256(String),
}

impl Fingerprint {
    /// Fingerprint raw upload bytes
    ///
    /// CPU bound; call from `spawn_blocking`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match image::load_from_memory(bytes) {
            Ok(img) => Fingerprint::DHash(dhash(&img)),
            Err(e) => {
                tracing::debug!(error = %e, "Image not decodable, fingerprinting bytes");
                Fingerprint::Sha256(format!("{:x}", Sha256::digest(bytes)))
            }
        }
    }

    /// Parse the stored text form
    pub fn parse(raw: &str) -> Option<Self> {
        if let Some(hex) = raw.strip_prefix(SHA256_PREFIX) {
            return Some(Fingerprint::Sha256(hex.to_string()));
        }
        if raw.len() != 16 {
            return None;
        }
        u64::from_str_radix(raw, 16).ok().map(Fingerprint::DHash)
    }

    pub fn as_dhash(&self) -> Option<u64> {
        match self {
            Fingerprint::DHash(hash) => Some(*hash),
            Fingerprint::Sha256(_) => None,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fingerprint::DHash(hash) => write!(f, "{:016x}", hash),
            Fingerprint::Sha256(hex) => write!(f, "{}{}", SHA256_PREFIX, hex),
        }
    }
}

/// Difference hash of a decoded image
pub fn dhash(img: &DynamicImage) -> u64 {
    let small = img.resize_exact(9, 8, FilterType::Lanczos3).to_luma8();
    let mut hash = 0u64;
    for y in 0..8 {
        for x in 0..8 {
            let left = small.get_pixel(x, y)[0];
            let right = small.get_pixel(x + 1, y)[0];
            hash = (hash << 1) | u64::from(left > right);
        }
    }
    hash
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// `100 * (1 - d/64)`; 100 for identical hashes, decreasing with distance
pub fn similarity_percentage(distance: u32) -> f32 {
    let distance = distance.min(HASH_BITS);
    100.0 * (1.0 - distance as f32 / HASH_BITS as f32)
}
