//! Window fingerprinting
//!
//! Two representations per window:
//!
//! - a 32-byte SHA-256 digest over a canonical, precision-limited
//!   serialization of the feature vector. Rounding to 3 decimals keeps
//!   capture jitter between overlapping windows of the same broadcast
//!   from shifting the hash;
//! - a Chromaprint-style chroma-sequence encoding: per STFT frame the
//!   dominant semitone and a quantized frame energy packed into one
//!   byte, base64-encoded. Similarity compares the first 32 symbols.

use crate::error::DetectResult;
use crate::services::feature_extractor::{bin_frequencies, chroma_frames, stft};
use crate::types::{AudioFeatures, FingerprintData};
use base64::{engine::general_purpose, Engine as _};
use sha2::{Digest, Sha256};

const FFT_SIZE: usize = 2048;
const HOP_LENGTH: usize = 512;

/// Symbols compared by [`chromaprint_similarity`].
pub const COMPARE_SYMBOLS: usize = 32;

/// Window fingerprinter, one per worker.
#[derive(Debug, Clone, Copy)]
pub struct Fingerprinter {
    sample_rate: u32,
}

impl Fingerprinter {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    /// Fingerprint one analyzed window.
    pub fn fingerprint(
        &self,
        samples: &[f32],
        features: &AudioFeatures,
    ) -> DetectResult<FingerprintData> {
        let canonical = canonical_serialization(features);

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        let raw = digest.to_vec();
        let hash = hex_encode(&raw);

        let chromaprint = encode_chroma_sequence(samples, self.sample_rate);

        Ok(FingerprintData {
            hash,
            raw,
            chromaprint,
        })
    }
}

/// Canonical feature serialization: MFCC mean, chroma mean and centroid
/// mean rounded to 3 decimals, `;`-joined.
fn canonical_serialization(features: &AudioFeatures) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(features.mfcc_mean.len() + features.chroma_mean.len() + 1);
    for v in &features.mfcc_mean {
        parts.push(format!("{:.3}", v));
    }
    for v in &features.chroma_mean {
        parts.push(format!("{:.3}", v));
    }
    parts.push(format!("{:.3}", features.spectral_centroid));
    parts.join(";")
}

/// Chroma-sequence encoding of the PCM window.
///
/// Returns `None` when the window is too short to produce any STFT frame.
fn encode_chroma_sequence(samples: &[f32], sample_rate: u32) -> Option<String> {
    let samples_f64: Vec<f64> = samples.iter().map(|s| *s as f64).collect();
    let spectrogram = stft(&samples_f64, FFT_SIZE, HOP_LENGTH);
    if spectrogram.is_empty() {
        return None;
    }
    let freqs = bin_frequencies(FFT_SIZE, sample_rate as f64);
    let frames = chroma_frames(&spectrogram, &freqs);

    let mut bytes = Vec::with_capacity(frames.len());
    for frame in &frames {
        let (dominant, peak) = frame
            .iter()
            .enumerate()
            .fold((0usize, 0.0f64), |(bi, bv), (i, v)| {
                if *v > bv {
                    (i, *v)
                } else {
                    (bi, bv)
                }
            });
        let energy: f64 = frame.iter().sum::<f64>() / frame.len() as f64;
        let quantized_energy = if peak > 0.0 {
            ((energy * 15.0).round() as u8).min(15)
        } else {
            0
        };
        bytes.push(((dominant as u8) << 4) | quantized_energy);
    }

    Some(general_purpose::STANDARD_NO_PAD.encode(&bytes))
}

/// Hamming similarity over the first [`COMPARE_SYMBOLS`] symbols.
pub fn chromaprint_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let a: Vec<char> = a.chars().take(COMPARE_SYMBOLS).collect();
    let b: Vec<char> = b.chars().take(COMPARE_SYMBOLS).collect();
    let compared = a.len().min(b.len());
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 0.0;
    }

    // Length mismatch within the prefix counts as distance
    let mut distance = max_len - compared;
    for i in 0..compared {
        if a[i] != b[i] {
            distance += 1;
        }
    }

    1.0 - distance as f64 / max_len as f64
}

/// Similarity between two fingerprints: chroma-sequence Hamming when
/// both carry one, exact-hash equality otherwise.
pub fn compare(a: &FingerprintData, b: &FingerprintData) -> f64 {
    match (&a.chromaprint, &b.chromaprint) {
        (Some(cp_a), Some(cp_b)) => chromaprint_similarity(cp_a, cp_b),
        _ => {
            if a.hash == b.hash {
                1.0
            } else {
                0.0
            }
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
