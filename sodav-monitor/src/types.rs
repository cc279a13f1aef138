//! Shared value types for the detection pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One decoded block of mono PCM with its capture timestamp.
///
/// The fetcher emits fixed-size chunks (4096 samples at the configured
/// rate); the worker glues them into analysis windows.
#[derive(Debug, Clone)]
pub struct PcmChunk {
    pub samples: Vec<f32>,
    pub captured_at: DateTime<Utc>,
}

/// A full analysis window assembled from consecutive chunks.
#[derive(Debug, Clone)]
pub struct AudioWindow {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Capture time of the first chunk in the window
    pub captured_at: DateTime<Utc>,
}

impl AudioWindow {
    pub fn duration_s(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Spectral and rhythm features extracted from one window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioFeatures {
    /// Mean MFCC vector (13 coefficients)
    pub mfcc_mean: Vec<f64>,
    /// Mean chroma vector (12 semitones)
    pub chroma_mean: Vec<f64>,
    pub spectral_centroid: f64,
    pub spectral_bandwidth: f64,
    pub spectral_rolloff: f64,
    pub zero_crossing_rate: f64,
    pub rms_energy: f64,
    pub tempo_bpm: f64,
    /// Band energy shares in percent; the three sum to ~100
    pub bass_pct: f64,
    pub mid_pct: f64,
    pub high_pct: f64,
    /// Onset-autocorrelation rhythm strength, 0-100
    pub rhythm_strength: f64,
    pub spectral_flux: f64,
    pub centroid_variance: f64,
    /// Heuristic music score, 0-100
    pub music_likelihood: f64,
    pub duration_s: f64,
}

/// Content fingerprint of one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintData {
    /// Hex-encoded 32-byte digest over the canonical feature serialization
    pub hash: String,
    /// Raw digest bytes
    pub raw: Vec<u8>,
    /// Chromaprint-style chroma-sequence encoding, when an encoder produced one
    pub chromaprint: Option<String>,
}

/// How a match was established; persisted on every Detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    LocalExact,
    LocalFuzzy,
    AcoustId,
    Audd,
    IsrcMatch,
    Manual,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::LocalExact => "local_exact",
            DetectionMethod::LocalFuzzy => "local_fuzzy",
            DetectionMethod::AcoustId => "acoustid",
            DetectionMethod::Audd => "audd",
            DetectionMethod::IsrcMatch => "isrc_match",
            DetectionMethod::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local_exact" => Some(DetectionMethod::LocalExact),
            "local_fuzzy" => Some(DetectionMethod::LocalFuzzy),
            "acoustid" => Some(DetectionMethod::AcoustId),
            "audd" => Some(DetectionMethod::Audd),
            "isrc_match" => Some(DetectionMethod::IsrcMatch),
            "manual" => Some(DetectionMethod::Manual),
            _ => None,
        }
    }
}

/// Which component produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Local,
    AcoustId,
    Audd,
}

impl MatchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchSource::Local => "local",
            MatchSource::AcoustId => "acoustid",
            MatchSource::Audd => "audd",
        }
    }
}

/// Normalized track metadata carried by a recognition match.
///
/// External providers fill these from their own envelopes; the local
/// matcher fills them from the matched Track row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub isrc: Option<String>,
    pub label: Option<String>,
    pub release_date: Option<String>,
    pub duration_s: Option<f64>,
}

/// A positive recognition result, normalized across sources.
#[derive(Debug, Clone)]
pub struct RecognitionMatch {
    /// Track row id when the match came from the local index
    pub track_id: Option<i64>,
    pub metadata: TrackMetadata,
    /// Fingerprint captured for this window, attached by the orchestrator
    pub fingerprint: Option<FingerprintData>,
    /// Provider score normalized to [0, 1]
    pub confidence: f64,
    pub source: MatchSource,
    pub detection_method: DetectionMethod,
}

/// Why a play ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    DifferentTrack,
    SilenceDetected,
    StreamDrop,
    StationStop,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::DifferentTrack => "different_track",
            EndReason::SilenceDetected => "silence_detected",
            EndReason::StreamDrop => "stream_drop",
            EndReason::StationStop => "station_stop",
        }
    }
}
