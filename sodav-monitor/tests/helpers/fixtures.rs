//! Synthetic pipeline fixtures

use sodav_monitor::types::{
    AudioFeatures, DetectionMethod, FingerprintData, MatchSource, RecognitionMatch, TrackMetadata,
};

/// Fingerprint whose identity is controlled by `tag`: same tag, same
/// print; different tags are fully dissimilar.
pub fn fingerprint(tag: u8) -> FingerprintData {
    FingerprintData {
        hash: format!("{:02x}", tag).repeat(32),
        raw: vec![tag; 32],
        chromaprint: Some(char::from(b'A' + (tag % 26)).to_string().repeat(48)),
    }
}

/// Features that pass the music gate.
pub fn music_features() -> AudioFeatures {
    AudioFeatures {
        music_likelihood: 82.0,
        bass_pct: 32.0,
        mid_pct: 41.0,
        high_pct: 27.0,
        rhythm_strength: 64.0,
        ..Default::default()
    }
}

/// An external-provider style match carrying full metadata.
pub fn provider_match(
    title: &str,
    artist: &str,
    isrc: Option<&str>,
    method: DetectionMethod,
    confidence: f64,
) -> RecognitionMatch {
    let source = match method {
        DetectionMethod::Audd => MatchSource::Audd,
        _ => MatchSource::AcoustId,
    };
    RecognitionMatch {
        track_id: None,
        metadata: TrackMetadata {
            title: title.to_string(),
            artist: artist.to_string(),
            isrc: isrc.map(str::to_string),
            ..Default::default()
        },
        fingerprint: None,
        confidence,
        source,
        detection_method: method,
    }
}
