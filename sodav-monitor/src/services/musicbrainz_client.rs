//! MusicBrainz API client
//!
//! Resolves an AcoustID recording MBID to full metadata: title, artist
//! credit, ISRC list, label and release date. Rate limited to the
//! 1 request/second MusicBrainz policy.

use crate::error::{DetectError, DetectResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const MUSICBRAINZ_BASE_URL: &str = "https://musicbrainz.org/ws/2";
const USER_AGENT: &str = "SODAV-Monitor/0.1 (https://sodav.sn)";
const RATE_LIMIT_MS: u64 = 1000;

/// MusicBrainz recording response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MbRecording {
    pub id: String,
    pub title: String,
    /// Recording length in milliseconds
    pub length: Option<u64>,
    #[serde(rename = "artist-credit", default)]
    pub artist_credit: Vec<MbArtistCredit>,
    #[serde(default)]
    pub isrcs: Vec<String>,
    pub releases: Option<Vec<MbRelease>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MbArtistCredit {
    pub name: String,
    pub artist: MbArtist,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MbArtist {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MbRelease {
    pub id: String,
    pub title: String,
    pub date: Option<String>,
    #[serde(rename = "label-info")]
    pub label_info: Option<Vec<MbLabelInfo>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MbLabelInfo {
    pub label: Option<MbLabel>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MbLabel {
    pub name: String,
}

impl MbRecording {
    /// Joined artist credit names ("A feat. B" arrives as separate credits).
    pub fn artist_name(&self) -> Option<String> {
        if self.artist_credit.is_empty() {
            return None;
        }
        Some(
            self.artist_credit
                .iter()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        )
    }

    /// First ISRC attached to the recording, raw (caller validates).
    pub fn first_isrc(&self) -> Option<&str> {
        self.isrcs.first().map(String::as_str)
    }

    /// Label of the first release carrying one.
    pub fn label(&self) -> Option<&str> {
        self.releases.as_ref()?.iter().find_map(|release| {
            release
                .label_info
                .as_ref()?
                .iter()
                .find_map(|info| info.label.as_ref().map(|l| l.name.as_str()))
        })
    }

    /// Earliest release date among the releases.
    pub fn release_date(&self) -> Option<&str> {
        self.releases
            .as_ref()?
            .iter()
            .filter_map(|r| r.date.as_deref())
            .min()
    }
}

/// Rate limiter enforcing one request per second
struct RateGate {
    last_request: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateGate {
    fn new(min_interval_ms: u64) -> Self {
        Self {
            last_request: Mutex::new(None),
            min_interval: Duration::from_millis(min_interval_ms),
        }
    }

    async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// MusicBrainz API client
pub struct MusicBrainzClient {
    http_client: reqwest::Client,
    rate_gate: Arc<RateGate>,
}

impl MusicBrainzClient {
    pub fn new(request_timeout: Duration) -> DetectResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| DetectError::ProviderPermanent {
                provider: "musicbrainz".to_string(),
                message: format!("HTTP client build failed: {}", e),
            })?;

        Ok(Self {
            http_client,
            rate_gate: Arc::new(RateGate::new(RATE_LIMIT_MS)),
        })
    }

    /// Lookup a recording by MBID with ISRCs, labels and releases inlined.
    pub async fn lookup_recording(&self, mbid: &str) -> DetectResult<MbRecording> {
        self.rate_gate.wait().await;

        let url = format!(
            "{}/recording/{}?inc=artist-credits+releases+isrcs+labels&fmt=json",
            MUSICBRAINZ_BASE_URL, mbid
        );

        tracing::debug!(mbid = %mbid, "querying MusicBrainz");

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| DetectError::ProviderTransient {
                provider: "musicbrainz".to_string(),
                message: format!("network error: {}", e),
            })?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(DetectError::ProviderPermanent {
                provider: "musicbrainz".to_string(),
                message: format!("recording not found: {}", mbid),
            });
        }
        if status.as_u16() == 503 || status.is_server_error() {
            return Err(DetectError::ProviderTransient {
                provider: "musicbrainz".to_string(),
                message: format!("HTTP {}", status),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DetectError::ProviderPermanent {
                provider: "musicbrainz".to_string(),
                message: format!("HTTP {}: {}", status, body),
            });
        }

        let recording: MbRecording =
            response
                .json()
                .await
                .map_err(|e| DetectError::ProviderPermanent {
                    provider: "musicbrainz".to_string(),
                    message: format!("malformed response: {}", e),
                })?;

        tracing::info!(
            mbid = %mbid,
            title = %recording.title,
            artist = recording.artist_name().as_deref().unwrap_or("Unknown"),
            "retrieved recording from MusicBrainz"
        );

        Ok(recording)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "id": "rec-mbid",
        "title": "Set",
        "length": 243000,
        "artist-credit": [
            {"name": "Youssou N'Dour", "artist": {"id": "a1", "name": "Youssou N'Dour"}}
        ],
        "isrcs": ["SNA010000001", "SNA010000002"],
        "releases": [
            {"id": "r1", "title": "Set", "date": "1990-05-01",
             "label-info": [{"label": {"name": "Virgin"}}]},
            {"id": "r2", "title": "Set (reissue)", "date": "1989-11-01", "label-info": []}
        ]
    }"#;

    #[test]
    fn test_parse_full_recording() {
        let recording: MbRecording = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(recording.title, "Set");
        assert_eq!(recording.artist_name().as_deref(), Some("Youssou N'Dour"));
        assert_eq!(recording.first_isrc(), Some("SNA010000001"));
        assert_eq!(recording.label(), Some("Virgin"));
        // Earliest date wins
        assert_eq!(recording.release_date(), Some("1989-11-01"));
    }

    #[test]
    fn test_parse_minimal_recording() {
        let recording: MbRecording =
            serde_json::from_str(r#"{"id": "x", "title": "Untitled"}"#).unwrap();
        assert!(recording.artist_name().is_none());
        assert!(recording.first_isrc().is_none());
        assert!(recording.label().is_none());
        assert!(recording.release_date().is_none());
    }

    #[test]
    fn test_multiple_artist_credits_joined() {
        let recording: MbRecording = serde_json::from_str(
            r#"{
                "id": "x", "title": "Duet",
                "artist-credit": [
                    {"name": "A", "artist": {"id": "1", "name": "A"}},
                    {"name": "B", "artist": {"id": "2", "name": "B"}}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(recording.artist_name().as_deref(), Some("A, B"));
    }

    #[tokio::test]
    async fn test_rate_gate_spaces_requests() {
        let gate = RateGate::new(100);
        let start = Instant::now();
        gate.wait().await;
        gate.wait().await;
        gate.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(180));
    }
}
