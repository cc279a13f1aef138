//! Station health probing
//!
//! Lightweight HEAD probe against a station's stream URL, classifying
//! the endpoint as serving audio, reachable-but-not-audio, or
//! unreachable, with the observed latency. The supervisor drives these
//! on its health-check rhythm and persists each outcome as history.

use std::time::{Duration, Instant};

const USER_AGENT: &str = "SODAV-Monitor/0.1 (https://sodav.sn)";

/// Probe classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// Endpoint answered and advertises an audio content type
    Audio,
    /// Endpoint answered but does not look like an audio stream
    Available,
    /// Endpoint unreachable or returned an error status
    Unavailable,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Audio => "audio",
            ProbeStatus::Available => "available",
            ProbeStatus::Unavailable => "unavailable",
        }
    }

    /// Only an audio-serving endpoint counts as healthy for monitoring.
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeStatus::Audio)
    }
}

/// One probe outcome.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub status: ProbeStatus,
    pub latency_ms: u64,
    pub content_type: Option<String>,
    pub error: Option<String>,
}

/// Stream health checker.
#[derive(Clone)]
pub struct StreamChecker {
    http_client: reqwest::Client,
}

impl StreamChecker {
    pub fn new(timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { http_client }
    }

    /// Probe a stream URL.
    pub async fn check(&self, stream_url: &str) -> ProbeResult {
        let started = Instant::now();
        let response = self.http_client.head(stream_url).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match response {
            Ok(response) => {
                let status = response.status();
                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);

                if !status.is_success() {
                    return ProbeResult {
                        status: ProbeStatus::Unavailable,
                        latency_ms,
                        content_type,
                        error: Some(format!("HTTP {}", status)),
                    };
                }

                let is_audio = content_type
                    .as_deref()
                    .map(|ct| {
                        let mime = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
                        mime.starts_with("audio/") || mime == "application/ogg"
                    })
                    .unwrap_or(false);

                ProbeResult {
                    status: if is_audio {
                        ProbeStatus::Audio
                    } else {
                        ProbeStatus::Available
                    },
                    latency_ms,
                    content_type,
                    error: None,
                }
            }
            Err(e) => ProbeResult {
                status: ProbeStatus::Unavailable,
                latency_ms,
                content_type: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(ProbeStatus::Audio.as_str(), "audio");
        assert_eq!(ProbeStatus::Available.as_str(), "available");
        assert_eq!(ProbeStatus::Unavailable.as_str(), "unavailable");
    }

    #[test]
    fn test_only_audio_is_healthy() {
        assert!(ProbeStatus::Audio.is_healthy());
        assert!(!ProbeStatus::Available.is_healthy());
        assert!(!ProbeStatus::Unavailable.is_healthy());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unavailable() {
        let checker = StreamChecker::new(Duration::from_millis(500));
        // Reserved TEST-NET address, nothing listens there
        let result = checker.check("http://192.0.2.1:9/stream").await;
        assert_eq!(result.status, ProbeStatus::Unavailable);
        assert!(result.error.is_some());
    }
}
