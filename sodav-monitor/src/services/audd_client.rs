//! AudD API client
//!
//! Commercial fallback recognizer: posts the raw window audio as a WAV
//! attachment and parses the result envelope. ISRCs may surface at the
//! top level or nested under the streaming-service blocks; the first
//! syntactically plausible one wins (full validation happens in the
//! identity resolver).

use crate::error::{DetectError, DetectResult};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sodav_common::isrc;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

const AUDD_BASE_URL: &str = "https://api.audd.io/";
const USER_AGENT: &str = "SODAV-Monitor/0.1 (https://sodav.sn)";

/// AudD carries no numeric score; a successful identification is
/// reported at this fixed confidence.
pub const AUDD_DEFAULT_CONFIDENCE: f64 = 0.8;

type DirectLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// AudD response envelope
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuddResponse {
    pub status: String,
    pub result: Option<AuddResult>,
}

/// AudD identification payload
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuddResult {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub label: Option<String>,
    pub release_date: Option<String>,
    pub isrc: Option<String>,
    pub apple_music: Option<Value>,
    pub spotify: Option<Value>,
    pub deezer: Option<Value>,
}

impl AuddResult {
    /// First syntactically plausible ISRC, searched in source order:
    /// top level, Apple Music, Spotify external ids, Deezer.
    pub fn extract_isrc(&self) -> Option<String> {
        let candidates = [
            self.isrc.clone(),
            self.apple_music
                .as_ref()
                .and_then(|v| v.get("isrc"))
                .and_then(Value::as_str)
                .map(str::to_string),
            self.spotify
                .as_ref()
                .and_then(|v| v.get("external_ids"))
                .and_then(|v| v.get("isrc"))
                .and_then(Value::as_str)
                .map(str::to_string),
            self.deezer
                .as_ref()
                .and_then(|v| v.get("isrc"))
                .and_then(Value::as_str)
                .map(str::to_string),
        ];

        candidates.into_iter().flatten().find_map(|raw| {
            let normalized = isrc::normalize(&raw);
            if normalized.len() == 12 && normalized.chars().all(|c| c.is_ascii_alphanumeric()) {
                Some(normalized)
            } else {
                tracing::warn!(isrc = %raw, "discarding malformed ISRC from AudD");
                None
            }
        })
    }

    /// First label found across the same source order.
    pub fn extract_label(&self) -> Option<String> {
        self.label.clone().or_else(|| {
            self.apple_music
                .as_ref()
                .and_then(|v| v.get("label"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
    }

    /// First release date across the same source order.
    pub fn extract_release_date(&self) -> Option<String> {
        self.release_date.clone().or_else(|| {
            self.apple_music
                .as_ref()
                .and_then(|v| v.get("release_date"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
    }
}

/// AudD client
pub struct AuddClient {
    http_client: reqwest::Client,
    rate_limiter: Arc<DirectLimiter>,
    api_key: String,
    max_retries: u32,
    request_timeout: Duration,
}

impl AuddClient {
    pub fn new(
        api_key: String,
        max_retries: u32,
        request_timeout: Duration,
        rate_burst: u32,
        rate_per_minute: u32,
    ) -> DetectResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| DetectError::ProviderPermanent {
                provider: "audd".to_string(),
                message: format!("HTTP client build failed: {}", e),
            })?;

        let per_minute = NonZeroU32::new(rate_per_minute.max(1)).unwrap();
        let burst = NonZeroU32::new(rate_burst.max(1)).unwrap();
        let quota = Quota::per_minute(per_minute).allow_burst(burst);

        Ok(Self {
            http_client,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            api_key,
            max_retries,
            request_timeout,
        })
    }

    /// Identify a PCM window. Returns `None` when AudD has no match.
    pub async fn recognize(
        &self,
        samples: &[f32],
        sample_rate: u32,
    ) -> DetectResult<Option<AuddResult>> {
        let wav = wav_from_pcm(samples, sample_rate);

        let mut attempt = 0u32;
        loop {
            attempt += 1;

            if tokio::time::timeout(self.request_timeout, self.rate_limiter.until_ready())
                .await
                .is_err()
            {
                return Err(DetectError::ProviderTransient {
                    provider: "audd".to_string(),
                    message: "rate limit exhausted".to_string(),
                });
            }

            match self.recognize_once(wav.clone()).await {
                Ok(result) => return Ok(result),
                Err(err @ DetectError::ProviderTransient { .. }) if attempt < self.max_retries => {
                    let backoff = Duration::from_secs(1 << (attempt - 1));
                    tracing::warn!(
                        attempt,
                        backoff_s = backoff.as_secs(),
                        error = %err,
                        "AudD transient failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn recognize_once(&self, wav: Vec<u8>) -> DetectResult<Option<AuddResult>> {
        let file_part = reqwest::multipart::Part::bytes(wav)
            .file_name("window.wav")
            .mime_str("audio/wav")
            .map_err(|e| DetectError::ProviderPermanent {
                provider: "audd".to_string(),
                message: format!("multipart build failed: {}", e),
            })?;

        let form = reqwest::multipart::Form::new()
            .text("api_token", self.api_key.clone())
            .text("return", "apple_music,spotify,deezer")
            .part("file", file_part);

        let response = self
            .http_client
            .post(AUDD_BASE_URL)
            .multipart(form)
            .send()
            .await
            .map_err(|e| DetectError::ProviderTransient {
                provider: "audd".to_string(),
                message: format!("network error: {}", e),
            })?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(DetectError::ProviderTransient {
                provider: "audd".to_string(),
                message: format!("HTTP {}", status),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DetectError::ProviderPermanent {
                provider: "audd".to_string(),
                message: format!("HTTP {}: {}", status, body),
            });
        }

        let envelope: AuddResponse =
            response
                .json()
                .await
                .map_err(|e| DetectError::ProviderPermanent {
                    provider: "audd".to_string(),
                    message: format!("malformed response: {}", e),
                })?;

        if envelope.status != "success" {
            return Err(DetectError::ProviderPermanent {
                provider: "audd".to_string(),
                message: format!("error envelope: status={}", envelope.status),
            });
        }

        Ok(envelope.result)
    }
}

/// Encode mono f32 PCM as a 16-bit WAV file in memory.
pub fn wav_from_pcm(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let byte_rate = sample_rate * 2;
    let mut out = Vec::with_capacity(44 + data_len as usize);

    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes()); // block align
    out.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());

    for sample in samples {
        let quantized = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        out.extend_from_slice(&quantized.to_le_bytes());
    }

    out
}
