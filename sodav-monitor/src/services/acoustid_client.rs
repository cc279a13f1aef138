//! AcoustID API client
//!
//! Fingerprint lookup against the AcoustID service with a database-backed
//! response cache, a token-bucket rate limit and bounded retries. Only
//! network errors and 5xx responses are retried; auth failures disable
//! the provider upstream.

use crate::error::{DetectError, DetectResult};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ACOUSTID_BASE_URL: &str = "https://api.acoustid.org/v2/lookup";
const USER_AGENT: &str = "SODAV-Monitor/0.1 (https://sodav.sn)";

type DirectLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// AcoustID lookup response envelope
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AcoustIdResponse {
    pub status: String,
    #[serde(default)]
    pub results: Vec<AcoustIdResult>,
}

/// One fingerprint match
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AcoustIdResult {
    pub id: String,
    pub score: f64,
    pub recordings: Option<Vec<AcoustIdRecording>>,
}

/// MusicBrainz recording reference inside a match
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AcoustIdRecording {
    pub id: String,
    pub title: Option<String>,
    pub artists: Option<Vec<AcoustIdArtist>>,
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AcoustIdArtist {
    pub id: String,
    pub name: String,
}

/// Best-scoring `(score, recording)` pair extracted from a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcoustIdHit {
    pub score: f64,
    pub recording_mbid: String,
    pub title: Option<String>,
    pub artist: Option<String>,
}

/// AcoustID client with response caching
pub struct AcoustIdClient {
    http_client: reqwest::Client,
    rate_limiter: Arc<DirectLimiter>,
    api_key: String,
    max_retries: u32,
    request_timeout: Duration,
    db: sqlx::SqlitePool,
    attempts: AtomicU64,
}

impl AcoustIdClient {
    pub fn new(
        api_key: String,
        db: sqlx::SqlitePool,
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
                provider: "acoustid".to_string(),
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
            db,
            attempts: AtomicU64::new(0),
        })
    }

    /// Total lookup attempts issued (retries included); exposed for
    /// operational metrics.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Look up a fingerprint, returning the best-scoring hit.
    ///
    /// Consults the cache first; on a network hit, caches the result.
    /// Retries transient failures with 1s/2s/4s backoff up to the retry
    /// cap, then surfaces the last error.
    pub async fn lookup(
        &self,
        fingerprint: &str,
        duration_s: u64,
    ) -> DetectResult<Option<AcoustIdHit>> {
        if let Some(hit) = self.cached_hit(fingerprint).await? {
            tracing::debug!("AcoustID cache hit");
            return Ok(Some(hit));
        }

        let mut attempt = 0u32;
        let response = loop {
            attempt += 1;

            // Token bucket: exhaustion blocks up to the deadline, then
            // fails through as a transient error.
            if tokio::time::timeout(self.request_timeout, self.rate_limiter.until_ready())
                .await
                .is_err()
            {
                return Err(DetectError::ProviderTransient {
                    provider: "acoustid".to_string(),
                    message: "rate limit exhausted".to_string(),
                });
            }

            self.attempts.fetch_add(1, Ordering::Relaxed);
            match self.lookup_once(fingerprint, duration_s).await {
                Ok(response) => break response,
                Err(err @ DetectError::ProviderTransient { .. }) if attempt < self.max_retries => {
                    let backoff = Duration::from_secs(1 << (attempt - 1));
                    tracing::warn!(
                        attempt,
                        backoff_s = backoff.as_secs(),
                        error = %err,
                        "AcoustID transient failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        };

        let hit = best_hit(&response);
        if let Some(hit) = &hit {
            tracing::info!(
                mbid = %hit.recording_mbid,
                score = hit.score,
                "AcoustID lookup successful"
            );
            if let Err(e) = self.cache_hit(fingerprint, hit).await {
                tracing::warn!("failed to cache AcoustID result: {}", e);
            }
        }
        Ok(hit)
    }

    async fn lookup_once(
        &self,
        fingerprint: &str,
        duration_s: u64,
    ) -> DetectResult<AcoustIdResponse> {
        let duration = duration_s.to_string();
        let params = [
            ("client", self.api_key.as_str()),
            ("duration", duration.as_str()),
            ("fingerprint", fingerprint),
            ("meta", "recordings releases"),
        ];

        let response = self
            .http_client
            .post(ACOUSTID_BASE_URL)
            .form(&params)
            .send()
            .await
            .map_err(|e| DetectError::ProviderTransient {
                provider: "acoustid".to_string(),
                message: format!("network error: {}", e),
            })?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(DetectError::ProviderPermanent {
                provider: "acoustid".to_string(),
                message: "invalid API key".to_string(),
            });
        }
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(DetectError::ProviderTransient {
                provider: "acoustid".to_string(),
                message: format!("HTTP {}", status),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DetectError::ProviderPermanent {
                provider: "acoustid".to_string(),
                message: format!("HTTP {}: {}", status, body),
            });
        }

        response
            .json()
            .await
            .map_err(|e| DetectError::ProviderPermanent {
                provider: "acoustid".to_string(),
                message: format!("malformed response: {}", e),
            })
    }

    fn hash_fingerprint(fingerprint: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(fingerprint.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    async fn cached_hit(&self, fingerprint: &str) -> DetectResult<Option<AcoustIdHit>> {
        let key = Self::hash_fingerprint(fingerprint);
        let row: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM acoustid_cache WHERE fingerprint_hash = ?")
                .bind(&key)
                .fetch_optional(&self.db)
                .await?;

        match row {
            Some((payload,)) => match serde_json::from_str(&payload) {
                Ok(hit) => Ok(Some(hit)),
                Err(e) => {
                    tracing::warn!("discarding unreadable AcoustID cache entry: {}", e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn cache_hit(&self, fingerprint: &str, hit: &AcoustIdHit) -> DetectResult<()> {
        let key = Self::hash_fingerprint(fingerprint);
        let payload = serde_json::to_string(hit).map_err(|e| DetectError::ProviderPermanent {
            provider: "acoustid".to_string(),
            message: format!("cache serialize failed: {}", e),
        })?;

        sqlx::query(
            r#"
            INSERT INTO acoustid_cache (fingerprint_hash, payload, cached_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(fingerprint_hash) DO UPDATE SET
                payload = excluded.payload,
                cached_at = excluded.cached_at
            "#,
        )
        .bind(&key)
        .bind(&payload)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

/// Pull the best-scoring recording out of a response.
fn best_hit(response: &AcoustIdResponse) -> Option<AcoustIdHit> {
    let best = response
        .results
        .iter()
        .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))?;
    let recording = best.recordings.as_ref()?.first()?;

    Some(AcoustIdHit {
        score: best.score.clamp(0.0, 1.0),
        recording_mbid: recording.id.clone(),
        title: recording.title.clone(),
        artist: recording
            .artists
            .as_ref()
            .and_then(|a| a.first())
            .map(|a| a.name.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_schema;
    use sodav_common::db::init_memory_pool;

    fn sample_response() -> AcoustIdResponse {
        AcoustIdResponse {
            status: "ok".to_string(),
            results: vec![
                AcoustIdResult {
                    id: "low".to_string(),
                    score: 0.4,
                    recordings: Some(vec![AcoustIdRecording {
                        id: "mbid-low".to_string(),
                        title: None,
                        artists: None,
                        duration: None,
                    }]),
                },
                AcoustIdResult {
                    id: "high".to_string(),
                    score: 0.92,
                    recordings: Some(vec![AcoustIdRecording {
                        id: "mbid-high".to_string(),
                        title: Some("Set".to_string()),
                        artists: Some(vec![AcoustIdArtist {
                            id: "artist".to_string(),
                            name: "Youssou N'Dour".to_string(),
                        }]),
                        duration: Some(240.0),
                    }]),
                },
            ],
        }
    }

    #[test]
    fn test_best_hit_picks_highest_score() {
        let hit = best_hit(&sample_response()).unwrap();
        assert_eq!(hit.recording_mbid, "mbid-high");
        assert!((hit.score - 0.92).abs() < 1e-9);
        assert_eq!(hit.artist.as_deref(), Some("Youssou N'Dour"));
    }

    #[test]
    fn test_best_hit_empty_results() {
        let response = AcoustIdResponse {
            status: "ok".to_string(),
            results: vec![],
        };
        assert!(best_hit(&response).is_none());
    }

    #[test]
    fn test_response_parses_without_results_field() {
        let parsed: AcoustIdResponse = serde_json::from_str(r#"{"status":"ok"}"#).unwrap();
        assert!(parsed.results.is_empty());
    }

    #[test]
    fn test_fingerprint_hash_stable() {
        let a = AcoustIdClient::hash_fingerprint("AQADtN");
        let b = AcoustIdClient::hash_fingerprint("AQADtN");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    async fn test_client() -> AcoustIdClient {
        let pool = init_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        AcoustIdClient::new(
            "test-key".to_string(),
            pool,
            3,
            Duration::from_secs(10),
            3,
            60,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_cache_round_trip() {
        let client = test_client().await;
        let hit = AcoustIdHit {
            score: 0.82,
            recording_mbid: "mbid-123".to_string(),
            title: Some("Tajabone".to_string()),
            artist: Some("Ismael Lo".to_string()),
        };

        assert!(client.cached_hit("fp").await.unwrap().is_none());
        client.cache_hit("fp", &hit).await.unwrap();

        let cached = client.cached_hit("fp").await.unwrap().unwrap();
        assert_eq!(cached.recording_mbid, "mbid-123");
        assert!((cached.score - 0.82).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cache_upsert_overwrites() {
        let client = test_client().await;
        let first = AcoustIdHit {
            score: 0.5,
            recording_mbid: "old".to_string(),
            title: None,
            artist: None,
        };
        let second = AcoustIdHit {
            score: 0.9,
            recording_mbid: "new".to_string(),
            title: None,
            artist: None,
        };

        client.cache_hit("fp", &first).await.unwrap();
        client.cache_hit("fp", &second).await.unwrap();

        let cached = client.cached_hit("fp").await.unwrap().unwrap();
        assert_eq!(cached.recording_mbid, "new");
    }
}
