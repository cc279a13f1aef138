//! External recognition chain
//!
//! Second rung of the recognition hierarchy: AcoustID resolved through
//! MusicBrainz, then AudD. Providers are skipped when unconfigured or
//! disabled; transient failures fall through to the next provider, and
//! permanent failures disable the provider for the process lifetime and
//! raise an operator event.

use crate::config::Settings;
use crate::error::{DetectError, DetectResult};
use crate::services::acoustid_client::AcoustIdClient;
use crate::services::audd_client::{AuddClient, AUDD_DEFAULT_CONFIDENCE};
use crate::services::musicbrainz_client::MusicBrainzClient;
use crate::types::{
    AudioFeatures, AudioWindow, DetectionMethod, FingerprintData, MatchSource, RecognitionMatch,
    TrackMetadata,
};
use sodav_common::{isrc, EventBus, MonitorEvent};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Chain of external recognition providers.
pub struct ExternalRecognizer {
    acoustid: Option<AcoustIdClient>,
    musicbrainz: Option<MusicBrainzClient>,
    audd: Option<AuddClient>,
    acoustid_disabled: AtomicBool,
    audd_disabled: AtomicBool,
    acoustid_threshold: f64,
    audd_threshold: f64,
    event_bus: EventBus,
}

impl ExternalRecognizer {
    /// Build the chain from settings. A provider with no API key (or
    /// switched off) simply never joins the chain.
    pub fn new(settings: &Settings, db: SqlitePool, event_bus: EventBus) -> DetectResult<Self> {
        let timeout = settings.request_timeout_duration();

        let acoustid = match (&settings.acoustid_api_key, settings.acoustid_enabled) {
            (Some(key), true) => Some(AcoustIdClient::new(
                key.clone(),
                db.clone(),
                settings.max_retries,
                timeout,
                settings.provider_rate_burst,
                settings.provider_rate_per_minute,
            )?),
            _ => {
                tracing::warn!("AcoustID provider not configured, skipping in chain");
                None
            }
        };

        let musicbrainz = if acoustid.is_some() {
            Some(MusicBrainzClient::new(timeout)?)
        } else {
            None
        };

        let audd = match (&settings.audd_api_key, settings.audd_enabled) {
            (Some(key), true) => Some(AuddClient::new(
                key.clone(),
                settings.max_retries,
                timeout,
                settings.provider_rate_burst,
                settings.provider_rate_per_minute,
            )?),
            _ => {
                tracing::warn!("AudD provider not configured, skipping in chain");
                None
            }
        };

        Ok(Self {
            acoustid,
            musicbrainz,
            audd,
            acoustid_disabled: AtomicBool::new(false),
            audd_disabled: AtomicBool::new(false),
            acoustid_threshold: settings.acoustid_confidence_threshold,
            audd_threshold: settings.audd_confidence_threshold,
            event_bus,
        })
    }

    /// Run the provider chain for one window.
    ///
    /// Returns `None` when every provider misses or is unavailable.
    /// `Err(Cancelled)` is the only error surfaced; everything else is
    /// absorbed into fall-through.
    pub async fn find(
        &self,
        window: &AudioWindow,
        _features: &AudioFeatures,
        fingerprint: &FingerprintData,
        cancel: &CancellationToken,
    ) -> DetectResult<Option<RecognitionMatch>> {
        if let Some(found) = self.try_acoustid(window, fingerprint, cancel).await? {
            return Ok(Some(found));
        }
        if let Some(found) = self.try_audd(window, cancel).await? {
            return Ok(Some(found));
        }
        Ok(None)
    }

    async fn try_acoustid(
        &self,
        window: &AudioWindow,
        fingerprint: &FingerprintData,
        cancel: &CancellationToken,
    ) -> DetectResult<Option<RecognitionMatch>> {
        let (Some(client), Some(mb)) = (&self.acoustid, &self.musicbrainz) else {
            return Ok(None);
        };
        if self.acoustid_disabled.load(Ordering::Relaxed) {
            return Ok(None);
        }
        let Some(chromaprint) = &fingerprint.chromaprint else {
            tracing::debug!("no chroma encoding for window, skipping AcoustID");
            return Ok(None);
        };

        let duration_s = window.duration_s().round() as u64;
        let lookup = tokio::select! {
            result = client.lookup(chromaprint, duration_s) => result,
            _ = cancel.cancelled() => return Err(DetectError::Cancelled),
        };

        let hit = match lookup {
            Ok(Some(hit)) => hit,
            Ok(None) => return Ok(None),
            Err(err) => return self.absorb("acoustid", &self.acoustid_disabled, err),
        };

        if hit.score < self.acoustid_threshold {
            tracing::debug!(
                score = hit.score,
                threshold = self.acoustid_threshold,
                "AcoustID hit below threshold"
            );
            return Ok(None);
        }

        let recording = tokio::select! {
            result = mb.lookup_recording(&hit.recording_mbid) => result,
            _ = cancel.cancelled() => return Err(DetectError::Cancelled),
        };

        let metadata = match recording {
            Ok(recording) => TrackMetadata {
                title: recording.title.clone(),
                artist: recording
                    .artist_name()
                    .unwrap_or_else(|| "Unknown Artist".to_string()),
                album: recording.releases.as_ref().and_then(|r| r.first()).map(|r| r.title.clone()),
                isrc: recording.first_isrc().and_then(isrc::normalize_valid),
                label: recording.label().map(str::to_string),
                release_date: recording.release_date().map(str::to_string),
                duration_s: recording.length.map(|ms| ms as f64 / 1000.0),
            },
            Err(err) => {
                // MusicBrainz outage: fall back to the thin AcoustID
                // metadata rather than losing the identification.
                tracing::warn!(error = %err, "MusicBrainz resolution failed, using AcoustID metadata");
                let Some(title) = hit.title.clone() else {
                    return Ok(None);
                };
                TrackMetadata {
                    title,
                    artist: hit.artist.clone().unwrap_or_else(|| "Unknown Artist".to_string()),
                    ..Default::default()
                }
            }
        };

        tracing::info!(
            title = %metadata.title,
            artist = %metadata.artist,
            score = hit.score,
            "AcoustID match"
        );

        Ok(Some(RecognitionMatch {
            track_id: None,
            metadata,
            fingerprint: Some(fingerprint.clone()),
            confidence: hit.score,
            source: MatchSource::AcoustId,
            detection_method: DetectionMethod::AcoustId,
        }))
    }

    async fn try_audd(
        &self,
        window: &AudioWindow,
        cancel: &CancellationToken,
    ) -> DetectResult<Option<RecognitionMatch>> {
        let Some(client) = &self.audd else {
            return Ok(None);
        };
        if self.audd_disabled.load(Ordering::Relaxed) {
            return Ok(None);
        }

        let recognized = tokio::select! {
            result = client.recognize(&window.samples, window.sample_rate) => result,
            _ = cancel.cancelled() => return Err(DetectError::Cancelled),
        };

        let result = match recognized {
            Ok(Some(result)) => result,
            Ok(None) => return Ok(None),
            Err(err) => return self.absorb("audd", &self.audd_disabled, err),
        };

        let (Some(title), Some(artist)) = (result.title.clone(), result.artist.clone()) else {
            tracing::debug!("AudD result missing title or artist, treating as miss");
            return Ok(None);
        };

        if AUDD_DEFAULT_CONFIDENCE < self.audd_threshold {
            return Ok(None);
        }

        tracing::info!(title = %title, artist = %artist, "AudD match");

        Ok(Some(RecognitionMatch {
            track_id: None,
            metadata: TrackMetadata {
                title,
                artist,
                album: result.album.clone(),
                isrc: result.extract_isrc(),
                label: result.extract_label(),
                release_date: result.extract_release_date(),
                duration_s: None,
            },
            fingerprint: None,
            confidence: AUDD_DEFAULT_CONFIDENCE,
            source: MatchSource::Audd,
            detection_method: DetectionMethod::Audd,
        }))
    }

    /// Fall-through policy: transient errors skip the provider for this
    /// window; permanent errors switch it off for the process lifetime.
    fn absorb(
        &self,
        provider: &str,
        disabled_flag: &AtomicBool,
        err: DetectError,
    ) -> DetectResult<Option<RecognitionMatch>> {
        match &err {
            DetectError::Cancelled => Err(err),
            DetectError::ProviderPermanent { message, .. } => {
                tracing::error!(provider, message = %message, "provider disabled for process lifetime");
                disabled_flag.store(true, Ordering::Relaxed);
                self.event_bus.publish(MonitorEvent::ErrorRaised {
                    scope: provider.to_string(),
                    kind: "provider_permanent".to_string(),
                    message: message.clone(),
                });
                Ok(None)
            }
            _ => {
                tracing::warn!(provider, error = %err, "provider failed for this window, falling through");
                Ok(None)
            }
        }
    }

    /// AcoustID lookup attempts issued so far (retries included).
    pub fn acoustid_attempts(&self) -> u64 {
        self.acoustid.as_ref().map_or(0, |c| c.attempts())
    }

    /// True when the named provider has been permanently disabled.
    pub fn is_disabled(&self, provider: &str) -> bool {
        match provider {
            "acoustid" => self.acoustid_disabled.load(Ordering::Relaxed),
            "audd" => self.audd_disabled.load(Ordering::Relaxed),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_schema;
    use chrono::Utc;
    use sodav_common::db::init_memory_pool;

    async fn recognizer(settings: Settings) -> ExternalRecognizer {
        let pool = init_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        ExternalRecognizer::new(&settings, pool, EventBus::new(16)).unwrap()
    }

    fn window() -> AudioWindow {
        AudioWindow {
            samples: vec![0.1f32; 44100],
            sample_rate: 44100,
            captured_at: Utc::now(),
        }
    }

    fn fingerprint() -> FingerprintData {
        FingerprintData {
            hash: "aa".repeat(32),
            raw: vec![0u8; 32],
            chromaprint: Some("ABCDEFGH".repeat(8)),
        }
    }

    #[tokio::test]
    async fn test_unconfigured_chain_returns_none() {
        // No API keys: every provider is skipped, find returns None
        let rec = recognizer(Settings::default()).await;
        let result = rec
            .find(
                &window(),
                &AudioFeatures::default(),
                &fingerprint(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_permanent_error_disables_provider() {
        let rec = recognizer(Settings::default()).await;
        let disabled = AtomicBool::new(false);
        let outcome = rec.absorb(
            "acoustid",
            &disabled,
            DetectError::ProviderPermanent {
                provider: "acoustid".to_string(),
                message: "invalid API key".to_string(),
            },
        );
        assert!(outcome.unwrap().is_none());
        assert!(disabled.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_transient_error_does_not_disable() {
        let rec = recognizer(Settings::default()).await;
        let disabled = AtomicBool::new(false);
        let outcome = rec.absorb(
            "audd",
            &disabled,
            DetectError::ProviderTransient {
                provider: "audd".to_string(),
                message: "HTTP 503".to_string(),
            },
        );
        assert!(outcome.unwrap().is_none());
        assert!(!disabled.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_cancelled_propagates() {
        let rec = recognizer(Settings::default()).await;
        let disabled = AtomicBool::new(false);
        let outcome = rec.absorb("audd", &disabled, DetectError::Cancelled);
        assert!(matches!(outcome, Err(DetectError::Cancelled)));
    }

    #[tokio::test]
    async fn test_permanent_error_emits_event() {
        let settings = Settings::default();
        let pool = init_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();
        let rec = ExternalRecognizer::new(&settings, pool, bus).unwrap();

        let disabled = AtomicBool::new(false);
        rec.absorb(
            "acoustid",
            &disabled,
            DetectError::ProviderPermanent {
                provider: "acoustid".to_string(),
                message: "bad key".to_string(),
            },
        )
        .unwrap();

        match sub.recv().await {
            Some(MonitorEvent::ErrorRaised { scope, kind, .. }) => {
                assert_eq!(scope, "acoustid");
                assert_eq!(kind, "provider_permanent");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
