//! Per-station recognition worker
//!
//! The orchestration loop tying the pipeline together for one station:
//! read a window, gate on music-likelihood, fingerprint, try the local
//! index, fall through to the external chain, resolve identity, and
//! feed the play tracker. Content errors skip the window; stream
//! failures trigger degraded-mode backoff and a reconnect.

use crate::config::Settings;
use crate::error::{DetectError, DetectResult};
use crate::services::external_recognizer::ExternalRecognizer;
use crate::services::feature_extractor::FeatureExtractor;
use crate::services::fingerprinter::Fingerprinter;
use crate::services::local_matcher::LocalMatcher;
use crate::services::play_tracker::PlayTracker;
use crate::services::stream_fetcher::{AudioStream, StreamFetcher};
use crate::services::track_resolver::TrackResolver;
use crate::types::{AudioWindow, RecognitionMatch};
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Worker for one monitored station.
pub struct StationWorker {
    station_id: i64,
    station_name: String,
    stream_url: String,
    settings: Arc<Settings>,
    fetcher: StreamFetcher,
    extractor: Arc<FeatureExtractor>,
    fingerprinter: Fingerprinter,
    local_matcher: LocalMatcher,
    external: Arc<ExternalRecognizer>,
    resolver: TrackResolver,
    tracker: PlayTracker,
    cancel: CancellationToken,
}

impl StationWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        station_id: i64,
        station_name: String,
        stream_url: String,
        settings: Arc<Settings>,
        fetcher: StreamFetcher,
        local_matcher: LocalMatcher,
        external: Arc<ExternalRecognizer>,
        resolver: TrackResolver,
        tracker: PlayTracker,
        cancel: CancellationToken,
    ) -> Self {
        let sample_rate = settings.sample_rate;
        Self {
            station_id,
            station_name,
            stream_url,
            settings,
            fetcher,
            extractor: Arc::new(FeatureExtractor::new(sample_rate)),
            fingerprinter: Fingerprinter::new(sample_rate),
            local_matcher,
            external,
            resolver,
            tracker,
            cancel,
        }
    }

    /// Run until cancelled. Stream failures back off and reconnect;
    /// anything else (database down, poisoned state) surfaces to the
    /// supervisor for a worker restart.
    pub async fn run(mut self) -> DetectResult<()> {
        let mut consecutive_stream_failures = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let stream = tokio::select! {
                opened = self.fetcher.open(&self.stream_url) => opened,
                _ = self.cancel.cancelled() => break,
            };

            match stream {
                Ok(stream) => {
                    consecutive_stream_failures = 0;
                    match self.monitor_stream(stream).await {
                        Ok(()) => break, // cancelled
                        Err(err) if err.is_stream_failure() => {
                            tracing::warn!(
                                station = %self.station_name,
                                error = %err,
                                "stream lost, entering degraded mode"
                            );
                            self.tracker.on_stream_drop(Utc::now()).await?;
                            consecutive_stream_failures += 1;
                        }
                        Err(DetectError::Cancelled) => break,
                        Err(err) => {
                            // Database or internal failure: surface it so
                            // the supervisor can restart this worker
                            tracing::error!(
                                station = %self.station_name,
                                error = %err,
                                "worker failed"
                            );
                            return Err(err);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        station = %self.station_name,
                        error = %err,
                        "stream open failed"
                    );
                    consecutive_stream_failures += 1;
                }
            }

            // Degraded mode: exponential backoff with jitter before reopening
            let backoff = reconnect_backoff(consecutive_stream_failures);
            tracing::info!(
                station = %self.station_name,
                backoff_s = backoff.as_secs(),
                failures = consecutive_stream_failures,
                "waiting before reconnect"
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        // Graceful stop folds whatever is still playing
        self.tracker.on_station_stop(Utc::now()).await?;
        tracing::info!(station = %self.station_name, "worker stopped");
        Ok(())
    }

    /// Window loop over one open stream.
    async fn monitor_stream(&mut self, mut stream: AudioStream) -> DetectResult<()> {
        let window_samples = self.settings.window_samples();

        loop {
            let window = tokio::select! {
                window = stream.read_window(window_samples) => window?,
                _ = self.cancel.cancelled() => {
                    stream.close();
                    return Ok(());
                }
            };

            match self.process_window(window).await {
                Ok(()) => {}
                Err(err) if err.is_window_recoverable() => {
                    tracing::debug!(
                        station = %self.station_name,
                        error = %err,
                        "skipping bad window"
                    );
                }
                Err(err) => {
                    stream.close();
                    return Err(err);
                }
            }
        }
    }

    /// One pass of the hierarchical detection pipeline.
    async fn process_window(&mut self, window: AudioWindow) -> DetectResult<()> {
        let t_capture = window.captured_at;

        // Analysis is CPU-bound; keep it off the async threads
        let extractor = Arc::clone(&self.extractor);
        let fingerprinter = self.fingerprinter;
        let samples = window.samples.clone();
        let analyzed = tokio::task::spawn_blocking(move || {
            let features = extractor.analyze(&samples)?;
            let fingerprint = fingerprinter.fingerprint(&samples, &features)?;
            Ok::<_, DetectError>((features, fingerprint))
        })
        .await
        .map_err(|e| DetectError::Common(sodav_common::Error::Internal(e.to_string())))?;

        let (features, fingerprint) = analyzed?;

        if !self.extractor.is_music(&features) {
            tracing::debug!(
                station = %self.station_name,
                score = features.music_likelihood,
                "window below music gate"
            );
            self.tracker.on_non_music(t_capture).await?;
            return Ok(());
        }

        // Local index first; external chain only on miss or weak local
        let mut matched = self.local_matcher.find(&fingerprint).await?;
        if matched
            .as_ref()
            .map_or(true, |m| m.confidence < self.settings.min_confidence)
        {
            let external = self
                .external
                .find(&window, &features, &fingerprint, &self.cancel)
                .await?;
            if external.is_some() {
                matched = external;
            }
        }

        let Some(mut matched) = matched else {
            tracing::debug!(station = %self.station_name, "no match for window");
            self.tracker.on_unknown(Some(&fingerprint), t_capture).await?;
            return Ok(());
        };

        // Carry this window's fingerprint into resolution so new tracks
        // land in the index
        if matched.fingerprint.is_none() {
            matched.fingerprint = Some(fingerprint.clone());
        }

        let resolved = self.resolve_match(&matched).await?;
        self.tracker
            .on_match(
                resolved.0,
                resolved.1,
                &features,
                &fingerprint,
                t_capture,
                matched.confidence,
                matched.detection_method,
            )
            .await?;

        Ok(())
    }

    async fn resolve_match(&self, matched: &RecognitionMatch) -> DetectResult<(i64, i64)> {
        let resolved = self.resolver.resolve(matched).await?;
        Ok((resolved.track.id, resolved.track.artist_id))
    }

    pub fn station_id(&self) -> i64 {
        self.station_id
    }
}

/// Exponential backoff capped at 60 s, with jitter so a fleet of
/// stations does not reconnect in lockstep.
fn reconnect_backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(4);
    let secs = (5u64 << exp).min(60);
    let jitter_ms = rand::thread_rng().gen_range(0..1000);
    Duration::from_secs(secs) + Duration::from_millis(jitter_ms)
}
