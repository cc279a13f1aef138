//! Per-station play-state tracking
//!
//! Holds at most one CurrentTrack per station and measures real
//! broadcast duration by folding each fresh window's capture time into
//! the running play. All transitions take explicit capture timestamps,
//! so duration arithmetic never reads a clock and is fully
//! deterministic under test.
//!
//! Finalizing a play inserts the Detection and applies every statistics
//! update in one transaction; either all of it commits or none of it.

use crate::db::detections::{self, NewDetection};
use crate::error::DetectResult;
use crate::services::fingerprinter;
use crate::services::stats_updater::{FinalizedPlay, StatsUpdater};
use crate::types::{AudioFeatures, DetectionMethod, EndReason, FingerprintData};
use chrono::{DateTime, Utc};
use sodav_common::{EventBus, MonitorEvent};
use sqlx::SqlitePool;

/// The in-flight play on one station. In-memory only, owned by that
/// station's worker.
#[derive(Debug, Clone)]
pub struct CurrentTrack {
    pub track_id: i64,
    pub artist_id: i64,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub accumulated_s: f64,
    pub features: AudioFeatures,
    pub fingerprint: FingerprintData,
    pub method: DetectionMethod,
    confidence_sum: f64,
    confidence_count: u32,
}

impl CurrentTrack {
    fn running_confidence(&self) -> f64 {
        if self.confidence_count == 0 {
            0.0
        } else {
            self.confidence_sum / self.confidence_count as f64
        }
    }
}

/// Summary of a finalized play, returned for logging and tests.
#[derive(Debug, Clone)]
pub struct PlaySummary {
    pub detection_id: i64,
    pub track_id: i64,
    pub detected_at: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub play_duration_s: f64,
    pub confidence: f64,
    pub reason: EndReason,
}

/// Per-station play-state tracker.
pub struct PlayTracker {
    station_id: i64,
    pool: SqlitePool,
    event_bus: EventBus,
    same_track_similarity: f64,
    silence_duration_s: f64,
    current: Option<CurrentTrack>,
    non_music_since: Option<DateTime<Utc>>,
}

impl PlayTracker {
    pub fn new(
        station_id: i64,
        pool: SqlitePool,
        event_bus: EventBus,
        same_track_similarity: f64,
        silence_duration_s: f64,
    ) -> Self {
        Self {
            station_id,
            pool,
            event_bus,
            same_track_similarity,
            silence_duration_s,
            current: None,
            non_music_since: None,
        }
    }

    /// The in-flight play, if any.
    pub fn current(&self) -> Option<&CurrentTrack> {
        self.current.as_ref()
    }

    /// A confirmed match for this window.
    ///
    /// Continues the current play when it names the same track (or the
    /// window fingerprint still matches it above the continuity
    /// threshold); otherwise folds the current play and starts the new
    /// one at `t_capture`. Returns the finalized play when a track
    /// change closed one.
    #[allow(clippy::too_many_arguments)]
    pub async fn on_match(
        &mut self,
        track_id: i64,
        artist_id: i64,
        features: &AudioFeatures,
        fingerprint: &FingerprintData,
        t_capture: DateTime<Utc>,
        confidence: f64,
        method: DetectionMethod,
    ) -> DetectResult<Option<PlaySummary>> {
        self.non_music_since = None;

        let continues = match &self.current {
            Some(current) => {
                current.track_id == track_id
                    || fingerprinter::compare(fingerprint, &current.fingerprint)
                        >= self.same_track_similarity
            }
            None => false,
        };

        if continues {
            let current = self.current.as_mut().unwrap();
            let elapsed = (t_capture - current.last_update).num_milliseconds() as f64 / 1000.0;
            if elapsed > 0.0 {
                current.accumulated_s += elapsed;
                current.last_update = t_capture;
            }
            current.features = features.clone();
            current.fingerprint = fingerprint.clone();
            current.confidence_sum += confidence;
            current.confidence_count += 1;

            tracing::debug!(
                station_id = self.station_id,
                track_id = current.track_id,
                accumulated_s = current.accumulated_s,
                "play continues"
            );
            return Ok(None);
        }

        // Track change folds the previous play first
        let finalized = match self.current.take() {
            Some(_) => self.finalize(EndReason::DifferentTrack, t_capture).await?,
            None => None,
        };

        tracing::info!(
            station_id = self.station_id,
            track_id,
            started_at = %t_capture,
            "play started"
        );
        self.current = Some(CurrentTrack {
            track_id,
            artist_id,
            started_at: t_capture,
            last_update: t_capture,
            accumulated_s: 0.0,
            features: features.clone(),
            fingerprint: fingerprint.clone(),
            method,
            confidence_sum: confidence,
            confidence_count: 1,
        });

        Ok(finalized)
    }

    /// A window below the music gate. A run of these at least
    /// `silence_duration_s` long ends the current play.
    pub async fn on_non_music(
        &mut self,
        t_capture: DateTime<Utc>,
    ) -> DetectResult<Option<PlaySummary>> {
        if self.current.is_none() {
            self.non_music_since = None;
            return Ok(None);
        }

        let since = *self.non_music_since.get_or_insert(t_capture);
        let silent_for = (t_capture - since).num_milliseconds() as f64 / 1000.0;

        if silent_for >= self.silence_duration_s {
            tracing::info!(
                station_id = self.station_id,
                silent_for_s = silent_for,
                "silence run ended play"
            );
            self.non_music_since = None;
            // The play ended when the silence began, not when the run
            // crossed the threshold
            return self.finalize(EndReason::SilenceDetected, since).await;
        }

        Ok(None)
    }

    /// A music window that no matcher could identify. Still counts as
    /// continuation when it resembles the current play; otherwise the
    /// broadcast moved on to something unknown and the play ends.
    pub async fn on_unknown(
        &mut self,
        fingerprint: Option<&FingerprintData>,
        t_capture: DateTime<Utc>,
    ) -> DetectResult<Option<PlaySummary>> {
        self.non_music_since = None;

        let Some(current) = self.current.as_mut() else {
            return Ok(None);
        };

        if let Some(fp) = fingerprint {
            if fingerprinter::compare(fp, &current.fingerprint) >= self.same_track_similarity {
                let elapsed = (t_capture - current.last_update).num_milliseconds() as f64 / 1000.0;
                if elapsed > 0.0 {
                    current.accumulated_s += elapsed;
                    current.last_update = t_capture;
                }
                current.fingerprint = fp.clone();
                return Ok(None);
            }
        }

        self.finalize(EndReason::DifferentTrack, t_capture).await
    }

    /// The stream dropped mid-play.
    pub async fn on_stream_drop(
        &mut self,
        t_capture: DateTime<Utc>,
    ) -> DetectResult<Option<PlaySummary>> {
        self.finalize(EndReason::StreamDrop, t_capture).await
    }

    /// Worker shutdown; fold whatever is playing.
    pub async fn on_station_stop(
        &mut self,
        t_capture: DateTime<Utc>,
    ) -> DetectResult<Option<PlaySummary>> {
        self.finalize(EndReason::StationStop, t_capture).await
    }

    /// Close the current play: insert the Detection and apply statistics
    /// in one transaction, then publish the event.
    async fn finalize(
        &mut self,
        reason: EndReason,
        now: DateTime<Utc>,
    ) -> DetectResult<Option<PlaySummary>> {
        let Some(mut current) = self.current.take() else {
            return Ok(None);
        };

        let tail = (now - current.last_update).num_milliseconds() as f64 / 1000.0;
        if tail > 0.0 {
            current.accumulated_s += tail;
        }
        let end_time = now.max(current.started_at);
        let play_duration_s = (end_time - current.started_at).num_milliseconds() as f64 / 1000.0;
        let confidence = current.running_confidence();

        let mut tx = self.pool.begin().await?;
        let detection_id = detections::insert_detection(
            &mut tx,
            &NewDetection {
                track_id: current.track_id,
                station_id: self.station_id,
                detected_at: current.started_at,
                end_time,
                play_duration_s,
                confidence,
                detection_method: current.method.as_str(),
                fingerprint: Some(&current.fingerprint.hash),
            },
        )
        .await?;

        StatsUpdater::record(
            &mut tx,
            &FinalizedPlay {
                station_id: self.station_id,
                track_id: current.track_id,
                artist_id: current.artist_id,
                detected_at: current.started_at,
                end_time,
                play_duration_s,
                confidence,
            },
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            station_id = self.station_id,
            track_id = current.track_id,
            play_duration_s,
            reason = reason.as_str(),
            "play finalized"
        );

        self.event_bus.publish(MonitorEvent::DetectionFinalized {
            station_id: self.station_id,
            track_id: current.track_id,
            detected_at: current.started_at,
            end_time,
            play_duration_s,
            confidence,
            method: current.method.as_str().to_string(),
        });

        Ok(Some(PlaySummary {
            detection_id,
            track_id: current.track_id,
            detected_at: current.started_at,
            end_time,
            play_duration_s,
            confidence,
            reason,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{artists, init_schema, stations, stats, tracks};
    use chrono::Duration;
    use sodav_common::db::init_memory_pool;

    struct Fixture {
        pool: SqlitePool,
        tracker: PlayTracker,
        track_a: (i64, i64),
        track_b: (i64, i64),
    }

    async fn fixture() -> Fixture {
        let pool = init_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        let station_id = stations::insert_station(&pool, "S", "http://s.example/a")
            .await
            .unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let artist_id = artists::insert_artist(&mut conn, "A", None).await.unwrap();
        let a = tracks::insert_track(
            &mut conn,
            &tracks::NewTrack {
                title: "a",
                artist_id,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let b = tracks::insert_track(
            &mut conn,
            &tracks::NewTrack {
                title: "b",
                artist_id,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        drop(conn);

        let tracker = PlayTracker::new(station_id, pool.clone(), EventBus::new(64), 0.85, 2.0);
        Fixture {
            pool,
            tracker,
            track_a: (a, artist_id),
            track_b: (b, artist_id),
        }
    }

    fn fp(tag: u8) -> FingerprintData {
        FingerprintData {
            hash: format!("{:02x}", tag).repeat(32),
            raw: vec![tag; 32],
            chromaprint: Some(
                char::from(b'A' + (tag % 26)).to_string().repeat(40),
            ),
        }
    }

    fn feats() -> AudioFeatures {
        AudioFeatures {
            music_likelihood: 80.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_single_play_duration_matches_window_span() {
        let mut f = fixture().await;
        let t0 = Utc::now();
        let (track, artist) = f.track_a;

        // 18 ten-second windows of one song
        for i in 0..18 {
            let t = t0 + Duration::seconds(i * 10);
            let out = f
                .tracker
                .on_match(track, artist, &feats(), &fp(1), t, 0.95, DetectionMethod::LocalExact)
                .await
                .unwrap();
            assert!(out.is_none());
        }

        let end = t0 + Duration::seconds(180);
        let summary = f
            .tracker
            .on_station_stop(end)
            .await
            .unwrap()
            .expect("play should finalize");

        assert_eq!(summary.track_id, track);
        assert!((summary.play_duration_s - 180.0).abs() < 1.0);
        assert_eq!(summary.detected_at, t0);
        assert_eq!(summary.end_time, end);
        assert!((summary.confidence - 0.95).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_track_change_folds_previous_play() {
        let mut f = fixture().await;
        let t0 = Utc::now();
        let (a, artist) = f.track_a;
        let (b, _) = f.track_b;

        for i in 0..12 {
            let t = t0 + Duration::seconds(i * 10);
            f.tracker
                .on_match(a, artist, &feats(), &fp(1), t, 0.9, DetectionMethod::LocalExact)
                .await
                .unwrap();
        }

        // Song B begins 120 s in; folding A yields contiguous timestamps
        let t_change = t0 + Duration::seconds(120);
        let folded = f
            .tracker
            .on_match(b, artist, &feats(), &fp(9), t_change, 0.9, DetectionMethod::LocalExact)
            .await
            .unwrap()
            .expect("previous play folds");

        assert_eq!(folded.track_id, a);
        assert_eq!(folded.reason, EndReason::DifferentTrack);
        assert!((folded.play_duration_s - 120.0).abs() < 1.0);
        assert_eq!(folded.end_time, t_change);

        let current = f.tracker.current().unwrap();
        assert_eq!(current.track_id, b);
        assert_eq!(current.started_at, t_change);
    }

    #[tokio::test]
    async fn test_silence_run_ends_play_and_split_counts_twice() {
        let mut f = fixture().await;
        let t0 = Utc::now();
        let (track, artist) = f.track_a;

        // 90 s of song
        for i in 0..9 {
            let t = t0 + Duration::seconds(i * 10);
            f.tracker
                .on_match(track, artist, &feats(), &fp(1), t, 0.9, DetectionMethod::LocalExact)
                .await
                .unwrap();
        }

        // 5 s of silence: first non-music window arms the run, the next
        // one crosses the 2 s threshold
        let first = f.tracker.on_non_music(t0 + Duration::seconds(90)).await.unwrap();
        assert!(first.is_none());
        let ended = f
            .tracker
            .on_non_music(t0 + Duration::seconds(95))
            .await
            .unwrap()
            .expect("silence ends play");
        assert_eq!(ended.reason, EndReason::SilenceDetected);
        assert!(f.tracker.current().is_none());

        // Same song again for 90 s
        let t1 = t0 + Duration::seconds(95);
        for i in 0..9 {
            let t = t1 + Duration::seconds(i * 10);
            f.tracker
                .on_match(track, artist, &feats(), &fp(1), t, 0.9, DetectionMethod::LocalExact)
                .await
                .unwrap();
        }
        f.tracker
            .on_station_stop(t1 + Duration::seconds(90))
            .await
            .unwrap()
            .expect("second play finalizes");

        let st = stats::get_station_track_stats(&f.pool, 1, track)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(st.play_count, 2);
        assert!((st.total_play_time_s - 180.0).abs() < 2.0);
    }

    #[tokio::test]
    async fn test_detection_and_stats_commit_together() {
        let mut f = fixture().await;
        let t0 = Utc::now();
        let (track, artist) = f.track_a;

        f.tracker
            .on_match(track, artist, &feats(), &fp(1), t0, 0.9, DetectionMethod::AcoustId)
            .await
            .unwrap();
        let summary = f
            .tracker
            .on_station_stop(t0 + Duration::seconds(60))
            .await
            .unwrap()
            .unwrap();

        let listed = crate::db::detections::list_for_station(&f.pool, 1).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, summary.detection_id);
        assert_eq!(listed[0].detection_method, "acoustid");

        let st = stats::get_station_track_stats(&f.pool, 1, track)
            .await
            .unwrap()
            .unwrap();
        assert!((st.total_play_time_s - listed[0].play_duration_s).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_detection_without_confirmed_match() {
        let mut f = fixture().await;
        let t0 = Utc::now();

        // Silence and unknowns with no play in flight emit nothing
        assert!(f.tracker.on_non_music(t0).await.unwrap().is_none());
        assert!(f
            .tracker
            .on_unknown(Some(&fp(4)), t0 + Duration::seconds(10))
            .await
            .unwrap()
            .is_none());
        assert!(f
            .tracker
            .on_station_stop(t0 + Duration::seconds(20))
            .await
            .unwrap()
            .is_none());

        let listed = crate::db::detections::list_for_station(&f.pool, 1).await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_similar_window_continues_play() {
        let mut f = fixture().await;
        let t0 = Utc::now();
        let (track, artist) = f.track_a;

        f.tracker
            .on_match(track, artist, &feats(), &fp(1), t0, 0.9, DetectionMethod::LocalExact)
            .await
            .unwrap();

        // Unknown window whose fingerprint still matches: play continues
        let out = f
            .tracker
            .on_unknown(Some(&fp(1)), t0 + Duration::seconds(10))
            .await
            .unwrap();
        assert!(out.is_none());
        assert!(f.tracker.current().is_some());

        // Unknown dissimilar window: play ends
        let ended = f
            .tracker
            .on_unknown(Some(&fp(9)), t0 + Duration::seconds(20))
            .await
            .unwrap()
            .expect("dissimilar unknown ends play");
        assert!((ended.play_duration_s - 20.0).abs() < 1.0);
        assert!(f.tracker.current().is_none());
    }

    #[tokio::test]
    async fn test_stream_drop_finalizes() {
        let mut f = fixture().await;
        let t0 = Utc::now();
        let (track, artist) = f.track_a;

        f.tracker
            .on_match(track, artist, &feats(), &fp(1), t0, 0.9, DetectionMethod::LocalExact)
            .await
            .unwrap();
        let ended = f
            .tracker
            .on_stream_drop(t0 + Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ended.reason, EndReason::StreamDrop);
        assert!((ended.play_duration_s - 30.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn test_running_confidence_is_mean_of_windows() {
        let mut f = fixture().await;
        let t0 = Utc::now();
        let (track, artist) = f.track_a;

        for (i, c) in [0.8, 0.9, 1.0].iter().enumerate() {
            f.tracker
                .on_match(
                    track,
                    artist,
                    &feats(),
                    &fp(1),
                    t0 + Duration::seconds(i as i64 * 10),
                    *c,
                    DetectionMethod::LocalExact,
                )
                .await
                .unwrap();
        }
        let summary = f
            .tracker
            .on_station_stop(t0 + Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert!((summary.confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_brief_dip_below_gate_does_not_end_play() {
        let mut f = fixture().await;
        let t0 = Utc::now();
        let (track, artist) = f.track_a;

        f.tracker
            .on_match(track, artist, &feats(), &fp(1), t0, 0.9, DetectionMethod::LocalExact)
            .await
            .unwrap();

        // One short dip, then music again before the silence threshold
        assert!(f
            .tracker
            .on_non_music(t0 + Duration::seconds(10))
            .await
            .unwrap()
            .is_none());
        f.tracker
            .on_match(
                track,
                artist,
                &feats(),
                &fp(1),
                t0 + Duration::seconds(11),
                0.9,
                DetectionMethod::LocalExact,
            )
            .await
            .unwrap();
        assert!(f.tracker.current().is_some());
    }
}
