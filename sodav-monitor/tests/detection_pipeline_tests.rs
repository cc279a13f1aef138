//! Cross-component pipeline tests
//!
//! Local-index matching feeding identity resolution and the play
//! tracker, plus method provenance on the persisted detections.

mod helpers;

use chrono::{Duration, Utc};
use helpers::db_utils::{seed_fingerprint, seed_station, seed_track, setup_database};
use helpers::fixtures::{fingerprint, music_features, provider_match};
use sodav_common::EventBus;
use sodav_monitor::db::detections;
use sodav_monitor::services::local_matcher::LocalMatcher;
use sodav_monitor::services::play_tracker::PlayTracker;
use sodav_monitor::services::track_resolver::TrackResolver;
use sodav_monitor::types::DetectionMethod;

#[tokio::test]
async fn test_local_match_drives_full_detection() {
    // A known fingerprint resolves locally, plays for a minute, and
    // lands as one local_exact detection.
    let pool = setup_database().await;
    let station_id = seed_station(&pool, "RTS1").await;
    let (track_id, _) = seed_track(&pool, "Set", "Youssou N'Dour").await;
    let window_fp = fingerprint(3);
    seed_fingerprint(&pool, track_id, &window_fp.hash).await;

    let matcher = LocalMatcher::new(pool.clone());
    let resolver = TrackResolver::new(pool.clone());
    let mut tracker = PlayTracker::new(station_id, pool.clone(), EventBus::new(64), 0.85, 2.0);

    let t0 = Utc::now();
    for i in 0..6 {
        let matched = matcher
            .find(&window_fp)
            .await
            .unwrap()
            .expect("seeded fingerprint matches");
        assert_eq!(matched.detection_method, DetectionMethod::LocalExact);
        assert_eq!(matched.confidence, 1.0);

        let resolved = resolver.resolve(&matched).await.unwrap();
        assert_eq!(resolved.track.id, track_id);

        tracker
            .on_match(
                resolved.track.id,
                resolved.track.artist_id,
                &music_features(),
                &window_fp,
                t0 + Duration::seconds(i * 10),
                matched.confidence,
                matched.detection_method,
            )
            .await
            .unwrap();
    }
    tracker
        .on_station_stop(t0 + Duration::seconds(60))
        .await
        .unwrap();

    let all = detections::list_for_station(&pool, station_id).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].detection_method, "local_exact");
    assert!((all[0].play_duration_s - 60.0).abs() <= 1.0);
    assert!((all[0].confidence - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_external_match_carries_method_and_isrc_through() {
    // The external-provider path: AudD identifies an unknown window,
    // resolution creates the track, and the detection records the
    // provider as its method.
    let pool = setup_database().await;
    let station_id = seed_station(&pool, "RTS1").await;

    let matcher = LocalMatcher::new(pool.clone());
    let resolver = TrackResolver::new(pool.clone());
    let mut tracker = PlayTracker::new(station_id, pool.clone(), EventBus::new(64), 0.85, 2.0);

    let window_fp = fingerprint(9);
    assert!(matcher.find(&window_fp).await.unwrap().is_none(), "index is empty");

    let mut matched = provider_match(
        "Dikoo",
        "Wally Seck",
        Some("FRZ031400123"),
        DetectionMethod::Audd,
        0.8,
    );
    matched.fingerprint = Some(window_fp.clone());
    let resolved = resolver.resolve(&matched).await.unwrap();
    assert_eq!(resolved.track.isrc.as_deref(), Some("FRZ031400123"));

    let t0 = Utc::now();
    tracker
        .on_match(
            resolved.track.id,
            resolved.track.artist_id,
            &music_features(),
            &window_fp,
            t0,
            matched.confidence,
            matched.detection_method,
        )
        .await
        .unwrap();
    tracker
        .on_station_stop(t0 + Duration::seconds(30))
        .await
        .unwrap();

    let all = detections::list_for_station(&pool, station_id).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].detection_method, "audd");

    // The next identical window now matches locally
    let local = matcher.find(&window_fp).await.unwrap();
    assert!(local.is_some(), "resolver indexed the new fingerprint");
    assert_eq!(local.unwrap().track_id, Some(resolved.track.id));
}

#[tokio::test]
async fn test_independent_stations_do_not_interfere() {
    // Two stations play different tracks concurrently; each station's
    // detections reference only its own play.
    let pool = setup_database().await;
    let station_a = seed_station(&pool, "RTS1").await;
    let station_b = seed_station(&pool, "Zik-FM").await;
    let (track_a, artist_a) = seed_track(&pool, "Set", "Youssou N'Dour").await;
    let (track_b, artist_b) = seed_track(&pool, "Yela", "Baaba Maal").await;

    let mut tracker_a = PlayTracker::new(station_a, pool.clone(), EventBus::new(64), 0.85, 2.0);
    let mut tracker_b = PlayTracker::new(station_b, pool.clone(), EventBus::new(64), 0.85, 2.0);

    let t0 = Utc::now();
    for i in 0..6 {
        let t = t0 + Duration::seconds(i * 10);
        tracker_a
            .on_match(track_a, artist_a, &music_features(), &fingerprint(1), t, 0.9, DetectionMethod::LocalExact)
            .await
            .unwrap();
        tracker_b
            .on_match(track_b, artist_b, &music_features(), &fingerprint(7), t, 0.9, DetectionMethod::LocalExact)
            .await
            .unwrap();
    }
    let end = t0 + Duration::seconds(60);
    tracker_a.on_station_stop(end).await.unwrap();
    tracker_b.on_station_stop(end).await.unwrap();

    let for_a = detections::list_for_station(&pool, station_a).await.unwrap();
    let for_b = detections::list_for_station(&pool, station_b).await.unwrap();
    assert_eq!(for_a.len(), 1);
    assert_eq!(for_b.len(), 1);
    assert_eq!(for_a[0].track_id, track_a);
    assert_eq!(for_b[0].track_id, track_b);
}

#[tokio::test]
async fn test_detection_event_published_on_finalize() {
    let pool = setup_database().await;
    let station_id = seed_station(&pool, "RTS1").await;
    let (track_id, artist_id) = seed_track(&pool, "Set", "Youssou N'Dour").await;

    let bus = EventBus::new(64);
    let mut events = bus.subscribe();
    let mut tracker = PlayTracker::new(station_id, pool.clone(), bus, 0.85, 2.0);

    let t0 = Utc::now();
    tracker
        .on_match(
            track_id,
            artist_id,
            &music_features(),
            &fingerprint(1),
            t0,
            0.92,
            DetectionMethod::LocalExact,
        )
        .await
        .unwrap();
    tracker
        .on_station_stop(t0 + Duration::seconds(45))
        .await
        .unwrap();

    match events.recv().await {
        Some(sodav_common::MonitorEvent::DetectionFinalized {
            station_id: evt_station,
            track_id: evt_track,
            play_duration_s,
            method,
            ..
        }) => {
            assert_eq!(evt_station, station_id);
            assert_eq!(evt_track, track_id);
            assert!((play_duration_s - 45.0).abs() <= 1.0);
            assert_eq!(method, "local_exact");
        }
        other => panic!("expected DetectionFinalized, got {:?}", other),
    }
}
