//! Transactional statistics aggregation
//!
//! Applies every cumulative-statistics update belonging to one finalized
//! play on the caller's connection. The play tracker runs this inside
//! the same transaction as the Detection insert, so the row and its
//! aggregates commit or roll back together.

use crate::db::{stations, stats};
use crate::error::DetectResult;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

/// A finalized play, ready for aggregation.
#[derive(Debug, Clone)]
pub struct FinalizedPlay {
    pub station_id: i64,
    pub track_id: i64,
    pub artist_id: i64,
    pub detected_at: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub play_duration_s: f64,
    pub confidence: f64,
}

/// Stats aggregator.
pub struct StatsUpdater;

impl StatsUpdater {
    /// Apply all aggregate updates for one play on `conn`.
    pub async fn record(conn: &mut SqliteConnection, play: &FinalizedPlay) -> DetectResult<()> {
        stats::upsert_station_track_stats(
            conn,
            play.station_id,
            play.track_id,
            play.play_duration_s,
            play.confidence,
            play.end_time,
        )
        .await?;

        stats::upsert_track_stats(
            conn,
            play.track_id,
            play.play_duration_s,
            play.confidence,
            play.end_time,
        )
        .await?;

        stats::upsert_artist_stats(
            conn,
            play.artist_id,
            play.play_duration_s,
            play.confidence,
            play.end_time,
        )
        .await?;

        stations::add_station_play_time(conn, play.station_id, play.play_duration_s, play.end_time)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{artists, init_schema, stations, stats, tracks};
    use sodav_common::db::init_memory_pool;
    use sqlx::SqlitePool;

    async fn fixture() -> (SqlitePool, FinalizedPlay) {
        let pool = init_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        let station_id = stations::insert_station(&pool, "S", "http://s.example/a")
            .await
            .unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let artist_id = artists::insert_artist(&mut conn, "A", None).await.unwrap();
        let track_id = tracks::insert_track(
            &mut conn,
            &tracks::NewTrack {
                title: "t",
                artist_id,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        drop(conn);

        let end_time = Utc::now();
        let play = FinalizedPlay {
            station_id,
            track_id,
            artist_id,
            detected_at: end_time - chrono::Duration::seconds(180),
            end_time,
            play_duration_s: 180.0,
            confidence: 0.95,
        };
        (pool, play)
    }

    #[tokio::test]
    async fn test_record_updates_all_aggregates() {
        let (pool, play) = fixture().await;
        let mut tx = pool.begin().await.unwrap();
        StatsUpdater::record(&mut tx, &play).await.unwrap();
        tx.commit().await.unwrap();

        let st = stats::get_station_track_stats(&pool, play.station_id, play.track_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(st.play_count, 1);
        assert!((st.total_play_time_s - 180.0).abs() < 1e-9);

        let t = stats::get_track_stats(&pool, play.track_id).await.unwrap().unwrap();
        assert_eq!(t.play_count, 1);

        let a = stats::get_artist_stats(&pool, play.artist_id).await.unwrap().unwrap();
        assert_eq!(a.play_count, 1);

        let station = stations::load_station(&pool, play.station_id)
            .await
            .unwrap()
            .unwrap();
        assert!((station.total_play_time_s - 180.0).abs() < 1e-9);
        assert!(station.last_detection_at.is_some());
    }

    #[tokio::test]
    async fn test_rollback_discards_every_change() {
        let (pool, play) = fixture().await;
        let mut tx = pool.begin().await.unwrap();
        StatsUpdater::record(&mut tx, &play).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(stats::get_station_track_stats(&pool, play.station_id, play.track_id)
            .await
            .unwrap()
            .is_none());
        assert!(stats::get_track_stats(&pool, play.track_id)
            .await
            .unwrap()
            .is_none());
        let station = stations::load_station(&pool, play.station_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(station.total_play_time_s, 0.0);
    }
}
