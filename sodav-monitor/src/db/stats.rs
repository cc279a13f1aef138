//! Cumulative statistics persistence
//!
//! Each upsert maintains `(play_count, confidence_sum, average_confidence)`
//! together in a single statement: the average is always recomputed from
//! the stored sum, never from the previous average.

use chrono::{DateTime, Utc};
use sodav_common::Result;
use sqlx::{Row, SqliteConnection, SqlitePool};

/// Aggregate row shared by the three stats tables.
#[derive(Debug, Clone, Default)]
pub struct StatsRow {
    pub play_count: i64,
    pub total_play_time_s: f64,
    pub last_played: Option<DateTime<Utc>>,
    pub confidence_sum: f64,
    pub average_confidence: f64,
}

/// Upsert per-(station, track) aggregates.
pub async fn upsert_station_track_stats(
    conn: &mut SqliteConnection,
    station_id: i64,
    track_id: i64,
    play_duration_s: f64,
    confidence: f64,
    played_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO station_track_stats (
            station_id, track_id, play_count, total_play_time_s,
            last_played, confidence_sum, average_confidence
        ) VALUES (?, ?, 1, ?, ?, ?, ?)
        ON CONFLICT(station_id, track_id) DO UPDATE SET
            play_count = play_count + 1,
            total_play_time_s = total_play_time_s + excluded.total_play_time_s,
            last_played = excluded.last_played,
            confidence_sum = confidence_sum + excluded.confidence_sum,
            average_confidence = (confidence_sum + excluded.confidence_sum)
                                 / (play_count + 1)
        "#,
    )
    .bind(station_id)
    .bind(track_id)
    .bind(play_duration_s)
    .bind(played_at)
    .bind(confidence)
    .bind(confidence)
    .execute(conn)
    .await?;
    Ok(())
}

/// Upsert per-track aggregates across all stations.
pub async fn upsert_track_stats(
    conn: &mut SqliteConnection,
    track_id: i64,
    play_duration_s: f64,
    confidence: f64,
    played_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO track_stats (
            track_id, total_plays, total_play_time_s,
            last_detected, confidence_sum, average_confidence
        ) VALUES (?, 1, ?, ?, ?, ?)
        ON CONFLICT(track_id) DO UPDATE SET
            total_plays = total_plays + 1,
            total_play_time_s = total_play_time_s + excluded.total_play_time_s,
            last_detected = excluded.last_detected,
            confidence_sum = confidence_sum + excluded.confidence_sum,
            average_confidence = (confidence_sum + excluded.confidence_sum)
                                 / (total_plays + 1)
        "#,
    )
    .bind(track_id)
    .bind(play_duration_s)
    .bind(played_at)
    .bind(confidence)
    .bind(confidence)
    .execute(conn)
    .await?;
    Ok(())
}

/// Upsert per-artist aggregates, plus the artist row's own counters.
pub async fn upsert_artist_stats(
    conn: &mut SqliteConnection,
    artist_id: i64,
    play_duration_s: f64,
    confidence: f64,
    played_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO artist_stats (
            artist_id, total_plays, total_play_time_s,
            last_detected, confidence_sum, average_confidence
        ) VALUES (?, 1, ?, ?, ?, ?)
        ON CONFLICT(artist_id) DO UPDATE SET
            total_plays = total_plays + 1,
            total_play_time_s = total_play_time_s + excluded.total_play_time_s,
            last_detected = excluded.last_detected,
            confidence_sum = confidence_sum + excluded.confidence_sum,
            average_confidence = (confidence_sum + excluded.confidence_sum)
                                 / (total_plays + 1)
        "#,
    )
    .bind(artist_id)
    .bind(play_duration_s)
    .bind(played_at)
    .bind(confidence)
    .bind(confidence)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        UPDATE artists SET
            total_plays = total_plays + 1,
            total_play_time_s = total_play_time_s + ?,
            updated_at = datetime('now')
        WHERE id = ?
        "#,
    )
    .bind(play_duration_s)
    .bind(artist_id)
    .execute(conn)
    .await?;
    Ok(())
}

fn stats_from_row(row: &sqlx::sqlite::SqliteRow, count_column: &str) -> StatsRow {
    StatsRow {
        play_count: row.get(count_column),
        total_play_time_s: row.get("total_play_time_s"),
        last_played: row.get(2),
        confidence_sum: row.get("confidence_sum"),
        average_confidence: row.get("average_confidence"),
    }
}

/// Read per-(station, track) aggregates.
pub async fn get_station_track_stats(
    pool: &SqlitePool,
    station_id: i64,
    track_id: i64,
) -> Result<Option<StatsRow>> {
    let row = sqlx::query(
        "SELECT play_count, total_play_time_s, last_played, confidence_sum, average_confidence
         FROM station_track_stats WHERE station_id = ? AND track_id = ?",
    )
    .bind(station_id)
    .bind(track_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(|r| stats_from_row(r, "play_count")))
}

/// Read per-track aggregates.
pub async fn get_track_stats(pool: &SqlitePool, track_id: i64) -> Result<Option<StatsRow>> {
    let row = sqlx::query(
        "SELECT total_plays, total_play_time_s, last_detected, confidence_sum, average_confidence
         FROM track_stats WHERE track_id = ?",
    )
    .bind(track_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(|r| stats_from_row(r, "total_plays")))
}

/// Read per-artist aggregates.
pub async fn get_artist_stats(pool: &SqlitePool, artist_id: i64) -> Result<Option<StatsRow>> {
    let row = sqlx::query(
        "SELECT total_plays, total_play_time_s, last_detected, confidence_sum, average_confidence
         FROM artist_stats WHERE artist_id = ?",
    )
    .bind(artist_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(|r| stats_from_row(r, "total_plays")))
}
