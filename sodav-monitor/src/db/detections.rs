//! Detection persistence
//!
//! Detections are append-only playback records; insertion always happens
//! inside the finalization transaction together with the stats updates.

use chrono::{DateTime, Utc};
use sodav_common::Result;
use sqlx::{Row, SqliteConnection, SqlitePool};

/// Finalized playback record
#[derive(Debug, Clone)]
pub struct Detection {
    pub id: i64,
    pub track_id: i64,
    pub station_id: i64,
    pub detected_at: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub play_duration_s: f64,
    pub confidence: f64,
    pub detection_method: String,
    pub fingerprint: Option<String>,
}

/// Fields for a new detection row.
#[derive(Debug, Clone)]
pub struct NewDetection<'a> {
    pub track_id: i64,
    pub station_id: i64,
    pub detected_at: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub play_duration_s: f64,
    pub confidence: f64,
    pub detection_method: &'a str,
    pub fingerprint: Option<&'a str>,
}

/// Insert a detection, returning its id.
pub async fn insert_detection(conn: &mut SqliteConnection, new: &NewDetection<'_>) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO detections (
            track_id, station_id, detected_at, end_time,
            play_duration_s, confidence, detection_method, fingerprint
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(new.track_id)
    .bind(new.station_id)
    .bind(new.detected_at)
    .bind(new.end_time)
    .bind(new.play_duration_s)
    .bind(new.confidence)
    .bind(new.detection_method)
    .bind(new.fingerprint)
    .execute(conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// All detections for one station, time-ordered.
pub async fn list_for_station(pool: &SqlitePool, station_id: i64) -> Result<Vec<Detection>> {
    let rows = sqlx::query(
        r#"
        SELECT id, track_id, station_id, detected_at, end_time,
               play_duration_s, confidence, detection_method, fingerprint
        FROM detections
        WHERE station_id = ?
        ORDER BY detected_at, id
        "#,
    )
    .bind(station_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| Detection {
            id: row.get("id"),
            track_id: row.get("track_id"),
            station_id: row.get("station_id"),
            detected_at: row.get("detected_at"),
            end_time: row.get("end_time"),
            play_duration_s: row.get("play_duration_s"),
            confidence: row.get("confidence"),
            detection_method: row.get("detection_method"),
            fingerprint: row.get("fingerprint"),
        })
        .collect())
}
