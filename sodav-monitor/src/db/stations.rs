//! Station persistence

use chrono::{DateTime, Utc};
use sodav_common::{Result, StationStatus};
use sqlx::{Row, SqliteConnection, SqlitePool};

/// Monitored station row
#[derive(Debug, Clone)]
pub struct Station {
    pub id: i64,
    pub name: String,
    pub stream_url: String,
    pub status: StationStatus,
    pub failure_count: i64,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_detection_at: Option<DateTime<Utc>>,
    pub total_play_time_s: f64,
}

fn station_from_row(row: &sqlx::sqlite::SqliteRow) -> Station {
    let status_str: String = row.get("status");
    Station {
        id: row.get("id"),
        name: row.get("name"),
        stream_url: row.get("stream_url"),
        status: StationStatus::parse(&status_str).unwrap_or(StationStatus::Offline),
        failure_count: row.get("failure_count"),
        last_check_at: row.get("last_check_at"),
        last_detection_at: row.get("last_detection_at"),
        total_play_time_s: row.get("total_play_time_s"),
    }
}

const STATION_COLUMNS: &str = "id, name, stream_url, status, failure_count, \
     last_check_at, last_detection_at, total_play_time_s";

/// Insert a station, returning its id.
pub async fn insert_station(pool: &SqlitePool, name: &str, stream_url: &str) -> Result<i64> {
    let result = sqlx::query("INSERT INTO stations (name, stream_url) VALUES (?, ?)")
        .bind(name)
        .bind(stream_url)
        .execute(pool)
        .await?;
    Ok(result.last_insert_rowid())
}

/// Load every station currently in `active` status.
pub async fn load_active_stations(pool: &SqlitePool) -> Result<Vec<Station>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM stations WHERE status = 'active' ORDER BY id",
        STATION_COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(station_from_row).collect())
}

/// Load one station by id.
pub async fn load_station(pool: &SqlitePool, station_id: i64) -> Result<Option<Station>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM stations WHERE id = ?",
        STATION_COLUMNS
    ))
    .bind(station_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(station_from_row))
}

/// Set a station's operational status.
pub async fn update_station_status(
    pool: &SqlitePool,
    station_id: i64,
    status: StationStatus,
) -> Result<()> {
    sqlx::query("UPDATE stations SET status = ?, updated_at = datetime('now') WHERE id = ?")
        .bind(status.as_str())
        .bind(station_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record a health probe outcome: stamps `last_check_at` and either
/// resets or increments the consecutive failure counter.
pub async fn record_station_check(
    pool: &SqlitePool,
    station_id: i64,
    succeeded: bool,
    checked_at: DateTime<Utc>,
) -> Result<i64> {
    if succeeded {
        sqlx::query(
            "UPDATE stations SET failure_count = 0, last_check_at = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(checked_at)
        .bind(station_id)
        .execute(pool)
        .await?;
        Ok(0)
    } else {
        sqlx::query(
            "UPDATE stations SET failure_count = failure_count + 1, last_check_at = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(checked_at)
        .bind(station_id)
        .execute(pool)
        .await?;

        let (count,): (i64,) = sqlx::query_as("SELECT failure_count FROM stations WHERE id = ?")
            .bind(station_id)
            .fetch_one(pool)
            .await?;
        Ok(count)
    }
}

/// Accumulate broadcast time onto the station row; part of the
/// finalization transaction.
pub async fn add_station_play_time(
    conn: &mut SqliteConnection,
    station_id: i64,
    play_duration_s: f64,
    detected_end: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE stations SET
            total_play_time_s = total_play_time_s + ?,
            last_detection_at = ?,
            updated_at = datetime('now')
        WHERE id = ?
        "#,
    )
    .bind(play_duration_s)
    .bind(detected_end)
    .bind(station_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Append a station_health history record.
pub async fn insert_health_record(
    pool: &SqlitePool,
    station_id: i64,
    status: &str,
    response_time_ms: Option<i64>,
    content_type: Option<&str>,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO station_health (station_id, status, response_time_ms, content_type, error)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(station_id)
    .bind(status)
    .bind(response_time_ms)
    .bind(content_type)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete health records older than `days`; returns the rows removed.
pub async fn cleanup_old_health_records(pool: &SqlitePool, days: i64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM station_health WHERE checked_at < datetime('now', '-' || ? || ' days')",
    )
    .bind(days)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
