//! Database schema creation
//!
//! All tables are created on startup with `CREATE TABLE IF NOT EXISTS`.
//! The unique indices on `tracks.isrc`, `tracks.fingerprint`,
//! `artists(lower(name))`, `stations.stream_url` and `fingerprints.hash`
//! are the source of truth for identity deduplication; the resolver
//! relies on conflicts from these to detect lost races.

use sodav_common::Result;
use sqlx::SqlitePool;

/// Create all detection-core tables and indices.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    tracing::info!("Initializing detection core database schema");

    create_stations_table(pool).await?;
    create_artists_table(pool).await?;
    create_tracks_table(pool).await?;
    create_fingerprints_table(pool).await?;
    create_detections_table(pool).await?;
    create_stats_tables(pool).await?;
    create_station_health_table(pool).await?;
    create_acoustid_cache_table(pool).await?;

    Ok(())
}

async fn create_stations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            stream_url TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active', 'inactive', 'offline')),
            failure_count INTEGER NOT NULL DEFAULT 0,
            last_check_at TEXT,
            last_detection_at TEXT,
            total_play_time_s REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_artists_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artists (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            label TEXT,
            total_plays INTEGER NOT NULL DEFAULT 0,
            total_play_time_s REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS artists_name_lower ON artists (lower(name))",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_tracks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tracks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            artist_id INTEGER NOT NULL REFERENCES artists(id),
            isrc TEXT UNIQUE,
            label TEXT,
            album TEXT,
            release_date TEXT,
            duration_s REAL,
            fingerprint TEXT UNIQUE,
            fingerprint_raw BLOB,
            chromaprint TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS tracks_title_artist ON tracks (lower(title), artist_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_fingerprints_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fingerprints (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            track_id INTEGER NOT NULL REFERENCES tracks(id),
            hash TEXT NOT NULL UNIQUE,
            raw_data BLOB,
            offset_s REAL NOT NULL DEFAULT 0,
            algorithm TEXT NOT NULL DEFAULT 'sha256',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS fingerprints_track ON fingerprints (track_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_detections_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS detections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            track_id INTEGER NOT NULL REFERENCES tracks(id),
            station_id INTEGER NOT NULL REFERENCES stations(id),
            detected_at TEXT NOT NULL,
            end_time TEXT NOT NULL,
            play_duration_s REAL NOT NULL CHECK (play_duration_s >= 0),
            confidence REAL NOT NULL,
            detection_method TEXT NOT NULL,
            fingerprint TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS detections_station_time ON detections (station_id, detected_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_stats_tables(pool: &SqlitePool) -> Result<()> {
    // The rolling average keeps its running sum next to it so updates
    // never re-derive the sum from `average * (n - 1)`.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS station_track_stats (
            station_id INTEGER NOT NULL REFERENCES stations(id),
            track_id INTEGER NOT NULL REFERENCES tracks(id),
            play_count INTEGER NOT NULL DEFAULT 0,
            total_play_time_s REAL NOT NULL DEFAULT 0,
            last_played TEXT,
            confidence_sum REAL NOT NULL DEFAULT 0,
            average_confidence REAL NOT NULL DEFAULT 0,
            PRIMARY KEY (station_id, track_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS track_stats (
            track_id INTEGER PRIMARY KEY REFERENCES tracks(id),
            total_plays INTEGER NOT NULL DEFAULT 0,
            total_play_time_s REAL NOT NULL DEFAULT 0,
            last_detected TEXT,
            confidence_sum REAL NOT NULL DEFAULT 0,
            average_confidence REAL NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS artist_stats (
            artist_id INTEGER PRIMARY KEY REFERENCES artists(id),
            total_plays INTEGER NOT NULL DEFAULT 0,
            total_play_time_s REAL NOT NULL DEFAULT 0,
            last_detected TEXT,
            confidence_sum REAL NOT NULL DEFAULT 0,
            average_confidence REAL NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_station_health_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS station_health (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            station_id INTEGER NOT NULL REFERENCES stations(id),
            status TEXT NOT NULL,
            response_time_ms INTEGER,
            content_type TEXT,
            error TEXT,
            checked_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS station_health_station_time ON station_health (station_id, checked_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_acoustid_cache_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS acoustid_cache (
            fingerprint_hash TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            cached_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
