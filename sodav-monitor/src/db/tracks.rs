//! Track persistence
//!
//! Stored ISRCs are re-validated on read: rows written before the
//! validator was tightened may carry malformed codes, and those must not
//! participate in deduplication.

use sodav_common::{isrc, Result};
use sqlx::{Row, SqliteConnection};

/// Track row
#[derive(Debug, Clone)]
pub struct Track {
    pub id: i64,
    pub title: String,
    pub artist_id: i64,
    pub isrc: Option<String>,
    pub label: Option<String>,
    pub album: Option<String>,
    pub release_date: Option<String>,
    pub duration_s: Option<f64>,
    pub fingerprint: Option<String>,
    pub chromaprint: Option<String>,
}

/// New-track fields consumed by [`insert_track`].
#[derive(Debug, Clone, Default)]
pub struct NewTrack<'a> {
    pub title: &'a str,
    pub artist_id: i64,
    pub isrc: Option<&'a str>,
    pub label: Option<&'a str>,
    pub album: Option<&'a str>,
    pub release_date: Option<&'a str>,
    pub duration_s: Option<f64>,
    pub fingerprint: Option<&'a str>,
    pub fingerprint_raw: Option<&'a [u8]>,
    pub chromaprint: Option<&'a str>,
}

const TRACK_COLUMNS: &str = "id, title, artist_id, isrc, label, album, release_date, \
     duration_s, fingerprint, chromaprint";

fn track_from_row(row: &sqlx::sqlite::SqliteRow) -> Track {
    let stored_isrc: Option<String> = row.get("isrc");
    Track {
        id: row.get("id"),
        title: row.get("title"),
        artist_id: row.get("artist_id"),
        // Invalid legacy codes read as absent
        isrc: stored_isrc.filter(|code| isrc::is_valid(code)),
        label: row.get("label"),
        album: row.get("album"),
        release_date: row.get("release_date"),
        duration_s: row.get("duration_s"),
        fingerprint: row.get("fingerprint"),
        chromaprint: row.get("chromaprint"),
    }
}

/// Lookup by normalized ISRC.
pub async fn find_by_isrc(conn: &mut SqliteConnection, code: &str) -> Result<Option<Track>> {
    let row = sqlx::query(&format!("SELECT {} FROM tracks WHERE isrc = ?", TRACK_COLUMNS))
        .bind(code)
        .fetch_optional(conn)
        .await?;
    Ok(row.as_ref().map(track_from_row))
}

/// Lookup by the legacy fingerprint column.
pub async fn find_by_fingerprint(
    conn: &mut SqliteConnection,
    hash: &str,
) -> Result<Option<Track>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM tracks WHERE fingerprint = ?",
        TRACK_COLUMNS
    ))
    .bind(hash)
    .fetch_optional(conn)
    .await?;
    Ok(row.as_ref().map(track_from_row))
}

/// Lookup by case-folded title and artist.
pub async fn find_by_title_artist(
    conn: &mut SqliteConnection,
    title: &str,
    artist_id: i64,
) -> Result<Option<Track>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM tracks WHERE lower(title) = lower(?) AND artist_id = ?",
        TRACK_COLUMNS
    ))
    .bind(title)
    .bind(artist_id)
    .fetch_optional(conn)
    .await?;
    Ok(row.as_ref().map(track_from_row))
}

/// Load by id.
pub async fn load_track(conn: &mut SqliteConnection, track_id: i64) -> Result<Option<Track>> {
    let row = sqlx::query(&format!("SELECT {} FROM tracks WHERE id = ?", TRACK_COLUMNS))
        .bind(track_id)
        .fetch_optional(conn)
        .await?;
    Ok(row.as_ref().map(track_from_row))
}

/// Insert a new track, returning its id. Unique-index conflicts on
/// `isrc` or `fingerprint` surface as database errors for the resolver
/// to handle.
pub async fn insert_track(conn: &mut SqliteConnection, new: &NewTrack<'_>) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO tracks (
            title, artist_id, isrc, label, album, release_date,
            duration_s, fingerprint, fingerprint_raw, chromaprint
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(new.title)
    .bind(new.artist_id)
    .bind(new.isrc)
    .bind(new.label)
    .bind(new.album)
    .bind(new.release_date)
    .bind(new.duration_s)
    .bind(new.fingerprint)
    .bind(new.fingerprint_raw)
    .bind(new.chromaprint)
    .execute(conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Metadata updates applied to an existing track by the resolver.
#[derive(Debug, Clone, Default)]
pub struct TrackBackfill<'a> {
    pub isrc: Option<&'a str>,
    pub label: Option<&'a str>,
    pub album: Option<&'a str>,
    pub release_date: Option<&'a str>,
    pub fingerprint: Option<&'a str>,
    pub fingerprint_raw: Option<&'a [u8]>,
    pub chromaprint: Option<&'a str>,
}

/// Fill previously-null metadata fields on a dedupe hit. Populated
/// fields are never overwritten.
pub async fn backfill_metadata(
    conn: &mut SqliteConnection,
    track_id: i64,
    update: &TrackBackfill<'_>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tracks SET
            isrc = COALESCE(isrc, ?),
            label = COALESCE(label, ?),
            album = COALESCE(album, ?),
            release_date = COALESCE(release_date, ?),
            fingerprint = COALESCE(fingerprint, ?),
            fingerprint_raw = COALESCE(fingerprint_raw, ?),
            chromaprint = COALESCE(chromaprint, ?),
            updated_at = datetime('now')
        WHERE id = ?
        "#,
    )
    .bind(update.isrc)
    .bind(update.label)
    .bind(update.album)
    .bind(update.release_date)
    .bind(update.fingerprint)
    .bind(update.fingerprint_raw)
    .bind(update.chromaprint)
    .bind(track_id)
    .execute(conn)
    .await?;
    Ok(())
}
