//! Fingerprint index persistence
//!
//! The `fingerprints` table is the authoritative lookup index: one Track
//! can carry several rows (different algorithms, different excerpts).
//! The `tracks.fingerprint` column is a kept legacy convenience.

use chrono::{DateTime, Utc};
use sodav_common::Result;
use sqlx::{Row, SqliteConnection};

/// Fingerprint algorithms stored in the index.
pub const ALGORITHM_SHA256: &str = "sha256";
pub const ALGORITHM_CHROMAPRINT: &str = "chromaprint";

/// Fingerprint index row
#[derive(Debug, Clone)]
pub struct FingerprintRow {
    pub id: i64,
    pub track_id: i64,
    pub hash: String,
    pub algorithm: String,
    pub offset_s: f64,
    pub created_at: DateTime<Utc>,
}

fn row_from(row: &sqlx::sqlite::SqliteRow) -> FingerprintRow {
    FingerprintRow {
        id: row.get("id"),
        track_id: row.get("track_id"),
        hash: row.get("hash"),
        algorithm: row.get("algorithm"),
        offset_s: row.get("offset_s"),
        created_at: row.get("created_at"),
    }
}

/// Exact hash lookup, optionally constrained to one algorithm.
pub async fn find_by_hash(
    conn: &mut SqliteConnection,
    hash: &str,
    algorithm: Option<&str>,
) -> Result<Option<FingerprintRow>> {
    let row = match algorithm {
        Some(algo) => {
            sqlx::query(
                "SELECT id, track_id, hash, algorithm, offset_s, created_at
                 FROM fingerprints WHERE hash = ? AND algorithm = ?",
            )
            .bind(hash)
            .bind(algo)
            .fetch_optional(conn)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT id, track_id, hash, algorithm, offset_s, created_at
                 FROM fingerprints WHERE hash = ?",
            )
            .bind(hash)
            .fetch_optional(conn)
            .await?
        }
    };

    Ok(row.as_ref().map(row_from))
}

/// Load the whole index for the similarity scan, newest first so the
/// most recent row wins similarity ties.
pub async fn load_all(conn: &mut SqliteConnection) -> Result<Vec<FingerprintRow>> {
    let rows = sqlx::query(
        "SELECT id, track_id, hash, algorithm, offset_s, created_at
         FROM fingerprints ORDER BY created_at DESC, id DESC",
    )
    .fetch_all(conn)
    .await?;
    Ok(rows.iter().map(row_from).collect())
}

/// Insert an index row; ignores an existing identical hash (the index
/// already points at a track for it).
pub async fn insert_fingerprint(
    conn: &mut SqliteConnection,
    track_id: i64,
    hash: &str,
    raw_data: Option<&[u8]>,
    offset_s: f64,
    algorithm: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO fingerprints (track_id, hash, raw_data, offset_s, algorithm)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(hash) DO NOTHING
        "#,
    )
    .bind(track_id)
    .bind(hash)
    .bind(raw_data)
    .bind(offset_s)
    .bind(algorithm)
    .execute(conn)
    .await?;
    Ok(())
}
