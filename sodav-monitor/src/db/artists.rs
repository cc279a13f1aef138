//! Artist persistence

use sodav_common::Result;
use sqlx::{Row, SqliteConnection};

/// Artist row
#[derive(Debug, Clone)]
pub struct Artist {
    pub id: i64,
    pub name: String,
    pub label: Option<String>,
}

/// Case-insensitive lookup by name.
pub async fn find_by_name(conn: &mut SqliteConnection, name: &str) -> Result<Option<Artist>> {
    let row = sqlx::query("SELECT id, name, label FROM artists WHERE lower(name) = lower(?)")
        .bind(name)
        .fetch_optional(conn)
        .await?;

    Ok(row.map(|r| Artist {
        id: r.get("id"),
        name: r.get("name"),
        label: r.get("label"),
    }))
}

/// Insert a new artist, returning its id.
pub async fn insert_artist(
    conn: &mut SqliteConnection,
    name: &str,
    label: Option<&str>,
) -> Result<i64> {
    let result = sqlx::query("INSERT INTO artists (name, label) VALUES (?, ?)")
        .bind(name)
        .bind(label)
        .execute(conn)
        .await?;
    Ok(result.last_insert_rowid())
}

/// Fill the label if it was previously unknown.
pub async fn backfill_label(
    conn: &mut SqliteConnection,
    artist_id: i64,
    label: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE artists SET label = ?, updated_at = datetime('now') WHERE id = ? AND label IS NULL",
    )
    .bind(label)
    .bind(artist_id)
    .execute(conn)
    .await?;
    Ok(())
}
