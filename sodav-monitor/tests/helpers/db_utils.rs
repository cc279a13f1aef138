//! Database test utilities

use sodav_monitor::db::{artists, fingerprints, init_schema, stations, tracks};
use sqlx::SqlitePool;

/// Fresh in-memory database with the full schema applied.
pub async fn setup_database() -> SqlitePool {
    let pool = sodav_common::db::init_memory_pool()
        .await
        .expect("in-memory pool");
    init_schema(&pool).await.expect("schema init");
    pool
}

/// Insert a station and return its id.
pub async fn seed_station(pool: &SqlitePool, name: &str) -> i64 {
    let url = format!("http://streams.test/{}", name.to_lowercase());
    stations::insert_station(pool, name, &url)
        .await
        .expect("station insert")
}

/// Insert an artist + track pair, returning `(track_id, artist_id)`.
pub async fn seed_track(pool: &SqlitePool, title: &str, artist: &str) -> (i64, i64) {
    let mut conn = pool.acquire().await.expect("acquire");
    let artist_id = match artists::find_by_name(&mut conn, artist).await.expect("find") {
        Some(existing) => existing.id,
        None => artists::insert_artist(&mut conn, artist, None)
            .await
            .expect("artist insert"),
    };
    let track_id = tracks::insert_track(
        &mut conn,
        &tracks::NewTrack {
            title,
            artist_id,
            ..Default::default()
        },
    )
    .await
    .expect("track insert");
    (track_id, artist_id)
}

/// Attach a digest fingerprint to a track so the local matcher can find it.
pub async fn seed_fingerprint(pool: &SqlitePool, track_id: i64, hash: &str) {
    let mut conn = pool.acquire().await.expect("acquire");
    fingerprints::insert_fingerprint(
        &mut conn,
        track_id,
        hash,
        None,
        0.0,
        fingerprints::ALGORITHM_SHA256,
    )
    .await
    .expect("fingerprint insert");
}
