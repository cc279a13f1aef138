//! Local fingerprint matching
//!
//! Cheapest rung of the recognition hierarchy: resolves a window against
//! the in-store fingerprint index before any network call. Search order
//! is chroma-sequence exact, then digest exact, then a similarity scan
//! over the whole index with a 0.70 acceptance floor.

use crate::db::fingerprints::{self, ALGORITHM_CHROMAPRINT};
use crate::error::DetectResult;
use crate::services::fingerprinter::{chromaprint_similarity, COMPARE_SYMBOLS};
use crate::types::{DetectionMethod, FingerprintData, MatchSource, RecognitionMatch, TrackMetadata};
use sqlx::{Row, SqliteConnection, SqlitePool};

/// Similarity floor for the fuzzy scan.
const SIMILARITY_THRESHOLD: f64 = 0.70;

/// Local fingerprint matcher.
#[derive(Clone)]
pub struct LocalMatcher {
    pool: SqlitePool,
}

impl LocalMatcher {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Look up a window fingerprint in the local index.
    pub async fn find(
        &self,
        fingerprint: &FingerprintData,
    ) -> DetectResult<Option<RecognitionMatch>> {
        let mut conn = self.pool.acquire().await?;

        // 1. Chroma-sequence exact match
        if let Some(chromaprint) = &fingerprint.chromaprint {
            let prefix: String = chromaprint.chars().take(COMPARE_SYMBOLS).collect();
            if let Some(row) =
                fingerprints::find_by_hash(&mut conn, &prefix, Some(ALGORITHM_CHROMAPRINT)).await?
            {
                tracing::debug!(track_id = row.track_id, "exact chroma-sequence match");
                return self
                    .build_match(&mut conn, row.track_id, &row.hash, 1.0, DetectionMethod::LocalExact)
                    .await;
            }
        }

        // 2. Digest exact match
        if let Some(row) = fingerprints::find_by_hash(&mut conn, &fingerprint.hash, None).await? {
            tracing::debug!(track_id = row.track_id, "exact fingerprint match");
            return self
                .build_match(&mut conn, row.track_id, &row.hash, 1.0, DetectionMethod::LocalExact)
                .await;
        }

        // 3. Similarity scan; rows arrive newest-first so the most recent
        //    wins similarity ties via the strict comparison below.
        let candidate_prefix: Option<String> = fingerprint
            .chromaprint
            .as_ref()
            .map(|cp| cp.chars().take(COMPARE_SYMBOLS).collect());

        let all = fingerprints::load_all(&mut conn).await?;
        let mut best: Option<(i64, String, f64)> = None;

        for row in &all {
            let similarity = if row.algorithm == ALGORITHM_CHROMAPRINT {
                match &candidate_prefix {
                    Some(prefix) => chromaprint_similarity(prefix, &row.hash),
                    None => 0.0,
                }
            } else if row.hash == fingerprint.hash {
                1.0
            } else {
                0.0
            };

            if similarity >= SIMILARITY_THRESHOLD
                && best.as_ref().map_or(true, |(_, _, s)| similarity > *s)
            {
                best = Some((row.track_id, row.hash.clone(), similarity));
            }
        }

        match best {
            Some((track_id, hash, similarity)) => {
                tracing::debug!(track_id, similarity, "fuzzy fingerprint match");
                self.build_match(&mut conn, track_id, &hash, similarity, DetectionMethod::LocalFuzzy)
                    .await
            }
            None => Ok(None),
        }
    }

    async fn build_match(
        &self,
        conn: &mut SqliteConnection,
        track_id: i64,
        _matched_hash: &str,
        confidence: f64,
        method: DetectionMethod,
    ) -> DetectResult<Option<RecognitionMatch>> {
        let row = sqlx::query(
            r#"
            SELECT t.id, t.title, t.isrc, t.label, t.album, t.release_date,
                   t.duration_s, a.name AS artist_name
            FROM tracks t JOIN artists a ON a.id = t.artist_id
            WHERE t.id = ?
            "#,
        )
        .bind(track_id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            // Dangling index row; treat as a miss rather than failing the window
            tracing::warn!(track_id, "fingerprint row references missing track");
            return Ok(None);
        };

        Ok(Some(RecognitionMatch {
            track_id: Some(track_id),
            metadata: TrackMetadata {
                title: row.get("title"),
                artist: row.get("artist_name"),
                album: row.get("album"),
                isrc: row.get("isrc"),
                label: row.get("label"),
                release_date: row.get("release_date"),
                duration_s: row.get("duration_s"),
            },
            fingerprint: None,
            confidence,
            source: MatchSource::Local,
            detection_method: method,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fingerprints::{insert_fingerprint, ALGORITHM_SHA256};
    use crate::db::{artists, init_schema, tracks};
    use sodav_common::db::init_memory_pool;

    async fn seeded_pool() -> (SqlitePool, i64) {
        let pool = init_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();
        let artist_id = artists::insert_artist(&mut conn, "Ismael Lo", None)
            .await
            .unwrap();
        let track_id = tracks::insert_track(
            &mut conn,
            &tracks::NewTrack {
                title: "Tajabone",
                artist_id,
                isrc: Some("SNA010000001"),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        drop(conn);
        (pool, track_id)
    }

    fn fp(hash: &str, chromaprint: Option<&str>) -> FingerprintData {
        FingerprintData {
            hash: hash.to_string(),
            raw: vec![0u8; 32],
            chromaprint: chromaprint.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_exact_digest_match() {
        let (pool, track_id) = seeded_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        insert_fingerprint(&mut conn, track_id, "deadbeef", None, 0.0, ALGORITHM_SHA256)
            .await
            .unwrap();
        drop(conn);

        let matcher = LocalMatcher::new(pool);
        let found = matcher.find(&fp("deadbeef", None)).await.unwrap().unwrap();
        assert_eq!(found.track_id, Some(track_id));
        assert_eq!(found.confidence, 1.0);
        assert_eq!(found.detection_method, DetectionMethod::LocalExact);
        assert_eq!(found.metadata.title, "Tajabone");
        assert_eq!(found.metadata.isrc.as_deref(), Some("SNA010000001"));
    }

    #[tokio::test]
    async fn test_chroma_sequence_exact_match() {
        let (pool, track_id) = seeded_pool().await;
        let chromaprint = "QWERTYUIOPASDFGHJKLZXCVBNMqwerty_extra_tail";
        let prefix: String = chromaprint.chars().take(COMPARE_SYMBOLS).collect();
        let mut conn = pool.acquire().await.unwrap();
        insert_fingerprint(&mut conn, track_id, &prefix, None, 0.0, ALGORITHM_CHROMAPRINT)
            .await
            .unwrap();
        drop(conn);

        let matcher = LocalMatcher::new(pool);
        let found = matcher
            .find(&fp("unrelated", Some(chromaprint)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.track_id, Some(track_id));
        assert_eq!(found.detection_method, DetectionMethod::LocalExact);
    }

    #[tokio::test]
    async fn test_fuzzy_match_above_threshold() {
        let (pool, track_id) = seeded_pool().await;
        // 4 of 32 symbols differ: similarity 0.875
        let stored = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        let candidate = "BBBBAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        let mut conn = pool.acquire().await.unwrap();
        insert_fingerprint(&mut conn, track_id, stored, None, 0.0, ALGORITHM_CHROMAPRINT)
            .await
            .unwrap();
        drop(conn);

        let matcher = LocalMatcher::new(pool);
        let found = matcher
            .find(&fp("nomatch", Some(candidate)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.detection_method, DetectionMethod::LocalFuzzy);
        assert!((found.confidence - 0.875).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_below_threshold_is_miss() {
        let (pool, track_id) = seeded_pool().await;
        let stored = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        // 16 of 32 differ: similarity 0.5
        let candidate = "BBBBBBBBBBBBBBBBAAAAAAAAAAAAAAAA";
        let mut conn = pool.acquire().await.unwrap();
        insert_fingerprint(&mut conn, track_id, stored, None, 0.0, ALGORITHM_CHROMAPRINT)
            .await
            .unwrap();
        drop(conn);

        let matcher = LocalMatcher::new(pool);
        assert!(matcher
            .find(&fp("nomatch", Some(candidate)))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_empty_index_is_miss() {
        let (pool, _) = seeded_pool().await;
        let matcher = LocalMatcher::new(pool);
        assert!(matcher.find(&fp("anything", None)).await.unwrap().is_none());
    }
}
