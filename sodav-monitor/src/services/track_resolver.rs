//! Track identity resolution
//!
//! Turns a recognition match into a canonical Track row. Dedupe order:
//! ISRC, fingerprint index, legacy fingerprint column, then
//! case-folded (title, artist). A dedupe hit back-fills any metadata the
//! row was missing; a full miss creates artist, track, fingerprint rows
//! and the zeroed stats row in one transaction.
//!
//! The unique indices are the arbiter for concurrent resolves: when a
//! peer wins an ISRC or fingerprint insert race, the transaction fails
//! with a constraint conflict and the lookup path runs once more,
//! finding the winner's row.

use crate::db::{artists, fingerprints, tracks};
use crate::error::{DetectError, DetectResult};
use crate::services::fingerprinter::COMPARE_SYMBOLS;
use crate::types::RecognitionMatch;
use sodav_common::isrc;
use sqlx::{SqliteConnection, SqlitePool};

/// Which dedupe rung resolved the track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    ExistingId,
    ExistingIsrc,
    ExistingFingerprint,
    ExistingTitleArtist,
    Created,
}

/// Resolution outcome
#[derive(Debug, Clone)]
pub struct ResolvedTrack {
    pub track: tracks::Track,
    pub via: ResolvedVia,
}

/// Track identity resolver.
#[derive(Clone)]
pub struct TrackResolver {
    pool: SqlitePool,
}

impl TrackResolver {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Resolve a match to a canonical Track, creating rows as needed.
    pub async fn resolve(&self, matched: &RecognitionMatch) -> DetectResult<ResolvedTrack> {
        match self.resolve_once(matched).await {
            Ok(resolved) => Ok(resolved),
            Err(err) if err.is_unique_violation() => {
                // A concurrent resolver won the insert race; its row is
                // now visible to the lookup path.
                tracing::info!("identity insert race lost, re-running lookup");
                self.resolve_once(matched).await
            }
            Err(err) => Err(err),
        }
    }

    async fn resolve_once(&self, matched: &RecognitionMatch) -> DetectResult<ResolvedTrack> {
        let mut tx = self.pool.begin().await?;

        // A local match already names the row
        if let Some(track_id) = matched.track_id {
            if let Some(track) = tracks::load_track(&mut tx, track_id).await? {
                tx.commit().await?;
                return Ok(ResolvedTrack {
                    track,
                    via: ResolvedVia::ExistingId,
                });
            }
        }

        let meta = &matched.metadata;
        if meta.title.trim().is_empty() || meta.artist.trim().is_empty() {
            return Err(DetectError::InvalidAudio(
                "match carries no title/artist metadata".to_string(),
            ));
        }

        let valid_isrc = meta.isrc.as_deref().and_then(|raw| match isrc::parse(raw) {
            Ok(code) => Some(code),
            Err(err) => {
                tracing::warn!(%err, "dropping ISRC from match metadata");
                None
            }
        });

        let fp_hash = matched.fingerprint.as_ref().map(|fp| fp.hash.as_str());
        let fp_raw = matched.fingerprint.as_ref().map(|fp| fp.raw.as_slice());
        let chromaprint = matched
            .fingerprint
            .as_ref()
            .and_then(|fp| fp.chromaprint.as_deref());

        // 1. ISRC, the canonical key
        if let Some(code) = &valid_isrc {
            if let Some(track) = tracks::find_by_isrc(&mut tx, code).await? {
                tracing::info!(track_id = track.id, isrc = %code, "track found by ISRC");
                tracks::backfill_metadata(
                    &mut tx,
                    track.id,
                    &tracks::TrackBackfill {
                        label: meta.label.as_deref(),
                        album: meta.album.as_deref(),
                        release_date: meta.release_date.as_deref(),
                        fingerprint: fp_hash,
                        fingerprint_raw: fp_raw,
                        chromaprint,
                        ..Default::default()
                    },
                )
                .await?;
                self.attach_fingerprints(&mut tx, track.id, matched).await?;
                let track = tracks::load_track(&mut tx, track.id).await?.ok_or_else(|| {
                    DetectError::Database(sqlx::Error::RowNotFound)
                })?;
                tx.commit().await?;
                return Ok(ResolvedTrack {
                    track,
                    via: ResolvedVia::ExistingIsrc,
                });
            }
        }

        // 2. Fingerprint index, then the legacy column
        if let Some(hash) = fp_hash {
            let by_index = fingerprints::find_by_hash(&mut tx, hash, None).await?;
            let track = match by_index {
                Some(row) => tracks::load_track(&mut tx, row.track_id).await?,
                None => tracks::find_by_fingerprint(&mut tx, hash).await?,
            };
            if let Some(track) = track {
                tracing::info!(track_id = track.id, "track found by fingerprint");
                tracks::backfill_metadata(
                    &mut tx,
                    track.id,
                    &tracks::TrackBackfill {
                        isrc: valid_isrc.as_deref(),
                        label: meta.label.as_deref(),
                        album: meta.album.as_deref(),
                        release_date: meta.release_date.as_deref(),
                        ..Default::default()
                    },
                )
                .await?;
                let track = tracks::load_track(&mut tx, track.id).await?.ok_or_else(|| {
                    DetectError::Database(sqlx::Error::RowNotFound)
                })?;
                tx.commit().await?;
                return Ok(ResolvedTrack {
                    track,
                    via: ResolvedVia::ExistingFingerprint,
                });
            }
        }

        // 3. (title, artist)
        let existing_artist = artists::find_by_name(&mut tx, &meta.artist).await?;
        if let Some(artist) = &existing_artist {
            if let Some(track) =
                tracks::find_by_title_artist(&mut tx, &meta.title, artist.id).await?
            {
                tracing::info!(track_id = track.id, "track found by title and artist");
                tracks::backfill_metadata(
                    &mut tx,
                    track.id,
                    &tracks::TrackBackfill {
                        isrc: valid_isrc.as_deref(),
                        label: meta.label.as_deref(),
                        album: meta.album.as_deref(),
                        release_date: meta.release_date.as_deref(),
                        fingerprint: fp_hash,
                        fingerprint_raw: fp_raw,
                        chromaprint,
                    },
                )
                .await?;
                self.attach_fingerprints(&mut tx, track.id, matched).await?;
                let track = tracks::load_track(&mut tx, track.id).await?.ok_or_else(|| {
                    DetectError::Database(sqlx::Error::RowNotFound)
                })?;
                tx.commit().await?;
                return Ok(ResolvedTrack {
                    track,
                    via: ResolvedVia::ExistingTitleArtist,
                });
            }
        }

        // 4. Create
        let artist_id = match existing_artist {
            Some(artist) => {
                if let Some(label) = &meta.label {
                    artists::backfill_label(&mut tx, artist.id, label).await?;
                }
                artist.id
            }
            None => {
                let id = artists::insert_artist(&mut tx, &meta.artist, meta.label.as_deref())
                    .await?;
                tracing::info!(artist_id = id, name = %meta.artist, "created artist");
                id
            }
        };

        let track_id = tracks::insert_track(
            &mut tx,
            &tracks::NewTrack {
                title: &meta.title,
                artist_id,
                isrc: valid_isrc.as_deref(),
                label: meta.label.as_deref(),
                album: meta.album.as_deref(),
                release_date: meta.release_date.as_deref(),
                duration_s: meta.duration_s,
                fingerprint: fp_hash,
                fingerprint_raw: fp_raw,
                chromaprint,
            },
        )
        .await?;
        tracing::info!(track_id, title = %meta.title, artist = %meta.artist, "created track");

        self.attach_fingerprints(&mut tx, track_id, matched).await?;

        // Zeroed stats row so aggregation starts from a known state
        sqlx::query("INSERT OR IGNORE INTO track_stats (track_id) VALUES (?)")
            .bind(track_id)
            .execute(&mut *tx)
            .await?;

        let track = tracks::load_track(&mut tx, track_id).await?.ok_or_else(|| {
            DetectError::Database(sqlx::Error::RowNotFound)
        })?;
        tx.commit().await?;

        Ok(ResolvedTrack {
            track,
            via: ResolvedVia::Created,
        })
    }

    /// Index the match's fingerprint under both algorithms.
    async fn attach_fingerprints(
        &self,
        conn: &mut SqliteConnection,
        track_id: i64,
        matched: &RecognitionMatch,
    ) -> DetectResult<()> {
        let Some(fp) = &matched.fingerprint else {
            return Ok(());
        };

        fingerprints::insert_fingerprint(
            conn,
            track_id,
            &fp.hash,
            Some(&fp.raw),
            0.0,
            fingerprints::ALGORITHM_SHA256,
        )
        .await?;

        if let Some(chromaprint) = &fp.chromaprint {
            let prefix: String = chromaprint.chars().take(COMPARE_SYMBOLS).collect();
            fingerprints::insert_fingerprint(
                conn,
                track_id,
                &prefix,
                Some(chromaprint.as_bytes()),
                0.0,
                fingerprints::ALGORITHM_CHROMAPRINT,
            )
            .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_schema;
    use crate::types::{DetectionMethod, FingerprintData, MatchSource, TrackMetadata};
    use sodav_common::db::init_memory_pool;

    async fn resolver() -> TrackResolver {
        let pool = init_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        TrackResolver::new(pool)
    }

    fn external_match(title: &str, artist: &str, code: Option<&str>) -> RecognitionMatch {
        RecognitionMatch {
            track_id: None,
            metadata: TrackMetadata {
                title: title.to_string(),
                artist: artist.to_string(),
                isrc: code.map(str::to_string),
                ..Default::default()
            },
            fingerprint: None,
            confidence: 0.82,
            source: MatchSource::AcoustId,
            detection_method: DetectionMethod::AcoustId,
        }
    }

    #[tokio::test]
    async fn test_miss_creates_track_artist_and_stats() {
        let resolver = resolver().await;
        let resolved = resolver
            .resolve(&external_match("Set", "Youssou N'Dour", Some("SNA010000001")))
            .await
            .unwrap();

        assert_eq!(resolved.via, ResolvedVia::Created);
        assert_eq!(resolved.track.title, "Set");
        assert_eq!(resolved.track.isrc.as_deref(), Some("SNA010000001"));

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM track_stats WHERE track_id = ?")
                .bind(resolved.track.id)
                .fetch_one(&resolver.pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let resolver = resolver().await;
        let matched = external_match("Set", "Youssou N'Dour", Some("SNA010000001"));

        let first = resolver.resolve(&matched).await.unwrap();
        let second = resolver.resolve(&matched).await.unwrap();

        assert_eq!(first.track.id, second.track.id);
        assert_eq!(second.via, ResolvedVia::ExistingIsrc);
    }

    #[tokio::test]
    async fn test_isrc_dedupe_across_titles() {
        // Two providers disagree on the title but agree on the ISRC:
        // one row, the first title wins, metadata back-fills
        let resolver = resolver().await;

        let mut first = external_match("Set", "Youssou N'Dour", Some("SNA010000001"));
        first.metadata.album = None;
        let created = resolver.resolve(&first).await.unwrap();

        let mut second = external_match("Set (Live)", "Youssou N'Dour", Some("SNA010000001"));
        second.metadata.album = Some("Set".to_string());
        let resolved = resolver.resolve(&second).await.unwrap();

        assert_eq!(resolved.track.id, created.track.id);
        assert_eq!(resolved.track.title, "Set");
        assert_eq!(resolved.track.album.as_deref(), Some("Set"));

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tracks")
            .fetch_one(&resolver.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_invalid_isrc_dropped_not_stored() {
        let resolver = resolver().await;
        let resolved = resolver
            .resolve(&external_match("Song", "Artist", Some("NOT-VALID")))
            .await
            .unwrap();
        assert!(resolved.track.isrc.is_none());
    }

    #[tokio::test]
    async fn test_fingerprint_dedupe_attaches_isrc() {
        let resolver = resolver().await;
        let fp = FingerprintData {
            hash: "cc".repeat(32),
            raw: vec![0xCC; 32],
            chromaprint: Some("SEQSEQSEQSEQSEQSEQSEQSEQSEQSEQSE".to_string()),
        };

        let mut first = external_match("Yela", "Baaba Maal", None);
        first.fingerprint = Some(fp.clone());
        let created = resolver.resolve(&first).await.unwrap();
        assert!(created.track.isrc.is_none());

        // Same fingerprint, now with an ISRC and a different title spelling
        let mut second = external_match("YELA", "Baaba Maal", Some("SNA020000002"));
        second.fingerprint = Some(fp);
        let resolved = resolver.resolve(&second).await.unwrap();

        assert_eq!(resolved.track.id, created.track.id);
        assert_eq!(resolved.track.isrc.as_deref(), Some("SNA020000002"));
    }

    #[tokio::test]
    async fn test_title_artist_dedupe_case_insensitive() {
        let resolver = resolver().await;
        let created = resolver
            .resolve(&external_match("Tajabone", "Ismael Lo", None))
            .await
            .unwrap();
        let resolved = resolver
            .resolve(&external_match("TAJABONE", "ismael lo", None))
            .await
            .unwrap();

        assert_eq!(resolved.track.id, created.track.id);
        assert_eq!(resolved.via, ResolvedVia::ExistingTitleArtist);
    }

    #[tokio::test]
    async fn test_artist_reused_across_tracks() {
        let resolver = resolver().await;
        let a = resolver
            .resolve(&external_match("Song One", "Orchestra Baobab", None))
            .await
            .unwrap();
        let b = resolver
            .resolve(&external_match("Song Two", "Orchestra Baobab", None))
            .await
            .unwrap();

        assert_ne!(a.track.id, b.track.id);
        assert_eq!(a.track.artist_id, b.track.artist_id);
    }

    #[tokio::test]
    async fn test_local_match_resolves_by_id() {
        let resolver = resolver().await;
        let created = resolver
            .resolve(&external_match("Set", "Youssou N'Dour", None))
            .await
            .unwrap();

        let local = RecognitionMatch {
            track_id: Some(created.track.id),
            metadata: TrackMetadata::default(),
            fingerprint: None,
            confidence: 1.0,
            source: MatchSource::Local,
            detection_method: DetectionMethod::LocalExact,
        };
        let resolved = resolver.resolve(&local).await.unwrap();
        assert_eq!(resolved.via, ResolvedVia::ExistingId);
        assert_eq!(resolved.track.id, created.track.id);
    }

    #[tokio::test]
    async fn test_empty_metadata_rejected() {
        let resolver = resolver().await;
        let result = resolver.resolve(&external_match("", "", None)).await;
        assert!(result.is_err());
    }
}
