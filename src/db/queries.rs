use std::collections::HashMap;

use ndarray::Array2;
use rusqlite::{OptionalExtension, params};

use super::models::{
    LabelRow, LibraryStats, NewTrack, PlaylistEntry, PlaylistRow, SimilarityCache, StoredEmbedding, TrackRow,
};
use super::{Database, DbError, Result};
use crate::analyzer::decode::samples_from_le_bytes;
use crate::similarity::{Aggregation, SimilarityMatrix};
use crate::track::{Embedding, Track, TrackArena};

fn track_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrackRow> {
    Ok(TrackRow {
        id: row.get(0)?,
        track_key: row.get(1)?,
        file_path: row.get(2)?,
        name: row.get(3)?,
        category: row.get(4)?,
    })
}

fn encode_matrix(m: &Array2<f32>) -> Vec<u8> {
    m.iter().flat_map(|v| v.to_le_bytes()).collect()
}

impl Database {
    /// Insert or update a track. Returns the track id.
    pub fn upsert_track(&self, t: &NewTrack) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO tracks (
                file_path, track_key, name, category, file_size, file_modified, format, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))
            ON CONFLICT(file_path) DO UPDATE SET
                track_key = excluded.track_key,
                name = excluded.name,
                category = excluded.category,
                file_size = excluded.file_size,
                file_modified = excluded.file_modified,
                format = excluded.format,
                updated_at = datetime('now')
            ",
            params![
                t.file_path, t.track_key, t.name, t.category,
                t.file_size, t.file_modified, t.format,
            ],
        )?;

        let id: i64 = self.conn.query_row(
            "SELECT id FROM tracks WHERE file_path = ?1",
            params![t.file_path],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn track_id_by_path(&self, file_path: &str) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row("SELECT id FROM tracks WHERE file_path = ?1", params![file_path], |row| row.get(0))
            .optional()?)
    }

    /// Check if a file path already exists and hasn't changed (same size+mtime).
    pub fn track_unchanged(&self, file_path: &str, file_size: i64, file_modified: &str) -> Result<bool> {
        let result: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT file_size, file_modified FROM tracks WHERE file_path = ?1",
                params![file_path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(matches!(result, Some((size, mtime)) if size == file_size && mtime == file_modified))
    }

    /// Whether `name` already belongs to a track at a different path.
    pub fn name_taken(&self, name: &str, file_path: &str) -> Result<bool> {
        let owner: Option<String> = self
            .conn
            .query_row(
                "SELECT file_path FROM tracks WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner.is_some_and(|p| p != file_path))
    }

    /// Drop everything derived from a track's audio (after a content change).
    pub fn invalidate_track(&self, track_id: i64) -> Result<()> {
        self.conn.execute("DELETE FROM embeddings WHERE track_id = ?1", params![track_id])?;
        self.conn.execute(
            "DELETE FROM similarity WHERE track_a = ?1 OR track_b = ?1",
            params![track_id],
        )?;
        self.conn.execute("DELETE FROM similarity_tracks WHERE track_id = ?1", params![track_id])?;
        self.conn.execute("DELETE FROM labels WHERE track_id = ?1", params![track_id])?;
        Ok(())
    }

    /// Get all tracks (for --force re-analysis).
    pub fn get_all_tracks(&self) -> Result<Vec<TrackRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, track_key, file_path, name, category FROM tracks ORDER BY id",
        )?;
        let tracks = stmt
            .query_map([], track_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tracks)
    }

    /// Tracks with no embedding attempt on record.
    pub fn get_unembedded_tracks(&self) -> Result<Vec<TrackRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT t.id, t.track_key, t.file_path, t.name, t.category
             FROM tracks t
             LEFT JOIN embeddings e ON e.track_id = t.id
             WHERE e.track_id IS NULL
             ORDER BY t.id",
        )?;
        let tracks = stmt
            .query_map([], track_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tracks)
    }

    pub fn store_embedding(&self, track_id: i64, collapsed: &Array2<f32>, group_size: usize) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO embeddings
                (track_id, status, rows, dims, group_size, collapsed, error, analyzed_at)
             VALUES (?1, 'ok', ?2, ?3, ?4, ?5, NULL, ?6)",
            params![
                track_id,
                collapsed.nrows() as i64,
                collapsed.ncols() as i64,
                group_size as i64,
                encode_matrix(collapsed),
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn store_extraction_failure(&self, track_id: i64, error: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO embeddings
                (track_id, status, collapsed, error, analyzed_at)
             VALUES (?1, 'failed', NULL, ?2, ?3)",
            params![track_id, error, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Every successfully embedded track, ordered by name.
    pub fn load_embeddings(&self) -> Result<Vec<StoredEmbedding>> {
        let mut stmt = self.conn.prepare(
            "SELECT t.id, t.track_key, t.name, t.file_path, t.category, e.rows, e.dims, e.collapsed
             FROM embeddings e
             JOIN tracks t ON t.id = e.track_id
             WHERE e.status = 'ok'
             ORDER BY t.name",
        )?;

        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, Vec<u8>>(7)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(track_id, track_key, name, file_path, category, rows, dims, blob)| {
                let values = samples_from_le_bytes(&blob);
                let collapsed = Array2::from_shape_vec((rows as usize, dims as usize), values).map_err(|e| {
                    DbError::CorruptEmbedding {
                        track: name.clone(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(StoredEmbedding {
                    track_id,
                    track_key,
                    name,
                    file_path,
                    category,
                    collapsed,
                })
            })
            .collect()
    }

    /// Names of tracks whose last extraction failed.
    pub fn failed_tracks(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT t.name FROM embeddings e JOIN tracks t ON t.id = e.track_id
             WHERE e.status = 'failed' ORDER BY t.name",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Arena of every embedded track, with directory categories as known labels.
    pub fn build_arena(&self) -> Result<TrackArena> {
        let mut arena = TrackArena::new();
        for s in self.load_embeddings()? {
            let Some(embedding) = Embedding::from_collapsed(s.collapsed) else {
                return Err(DbError::CorruptEmbedding {
                    track: s.name,
                    reason: "empty matrix".to_string(),
                });
            };
            let mut track = Track::new(s.track_key, s.name, s.file_path, embedding);
            track.true_category = s.category;
            arena.insert(track)?;
        }
        Ok(arena)
    }

    /// Replace the stored matrix. Returns the number of pairs written.
    pub fn store_similarity(&self, matrix: &SimilarityMatrix) -> Result<usize> {
        let ids = self.track_ids_by_key()?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM similarity", [])?;
        tx.execute("DELETE FROM similarity_tracks", [])?;
        tx.execute(
            "INSERT OR REPLACE INTO similarity_meta (id, aggregation) VALUES (1, ?1)",
            params![matrix.aggregation().to_string()],
        )?;

        let resolve = |key: &str| {
            ids.get(key).copied().ok_or_else(|| DbError::CorruptEmbedding {
                track: key.to_string(),
                reason: "not in tracks table".to_string(),
            })
        };

        {
            let mut stmt = tx.prepare_cached("INSERT INTO similarity_tracks (track_id, position) VALUES (?1, ?2)")?;
            for (pos, key) in matrix.keys().iter().enumerate() {
                stmt.execute(params![resolve(key)?, pos as i64])?;
            }
        }

        let mut count = 0;
        {
            let mut stmt =
                tx.prepare_cached("INSERT INTO similarity (track_a, track_b, distance) VALUES (?1, ?2, ?3)")?;
            for (a, b, distance) in matrix.pairs() {
                let (a, b) = (resolve(a)?, resolve(b)?);
                stmt.execute(params![a.min(b), a.max(b), distance])?;
                count += 1;
            }
        }

        tx.commit()?;
        Ok(count)
    }

    /// The stored matrix, or `None` if nothing has been computed yet.
    pub fn load_similarity(&self) -> Result<Option<SimilarityCache>> {
        let mut stmt = self.conn.prepare(
            "SELECT t.id, t.track_key, t.name
             FROM similarity_tracks s JOIN tracks t ON t.id = s.track_id
             ORDER BY s.position",
        )?;
        let covered: Vec<(i64, String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if covered.is_empty() {
            return Ok(None);
        }

        let aggregation = self
            .conn
            .query_row("SELECT aggregation FROM similarity_meta WHERE id = 1", [], |row| {
                row.get::<_, String>(0)
            })
            .optional()?
            .ok_or_else(|| DbError::CorruptCache("no aggregation recorded".to_string()))?
            .parse::<Aggregation>()
            .map_err(DbError::CorruptCache)?;

        let n = covered.len();
        let index: HashMap<i64, usize> = covered.iter().enumerate().map(|(i, c)| (c.0, i)).collect();
        let mut distances = Array2::from_elem((n, n), f64::NAN);

        let mut stmt = self.conn.prepare("SELECT track_a, track_b, distance FROM similarity")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let (a, b, d): (i64, i64, f64) = (row.get(0)?, row.get(1)?, row.get(2)?);
            if let (Some(&i), Some(&j)) = (index.get(&a), index.get(&b)) {
                distances[[i, j]] = d;
                distances[[j, i]] = d;
            }
        }

        let (keys, names) = covered.into_iter().map(|(_, key, name)| (key, name)).unzip();
        Ok(Some(SimilarityCache {
            aggregation,
            keys,
            names,
            distances,
        }))
    }

    pub fn clear_similarity(&self) -> Result<()> {
        self.conn.execute_batch("DELETE FROM similarity; DELETE FROM similarity_tracks; DELETE FROM similarity_meta;")?;
        Ok(())
    }

    fn track_ids_by_key(&self) -> Result<HashMap<String, i64>> {
        let mut stmt = self.conn.prepare("SELECT track_key, id FROM tracks")?;
        let ids = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        Ok(ids)
    }

    /// Replace all stored labels.
    pub fn store_labels(&self, labels: &[LabelRow]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM labels", [])?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO labels (track_id, status, category, predicted_category, confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for l in labels {
                stmt.execute(params![l.track_id, l.status, l.category, l.predicted_category, l.confidence])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_labels(&self) -> Result<Vec<LabelRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT l.track_id, t.name, l.status, l.category, l.predicted_category, l.confidence
             FROM labels l JOIN tracks t ON t.id = l.track_id
             ORDER BY t.name",
        )?;
        let labels = stmt
            .query_map([], |row| {
                Ok(LabelRow {
                    track_id: row.get(0)?,
                    name: row.get(1)?,
                    status: row.get(2)?,
                    category: row.get(3)?,
                    predicted_category: row.get(4)?,
                    confidence: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(labels)
    }

    /// Tracks matching `query`: an exact name if there is one, otherwise
    /// every name or path containing it.
    pub fn find_tracks(&self, query: &str) -> Result<Vec<TrackRow>> {
        let exact: Option<TrackRow> = self
            .conn
            .query_row(
                "SELECT id, track_key, file_path, name, category FROM tracks WHERE name = ?1 OR file_path = ?1",
                params![query],
                track_row,
            )
            .optional()?;
        if let Some(t) = exact {
            return Ok(vec![t]);
        }

        let pattern = format!("%{}%", query);
        let mut stmt = self.conn.prepare(
            "SELECT id, track_key, file_path, name, category FROM tracks
             WHERE name LIKE ?1 OR file_path LIKE ?1
             ORDER BY name",
        )?;
        let tracks = stmt
            .query_map(params![pattern], track_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tracks)
    }

    /// Delete a track; its embedding, matrix entries, label and playlist entries go with it.
    pub fn remove_track(&self, track_id: i64) -> Result<bool> {
        let removed = self.conn.execute("DELETE FROM tracks WHERE id = ?1", params![track_id])?;
        Ok(removed > 0)
    }

    /// Store a playlist of (track name, distance from root) in order. The root comes first.
    pub fn create_playlist(&self, name: &str, tracks: &[(String, Option<f64>)]) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;
        let root_id: Option<i64> = match tracks.first() {
            Some((root, _)) => tx
                .query_row("SELECT id FROM tracks WHERE name = ?1", params![root], |row| row.get(0))
                .optional()?,
            None => None,
        };
        tx.execute(
            "INSERT INTO playlists (name, root_track_id) VALUES (?1, ?2)",
            params![name, root_id],
        )?;
        let playlist_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO playlist_tracks (playlist_id, position, track_id, distance)
                 SELECT ?1, ?2, id, ?4 FROM tracks WHERE name = ?3",
            )?;
            for (pos, (track, distance)) in tracks.iter().enumerate() {
                stmt.execute(params![playlist_id, pos as i64, track, distance])?;
            }
        }
        tx.commit()?;
        Ok(playlist_id)
    }

    pub fn list_playlists(&self) -> Result<Vec<PlaylistRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.id, p.name, t.name, COUNT(pt.track_id), p.created_at
             FROM playlists p
             LEFT JOIN tracks t ON t.id = p.root_track_id
             LEFT JOIN playlist_tracks pt ON pt.playlist_id = p.id
             GROUP BY p.id
             ORDER BY p.name",
        )?;
        let playlists = stmt
            .query_map([], |row| {
                Ok(PlaylistRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    root: row.get(2)?,
                    track_count: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(playlists)
    }

    /// Entries of the named playlist, or `None` if it does not exist.
    pub fn playlist_entries(&self, name: &str) -> Result<Option<Vec<PlaylistEntry>>> {
        let id: Option<i64> = self
            .conn
            .query_row("SELECT id FROM playlists WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?;
        let Some(id) = id else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT pt.position, t.name, t.file_path, pt.distance
             FROM playlist_tracks pt JOIN tracks t ON t.id = pt.track_id
             WHERE pt.playlist_id = ?1
             ORDER BY pt.position",
        )?;
        let entries = stmt
            .query_map(params![id], |row| {
                Ok(PlaylistEntry {
                    position: row.get(0)?,
                    name: row.get(1)?,
                    file_path: row.get(2)?,
                    distance: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Some(entries))
    }

    pub fn delete_playlist(&self, name: &str) -> Result<bool> {
        let removed = self.conn.execute("DELETE FROM playlists WHERE name = ?1", params![name])?;
        Ok(removed > 0)
    }

    /// Get library statistics.
    pub fn stats(&self) -> Result<LibraryStats> {
        let count = |sql: &str| -> Result<i64> { Ok(self.conn.query_row(sql, [], |row| row.get(0))?) };

        let total_tracks = count("SELECT COUNT(*) FROM tracks")?;
        let embedded_tracks = count("SELECT COUNT(*) FROM embeddings WHERE status = 'ok'")?;
        let failed_tracks = count("SELECT COUNT(*) FROM embeddings WHERE status = 'failed'")?;
        let similarity_tracks = count("SELECT COUNT(*) FROM similarity_tracks")?;
        let labeled_tracks = count("SELECT COUNT(*) FROM labels WHERE status IN ('root', 'confident')")?;
        let playlists = count("SELECT COUNT(*) FROM playlists")?;

        let mut fmt_stmt = self.conn.prepare(
            "SELECT format, COUNT(*) FROM tracks GROUP BY format ORDER BY COUNT(*) DESC",
        )?;
        let formats: Vec<(String, i64)> = fmt_stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut cat_stmt = self.conn.prepare(
            "SELECT COALESCE(category, '(none)'), COUNT(*)
             FROM tracks
             GROUP BY COALESCE(category, '(none)')
             ORDER BY COUNT(*) DESC",
        )?;
        let categories: Vec<(String, i64)> = cat_stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(LibraryStats {
            total_tracks,
            embedded_tracks,
            failed_tracks,
            similarity_tracks,
            labeled_tracks,
            playlists,
            formats,
            categories,
        })
    }
}
