pub mod models;
pub mod queries;

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Corrupt embedding for track {track}: {reason}")]
    CorruptEmbedding { track: String, reason: String },
    #[error("Corrupt similarity cache: {0}")]
    CorruptCache(String),
    #[error("Library error: {0}")]
    Arena(#[from] crate::track::ArenaError),
}

pub type Result<T> = std::result::Result<T, DbError>;

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version > SCHEMA_VERSION {
            return Err(DbError::Migration(format!(
                "database schema v{} is newer than this build (v{})",
                version, SCHEMA_VERSION
            )));
        }
        if version < 1 {
            self.migrate_v1()?;
        }
        if version < 2 {
            self.migrate_v2()?;
        }

        self.conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    /// V1: tracks, collapsed embeddings, similarity cache, labels, playlists
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tracks (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                track_key       TEXT NOT NULL UNIQUE,
                file_path       TEXT NOT NULL UNIQUE,
                name            TEXT NOT NULL UNIQUE,
                -- First directory under the library root, the known label
                category        TEXT,
                file_size       INTEGER NOT NULL,
                file_modified   TEXT NOT NULL,
                format          TEXT NOT NULL,

                created_at      TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_tracks_category ON tracks(category);
            CREATE INDEX IF NOT EXISTS idx_tracks_format ON tracks(format);

            CREATE TABLE IF NOT EXISTS embeddings (
                track_id        INTEGER PRIMARY KEY REFERENCES tracks(id) ON DELETE CASCADE,
                status          TEXT NOT NULL CHECK (status IN ('ok', 'failed')),
                rows            INTEGER NOT NULL DEFAULT 0,
                dims            INTEGER NOT NULL DEFAULT 0,
                group_size      INTEGER NOT NULL DEFAULT 0,
                -- Row-major little-endian f32, rows x dims
                collapsed       BLOB,
                error           TEXT,
                analyzed_at     TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS similarity_tracks (
                track_id        INTEGER PRIMARY KEY REFERENCES tracks(id) ON DELETE CASCADE,
                position        INTEGER NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS similarity (
                track_a         INTEGER NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
                track_b         INTEGER NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
                distance        REAL NOT NULL,
                PRIMARY KEY (track_a, track_b),
                CHECK (track_a < track_b)
            );

            CREATE INDEX IF NOT EXISTS idx_similarity_b ON similarity(track_b);

            CREATE TABLE IF NOT EXISTS labels (
                track_id            INTEGER PRIMARY KEY REFERENCES tracks(id) ON DELETE CASCADE,
                status              TEXT NOT NULL,
                category            TEXT,
                predicted_category  TEXT,
                confidence          REAL,
                updated_at          TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS playlists (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                name            TEXT NOT NULL UNIQUE,
                root_track_id   INTEGER REFERENCES tracks(id) ON DELETE SET NULL,
                created_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS playlist_tracks (
                playlist_id     INTEGER NOT NULL REFERENCES playlists(id) ON DELETE CASCADE,
                position        INTEGER NOT NULL,
                track_id        INTEGER NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
                distance        REAL,
                PRIMARY KEY (playlist_id, position)
            );
            ",
        )?;
        Ok(())
    }

    /// V2: record the aggregation the stored similarity matrix was reduced with.
    /// A v1 cache carries no record and is tagged with the default, mean.
    fn migrate_v2(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS similarity_meta (
                id              INTEGER PRIMARY KEY CHECK (id = 1),
                aggregation     TEXT NOT NULL
            );

            INSERT OR IGNORE INTO similarity_meta (id, aggregation)
                SELECT 1, 'mean' WHERE EXISTS (SELECT 1 FROM similarity_tracks);
            ",
        )?;
        Ok(())
    }
}

const SCHEMA_VERSION: i32 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_sets_version() {
        let db = Database::open_in_memory().unwrap();
        let version: i32 = db
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_reopen_file_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("library.db");
        Database::open(&path).unwrap();
        let db = Database::open(&path).unwrap();
        let tables: i64 = db
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 8);
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.db");
        {
            let db = Database::open(&path).unwrap();
            db.conn.pragma_update(None, "user_version", 99).unwrap();
        }
        assert!(matches!(Database::open(&path), Err(DbError::Migration(_))));
    }

    #[test]
    fn test_v1_cache_is_tagged_mean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.db");
        {
            let db = Database::open(&path).unwrap();
            db.conn
                .execute_batch(
                    "INSERT INTO tracks (track_key, file_path, name, file_size, file_modified, format)
                         VALUES ('k', '/m/a.mp3', 'a.mp3', 1, '0', 'mp3');
                     INSERT INTO similarity_tracks (track_id, position) VALUES (1, 0);
                     DROP TABLE similarity_meta;",
                )
                .unwrap();
            db.conn.pragma_update(None, "user_version", 1).unwrap();
        }
        let db = Database::open(&path).unwrap();
        let aggregation: String = db
            .conn
            .query_row("SELECT aggregation FROM similarity_meta WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(aggregation, "mean");
    }
}
