use crate::SUPPORTED_EXTENSIONS;
use crate::db::Database;
use crate::db::models::NewTrack;
use crc::{CRC_64_ECMA_182, Crc};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

const KEY_HASH: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Db(#[from] crate::db::DbError),
    #[error("Library root not found: {0}")]
    MissingRoot(String),
    #[error("No unique name available for {0}")]
    NameCollision(String),
}

#[derive(Debug)]
pub struct ScanResult {
    pub scanned: u64,
    pub new: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// Stable track identity: hex CRC-64 of the absolute path.
pub fn path_key(path: &Path) -> String {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    format!("{:016x}", KEY_HASH.checksum(canonical.to_string_lossy().as_bytes()))
}

/// Identity of a library (a set of scan roots), independent of argument order.
pub fn library_key(roots: &[String]) -> String {
    let mut canonical: Vec<String> = roots
        .iter()
        .map(|r| {
            Path::new(r)
                .canonicalize()
                .unwrap_or_else(|_| PathBuf::from(r))
                .to_string_lossy()
                .to_string()
        })
        .collect();
    canonical.sort();
    canonical.dedup();
    format!("{:016x}", KEY_HASH.checksum(canonical.join("\n").as_bytes()))
}

/// Known category of a file: the first directory below the library root.
/// Files directly in the root have none.
pub fn category_for(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut components = rel.components();
    let first = components.next()?;
    // A lone component is the file itself
    components.next()?;
    match first {
        Component::Normal(dir) => Some(dir.to_string_lossy().to_string()),
        _ => None,
    }
}

/// Scan directories for audio files and insert/update tracks in the database.
pub fn scan(db: &Database, paths: &[String], force: bool) -> std::result::Result<ScanResult, ScanError> {
    // First pass: collect all audio file paths with the root they were found under
    let mut audio_files: Vec<(PathBuf, walkdir::DirEntry)> = Vec::new();

    for path in paths {
        let root = Path::new(path);
        if !root.is_dir() {
            return Err(ScanError::MissingRoot(path.clone()));
        }
        let root = root.canonicalize()?;
        for entry in WalkDir::new(&root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let ext = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();
            if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
                audio_files.push((root.clone(), entry));
            }
        }
    }

    let total = audio_files.len() as u64;
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}) ({eta}) {msg}"
        )
        .unwrap()
        .progress_chars("#>-"),
    );
    pb.set_message("Scanning...");

    let mut result = ScanResult {
        scanned: 0,
        new: 0,
        updated: 0,
        skipped: 0,
        errors: 0,
    };

    // Wrap all inserts in a single transaction for dramatic speedup
    let tx = db.conn.unchecked_transaction().map_err(crate::db::DbError::from)?;

    for (root, entry) in &audio_files {
        let path = entry.path();
        result.scanned += 1;

        match process_file(db, root, path, force) {
            Ok(FileAction::New) => result.new += 1,
            Ok(FileAction::Updated) => result.updated += 1,
            Ok(FileAction::Skipped) => result.skipped += 1,
            Err(e) => {
                log::warn!("Error scanning {}: {}", path.display(), e);
                result.errors += 1;
            }
        }

        pb.inc(1);
    }

    tx.commit().map_err(crate::db::DbError::from)?;

    pb.finish_with_message(format!(
        "Done: {} new, {} updated, {} skipped, {} errors",
        result.new, result.updated, result.skipped, result.errors
    ));

    Ok(result)
}

enum FileAction {
    New,
    Updated,
    Skipped,
}

fn process_file(
    db: &Database,
    root: &Path,
    path: &Path,
    force: bool,
) -> std::result::Result<FileAction, ScanError> {
    let meta = std::fs::metadata(path)?;
    let file_size = meta.len() as i64;
    let file_modified = format_mtime(&meta);
    let file_path = path.to_string_lossy().to_string();

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let existing = db.track_id_by_path(&file_path)?;

    // Skip if unchanged and not forced
    if !force && db.track_unchanged(&file_path, file_size, &file_modified)? {
        return Ok(FileAction::Skipped);
    }

    let category = category_for(root, path);
    let name = unique_name(db, root, path, category.as_deref())?;

    let id = db.upsert_track(&NewTrack {
        file_path,
        track_key: path_key(path),
        name,
        category,
        file_size,
        file_modified,
        format: ext,
    })?;

    match existing {
        None => Ok(FileAction::New),
        Some(_) => {
            // Content changed: embeddings, distances and labels are stale
            db.invalidate_track(id)?;
            Ok(FileAction::Updated)
        }
    }
}

/// The file name, unless another path already owns it; then
/// `category/file name`, then the full path relative to the root.
fn unique_name(
    db: &Database,
    root: &Path,
    path: &Path,
    category: Option<&str>,
) -> std::result::Result<String, ScanError> {
    let file_path = path.to_string_lossy();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file_path.to_string());

    let mut candidates = vec![file_name.clone()];
    if let Some(category) = category {
        candidates.push(format!("{}/{}", category, file_name));
    }
    if let Ok(rel) = path.strip_prefix(root) {
        candidates.push(rel.to_string_lossy().to_string());
    }
    candidates.push(file_path.to_string());

    for candidate in candidates {
        if !db.name_taken(&candidate, &file_path)? {
            return Ok(candidate);
        }
    }
    Err(ScanError::NameCollision(file_path.to_string()))
}

fn format_mtime(meta: &std::fs::Metadata) -> String {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs().to_string())
        .unwrap_or_default()
}
