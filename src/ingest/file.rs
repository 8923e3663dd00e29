//! Uploaded video files.
//!
//! Uploads land in the upload directory as `<video_id>.<ext>`. This module
//! resolves a `start_processing` request to a local path:
//! - an explicit `file_path` wins, a bare `video_id` is looked up by stem
//! - only local paths (no URL schemes)
//! - only the allowed container extensions
//!
//! Storing uploads is the transport's job; deleting them after processing is
//! the orchestrator's. Only files that canonicalize to a path inside the
//! upload directory count as uploads. An explicit `file_path` elsewhere is
//! read but never deleted.

use std::path::{Path, PathBuf};

use crate::error::{Result, SentinelError};

pub const ALLOWED_EXTENSIONS: [&str; 5] = ["mp4", "avi", "mov", "mkv", "webm"];

/// Resolve an uploaded video to a readable local file.
pub fn resolve_upload(upload_dir: &Path, video_id: &str, file_path: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = file_path.filter(|p| !p.trim().is_empty()) {
        return checked_local_file(Path::new(path));
    }

    if !is_plain_id(video_id) {
        return Err(SentinelError::InvalidInput(format!(
            "video id '{}' is not a plain file stem",
            video_id
        )));
    }

    let entries = std::fs::read_dir(upload_dir).map_err(|e| {
        SentinelError::NotFound(format!(
            "upload directory {} is not readable: {}",
            upload_dir.display(),
            e
        ))
    })?;
    let mut matches: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.file_stem().and_then(|s| s.to_str()) == Some(video_id))
        .collect();
    matches.sort();

    match matches.into_iter().next() {
        Some(path) => checked_local_file(&path),
        None => Err(SentinelError::NotFound(format!(
            "no upload for video id {}",
            video_id
        ))),
    }
}

/// Reject paths with unsupported extensions, URL schemes, or that do not exist.
fn checked_local_file(path: &Path) -> Result<PathBuf> {
    let display = path.display().to_string();
    if display.contains("://") {
        return Err(SentinelError::InvalidInput(format!(
            "file sources must be local paths, got {}",
            display
        )));
    }
    validate_extension(path)?;
    if !path.is_file() {
        return Err(SentinelError::NotFound(format!("video file {} does not exist", display)));
    }
    Ok(path.to_path_buf())
}

pub fn validate_extension(path: &Path) -> Result<()> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(())
    } else {
        Err(SentinelError::InvalidInput(format!(
            "unsupported video format '{}', use one of: {}",
            extension,
            ALLOWED_EXTENSIONS.join(", ")
        )))
    }
}

/// True when `path` resolves to a file inside `upload_dir`.
pub fn is_upload(upload_dir: &Path, path: &Path) -> bool {
    match (upload_dir.canonicalize(), path.canonicalize()) {
        (Ok(dir), Ok(file)) => file != dir && file.starts_with(&dir),
        _ => false,
    }
}

fn is_plain_id(video_id: &str) -> bool {
    !video_id.is_empty()
        && video_id != "."
        && video_id != ".."
        && !video_id.contains(['/', '\\'])
}
