//! Garbage collection of superseded journal files.
//!
//! Rotation leaves the previous journal on disk; once the replacement is
//! durable the old file (and any abandoned rotation temp file) is dead
//! weight. Collection is safe to run at any point when no rotation is in
//! flight for the same directory.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Remove journal files older than `keep_signature` from `dir`, plus any
/// leftover rotation temp files. Returns the number of files removed.
///
/// Individual unlink failures are logged and skipped; only a failure to
/// list the directory is an error.
pub async fn collect_garbage(dir: impl Into<PathBuf>, keep_signature: i64) -> Result<usize> {
    let dir = dir.into();
    tokio::task::spawn_blocking(move || collect_garbage_sync(&dir, keep_signature))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(format!("gc task failed: {e}"))))?
}

pub(crate) fn collect_garbage_sync(dir: &Path, keep_signature: i64) -> Result<usize> {
    let mut removed = 0usize;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let stale = match journal_signature(name) {
            Some(signature) => signature < keep_signature,
            None => name.ends_with(".vylog.tmp"),
        };
        if !stale {
            continue;
        }
        let path = entry.path();
        match std::fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                tracing::info!(path = %path.display(), "removed stale journal file");
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove stale journal file");
            }
        }
    }
    Ok(removed)
}

/// Signature encoded in a journal file name, if it is one.
fn journal_signature(name: &str) -> Option<i64> {
    name.strip_suffix(".vylog")?.parse::<i64>().ok()
}
