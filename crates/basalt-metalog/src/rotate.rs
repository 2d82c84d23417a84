//! Journal rotation: rewrite the log so it describes only live state.
//!
//! Over time the journal accumulates records that cancel each other out
//! and tombstones of dropped indexes. Rotation rebuilds the in-memory
//! model from the current file, writes a minimal replacement journal at a
//! new signature, publishes it with an atomic rename, and swaps the
//! writer onto it. The old file is left behind for garbage collection.

use std::path::Path;

use crate::error::{Error, Result};
use crate::record::Record;
use crate::recovery::Recovery;
use crate::writer::MetaLog;
use crate::xlog::{self, XlogWriter};
use crate::gc;

impl MetaLog {
    /// Rotate the journal to `new_signature`.
    ///
    /// Holds the latch for the whole operation, so every transaction
    /// either committed before rotation (and is reflected in the new file
    /// through the rebuild) or commits after it (and lands only in the
    /// new file). On failure the writer keeps using the old journal and
    /// the partially written replacement is removed.
    pub async fn rotate(&self, new_signature: i64) -> Result<()> {
        let mut log = self.shared().latch.lock().await;
        if log.xlog.is_none() {
            return Err(Error::Closed);
        }
        let old_signature = log.signature;
        if new_signature <= old_signature {
            return Err(Error::Corrupt(format!(
                "rotation signature {new_signature} does not exceed current {old_signature}"
            )));
        }

        let dir = self.config().dir.clone();
        let rotated = tokio::task::spawn_blocking(move || {
            rotate_sync(&dir, old_signature, new_signature)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(format!("rotation task failed: {e}"))))?;

        let new_xlog = rotated?;
        log.xlog = Some(new_xlog);
        log.signature = new_signature;
        drop(log);
        tracing::info!(old_signature, new_signature, "metadata log rotated");

        if self.config().gc_on_rotate {
            // Best effort. The new journal is already durable; a stale
            // file on disk costs space, not correctness.
            if let Err(err) = gc::collect_garbage(self.config().dir.clone(), new_signature).await {
                tracing::warn!(error = %err, "post-rotation garbage collection failed");
            }
        }
        Ok(())
    }
}

fn rotate_sync(dir: &Path, old_signature: i64, new_signature: i64) -> Result<XlogWriter> {
    let recovery = Recovery::scan_sync(dir, old_signature)?;
    let tmp_path = xlog::tmp_log_path(dir, new_signature);

    let mut new_xlog = match write_compacted(&tmp_path, new_signature, &recovery, dir) {
        Ok(xlog) => xlog,
        Err(err) => {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(err);
        }
    };
    if let Err(err) = new_xlog.rotate_rename(&xlog::log_path(dir, new_signature), dir) {
        drop(new_xlog);
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(new_xlog)
}

/// Write the minimal journal describing `recovery`'s live state: one
/// transaction per live index, in ascending index id order.
fn write_compacted(
    path: &Path,
    signature: i64,
    recovery: &Recovery,
    dir: &Path,
) -> Result<XlogWriter> {
    let mut xlog = XlogWriter::create_at(path, signature, dir)?;
    let mut scratch = Vec::new();
    for batch in rotation_batches(recovery)? {
        for record in &batch {
            scratch.clear();
            record.encode(&mut scratch)?;
            xlog.append(&scratch)?;
        }
        xlog.commit()?;
    }
    Ok(xlog)
}

/// The record sequence rotation emits, one inner batch per live index.
pub(crate) fn rotation_batches(recovery: &Recovery) -> Result<Vec<Vec<Record>>> {
    let mut batches = Vec::new();
    for index_id in recovery.live_index_ids() {
        let mut batch = Vec::new();
        recovery.load_index(index_id, |record| {
            batch.push(record.clone());
            Ok(())
        })?;
        batches.push(batch);
    }
    Ok(batches)
}
