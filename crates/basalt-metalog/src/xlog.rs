//! Framed append-only journal files.
//!
//! A journal file holds the metadata log for one signature (snapshot
//! epoch) and lives at `{dir}/{signature:020}.vylog`. Its format, all
//! integers little-endian:
//!
//! ```text
//! header     magic u32 | format version u32 | signature i64
//! frame      payload len u32 | crc32(payload) u32 | payload bytes
//! commit     0xFFFF_FFFF u32 | crc32 of all payloads since last commit
//! ```
//!
//! Frames become visible to the scanner only once followed by an intact
//! commit frame, which is what makes a batch atomic under crash: a torn
//! tail (truncated frame, checksum mismatch, missing commit frame) is
//! silently treated as end-of-log and trimmed away on the next append.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const XLOG_MAGIC: u32 = 0x564C_4F47; // "VLOG"
const XLOG_VERSION: u32 = 1;
const HEADER_LEN: u64 = 16;
const FRAME_HEADER_LEN: usize = 8;
/// Length sentinel marking a commit frame.
const COMMIT_SENTINEL: u32 = u32::MAX;
/// Upper bound on a single payload; larger lengths are treated as damage.
pub(crate) const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Path of the journal file for `signature` under `dir`.
#[must_use]
pub fn log_path(dir: &Path, signature: i64) -> PathBuf {
    dir.join(format!("{signature:020}.vylog"))
}

/// Path rotation writes to before the atomic rename.
#[must_use]
pub(crate) fn tmp_log_path(dir: &Path, signature: i64) -> PathBuf {
    dir.join(format!("{signature:020}.vylog.tmp"))
}

/// Flush directory metadata so a freshly created or renamed file survives
/// a crash. A no-op on platforms without directory fsync.
pub(crate) fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Outcome of scanning a journal byte image.
struct ScanOutcome {
    /// Payloads of committed transactions, in order.
    payloads: Vec<Vec<u8>>,
    /// File length up to and including the last intact commit frame.
    committed_len: u64,
}

fn scan_frames(bytes: &[u8], signature: i64) -> Result<ScanOutcome> {
    if bytes.len() < HEADER_LEN as usize {
        return Err(Error::Format(format!(
            "journal shorter than its header ({} bytes)",
            bytes.len()
        )));
    }
    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != XLOG_MAGIC {
        return Err(Error::Format(format!("bad journal magic {magic:#010x}")));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != XLOG_VERSION {
        return Err(Error::Format(format!("unsupported journal version {version}")));
    }
    let file_signature = i64::from_le_bytes([
        bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
    ]);
    if file_signature != signature {
        return Err(Error::Format(format!(
            "journal signature mismatch: file has {file_signature}, expected {signature}"
        )));
    }

    let mut pos = HEADER_LEN as usize;
    let mut committed_len = HEADER_LEN;
    let mut payloads: Vec<Vec<u8>> = Vec::new();
    let mut pending: Vec<Vec<u8>> = Vec::new();
    let mut tx_hasher = crc32fast::Hasher::new();

    loop {
        if pos + FRAME_HEADER_LEN > bytes.len() {
            break;
        }
        let len = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]);
        let crc = u32::from_le_bytes([
            bytes[pos + 4],
            bytes[pos + 5],
            bytes[pos + 6],
            bytes[pos + 7],
        ]);

        if len == COMMIT_SENTINEL {
            let tx_crc = tx_hasher.clone().finalize();
            if crc != tx_crc {
                tracing::warn!(offset = pos, "journal commit frame checksum mismatch");
                break;
            }
            pos += FRAME_HEADER_LEN;
            committed_len = pos as u64;
            payloads.append(&mut pending);
            tx_hasher = crc32fast::Hasher::new();
            continue;
        }

        if len > MAX_PAYLOAD_LEN {
            tracing::warn!(offset = pos, len, "oversized journal frame");
            break;
        }
        let body = pos + FRAME_HEADER_LEN;
        let Some(payload) = bytes.get(body..body + len as usize) else {
            break; // torn payload
        };
        if crc32fast::hash(payload) != crc {
            tracing::warn!(offset = pos, "journal frame checksum mismatch");
            break;
        }
        tx_hasher.update(payload);
        pending.push(payload.to_vec());
        pos = body + len as usize;
    }

    if committed_len < bytes.len() as u64 {
        tracing::warn!(
            committed_len,
            file_len = bytes.len(),
            "journal has an uncommitted or damaged tail"
        );
    }
    Ok(ScanOutcome {
        payloads,
        committed_len,
    })
}

// =============================================================================
// Writer
// =============================================================================

/// Append handle over one journal file.
///
/// Frames are staged in memory by [`append`](Self::append) and reach the
/// file only in [`commit`](Self::commit), as a single write followed by
/// an fsync. Dropping the writer closes the file.
pub(crate) struct XlogWriter {
    file: File,
    path: PathBuf,
    committed_len: u64,
    batch: Vec<u8>,
    batch_hasher: crc32fast::Hasher,
    staged: usize,
}

impl XlogWriter {
    /// Open the journal for `signature` under `dir` for appending, or
    /// create it if absent. An existing file is truncated back to its
    /// committed prefix so fresh appends never follow a torn tail.
    pub fn open(dir: &Path, signature: i64) -> Result<Self> {
        let path = log_path(dir, signature);
        if path.exists() {
            Self::open_existing(path, signature)
        } else {
            Self::create(path, signature, dir)
        }
    }

    /// Create a fresh journal at an explicit path. Fails if the file
    /// already exists. Used by rotation to build the replacement file.
    pub fn create_at(path: &Path, signature: i64, dir: &Path) -> Result<Self> {
        Self::create(path.to_path_buf(), signature, dir)
    }

    fn create(path: PathBuf, signature: i64, dir: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(&XLOG_MAGIC.to_le_bytes());
        header.extend_from_slice(&XLOG_VERSION.to_le_bytes());
        header.extend_from_slice(&signature.to_le_bytes());
        file.write_all(&header)?;
        file.sync_all()?;
        fsync_dir(dir)?;
        tracing::debug!(path = %path.display(), signature, "journal created");
        Ok(Self {
            file,
            path,
            committed_len: HEADER_LEN,
            batch: Vec::new(),
            batch_hasher: crc32fast::Hasher::new(),
            staged: 0,
        })
    }

    fn open_existing(path: PathBuf, signature: i64) -> Result<Self> {
        let bytes = std::fs::read(&path)?;
        let scan = scan_frames(&bytes, signature)?;
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        if scan.committed_len < bytes.len() as u64 {
            tracing::warn!(
                path = %path.display(),
                from = bytes.len(),
                to = scan.committed_len,
                "truncating journal to its committed prefix"
            );
            file.set_len(scan.committed_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(scan.committed_len))?;
        Ok(Self {
            file,
            path,
            committed_len: scan.committed_len,
            batch: Vec::new(),
            batch_hasher: crc32fast::Hasher::new(),
            staged: 0,
        })
    }

    /// Stage one payload as a frame of the current batch.
    pub fn append(&mut self, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD_LEN)
            .ok_or_else(|| {
                Error::Format(format!("journal payload of {} bytes is too large", payload.len()))
            })?;
        self.batch.extend_from_slice(&len.to_le_bytes());
        self.batch.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
        self.batch.extend_from_slice(payload);
        self.batch_hasher.update(payload);
        self.staged += 1;
        Ok(())
    }

    /// Write the staged batch plus its commit frame, then fsync.
    ///
    /// On error the staged batch is discarded and the file is rolled back
    /// to its last committed length, so a half-written batch never
    /// precedes later appends.
    pub fn commit(&mut self) -> Result<()> {
        if self.staged == 0 {
            return Ok(());
        }
        let tx_crc = self.batch_hasher.clone().finalize();
        self.batch.extend_from_slice(&COMMIT_SENTINEL.to_le_bytes());
        self.batch.extend_from_slice(&tx_crc.to_le_bytes());

        let written = self
            .file
            .write_all(&self.batch)
            .and_then(|()| self.file.sync_all());
        match written {
            Ok(()) => {
                self.committed_len += self.batch.len() as u64;
                self.clear_batch();
                Ok(())
            }
            Err(err) => {
                // Best effort: trim whatever part of the batch reached the file.
                let _ = self.file.set_len(self.committed_len);
                let _ = self.file.seek(SeekFrom::Start(self.committed_len));
                self.clear_batch();
                Err(err.into())
            }
        }
    }

    /// Rename the backing file in place (the handle stays valid) and
    /// flush the directory. Used by rotation to publish the new journal.
    pub fn rotate_rename(&mut self, to: &Path, dir: &Path) -> Result<()> {
        std::fs::rename(&self.path, to)?;
        fsync_dir(dir)?;
        self.path = to.to_path_buf();
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn clear_batch(&mut self) {
        self.batch.clear();
        self.batch_hasher = crc32fast::Hasher::new();
        self.staged = 0;
    }
}

// =============================================================================
// Scanner
// =============================================================================

/// Read-side iterator over the committed payloads of a journal file.
pub(crate) struct XlogScanner {
    payloads: std::vec::IntoIter<Vec<u8>>,
}

impl XlogScanner {
    /// Open and scan the journal for `signature` under `dir`.
    ///
    /// The whole file is validated up front; iteration itself cannot
    /// fail. Torn or damaged tails are trimmed silently.
    pub fn open(dir: &Path, signature: i64) -> Result<Self> {
        let bytes = std::fs::read(log_path(dir, signature))?;
        let scan = scan_frames(&bytes, signature)?;
        Ok(Self {
            payloads: scan.payloads.into_iter(),
        })
    }
}

impl Iterator for XlogScanner {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        self.payloads.next()
    }
}
