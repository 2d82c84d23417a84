//! Journal replay and the in-memory model of live LSM structure.
//!
//! [`Recovery`] scans one journal file and folds every committed record
//! into three id-keyed tables: indexes, ranges, and runs. Ranges and runs
//! hold the id of their owner rather than a reference, so dropping an
//! index frees its whole subtree by walking id lists.
//!
//! Dropped indexes stay in the table as tombstones: lookups can tell
//! "dropped" apart from "never existed". Rotation is what finally sheds
//! the tombstones.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::record::Record;
use crate::xlog::{self, XlogScanner};

/// Per-index recovery state.
#[derive(Debug, Clone, Default)]
pub struct IndexInfo {
    dropped: bool,
    ranges: Vec<i64>,
}

impl IndexInfo {
    /// True once a DROP_INDEX record was replayed for this index.
    #[must_use]
    pub fn is_dropped(&self) -> bool {
        self.dropped
    }

    /// Live range ids in journal insertion order.
    #[must_use]
    pub fn ranges(&self) -> &[i64] {
        &self.ranges
    }
}

/// Per-range recovery state.
#[derive(Debug, Clone)]
pub struct RangeInfo {
    index_id: i64,
    begin: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    runs: Vec<i64>,
}

impl RangeInfo {
    /// Id of the owning index.
    #[must_use]
    pub fn index_id(&self) -> i64 {
        self.index_id
    }

    /// Start of the key interval; `None` is unbounded.
    #[must_use]
    pub fn begin(&self) -> Option<&[u8]> {
        self.begin.as_deref()
    }

    /// End of the key interval; `None` is unbounded.
    #[must_use]
    pub fn end(&self) -> Option<&[u8]> {
        self.end.as_deref()
    }

    /// Live run ids in journal insertion order.
    #[must_use]
    pub fn runs(&self) -> &[i64] {
        &self.runs
    }
}

/// Per-run recovery state.
#[derive(Debug, Clone, Copy)]
pub struct RunInfo {
    range_id: i64,
}

impl RunInfo {
    /// Id of the owning range.
    #[must_use]
    pub fn range_id(&self) -> i64 {
        self.range_id
    }
}

/// In-memory model of all live indexes, rebuilt from one journal file.
#[derive(Debug)]
pub struct Recovery {
    indexes: HashMap<i64, IndexInfo>,
    ranges: HashMap<i64, RangeInfo>,
    runs: HashMap<i64, RunInfo>,
    range_id_max: i64,
    run_id_max: i64,
    signature: i64,
}

impl Recovery {
    /// Scan the journal for `signature` under `dir` and build the model.
    ///
    /// A missing journal file yields an empty model: on first boot the
    /// log does not exist yet and there is nothing to recover. Decode
    /// failures on committed records and replay precondition violations
    /// are fatal.
    pub async fn new(dir: impl Into<PathBuf>, signature: i64) -> Result<Self> {
        let dir = dir.into();
        tokio::task::spawn_blocking(move || Self::scan_sync(&dir, signature))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(format!("recovery task failed: {e}"))))?
    }

    pub(crate) fn scan_sync(dir: &Path, signature: i64) -> Result<Self> {
        let mut recovery = Self::empty(signature);
        if !xlog::log_path(dir, signature).exists() {
            tracing::debug!(signature, "no journal on disk, recovering empty model");
            return Ok(recovery);
        }
        let mut replayed = 0usize;
        for payload in XlogScanner::open(dir, signature)? {
            let record = Record::decode(&payload)?;
            recovery.apply(&record)?;
            replayed += 1;
        }
        tracing::debug!(
            signature,
            records = replayed,
            indexes = recovery.indexes.len(),
            ranges = recovery.ranges.len(),
            runs = recovery.runs.len(),
            "metadata log replayed"
        );
        Ok(recovery)
    }

    pub(crate) fn empty(signature: i64) -> Self {
        Self {
            indexes: HashMap::new(),
            ranges: HashMap::new(),
            runs: HashMap::new(),
            range_id_max: -1,
            run_id_max: -1,
            signature,
        }
    }

    /// Fold one record into the model, checking its preconditions.
    pub(crate) fn apply(&mut self, record: &Record) -> Result<()> {
        match record {
            Record::CreateIndex { index_id } => {
                if self.indexes.get(index_id).is_some_and(|i| !i.dropped) {
                    return Err(Error::Corrupt(format!(
                        "CREATE_INDEX for already live index {index_id}"
                    )));
                }
                self.indexes.insert(*index_id, IndexInfo::default());
            }
            Record::DropIndex { index_id } => {
                let Some(index) = self.indexes.get_mut(index_id) else {
                    return Err(Error::Corrupt(format!(
                        "DROP_INDEX for unknown index {index_id}"
                    )));
                };
                if index.dropped {
                    return Err(Error::Corrupt(format!(
                        "DROP_INDEX for already dropped index {index_id}"
                    )));
                }
                index.dropped = true;
                for range_id in std::mem::take(&mut index.ranges) {
                    if let Some(range) = self.ranges.remove(&range_id) {
                        for run_id in range.runs {
                            self.runs.remove(&run_id);
                        }
                    }
                }
            }
            Record::InsertRange {
                index_id,
                range_id,
                begin,
                end,
            } => {
                self.note_range_id(*range_id);
                if !self.indexes.get(index_id).is_some_and(|i| !i.dropped) {
                    return Err(Error::Corrupt(format!(
                        "INSERT_RANGE {range_id} into missing or dropped index {index_id}"
                    )));
                }
                if self.ranges.contains_key(range_id) {
                    return Err(Error::Corrupt(format!(
                        "INSERT_RANGE with duplicate range id {range_id}"
                    )));
                }
                self.ranges.insert(
                    *range_id,
                    RangeInfo {
                        index_id: *index_id,
                        begin: begin.clone(),
                        end: end.clone(),
                        runs: Vec::new(),
                    },
                );
                if let Some(index) = self.indexes.get_mut(index_id) {
                    index.ranges.push(*range_id);
                }
            }
            Record::DeleteRange { range_id } => {
                self.note_range_id(*range_id);
                let Some(range) = self.ranges.remove(range_id) else {
                    return Err(Error::Corrupt(format!(
                        "DELETE_RANGE for unknown range {range_id}"
                    )));
                };
                if let Some(index) = self.indexes.get_mut(&range.index_id) {
                    index.ranges.retain(|id| id != range_id);
                }
                // Outstanding runs go with the range.
                for run_id in range.runs {
                    self.runs.remove(&run_id);
                }
            }
            Record::InsertRun { range_id, run_id } => {
                self.note_range_id(*range_id);
                self.note_run_id(*run_id);
                if !self.ranges.contains_key(range_id) {
                    return Err(Error::Corrupt(format!(
                        "INSERT_RUN {run_id} into unknown range {range_id}"
                    )));
                }
                if self.runs.contains_key(run_id) {
                    return Err(Error::Corrupt(format!(
                        "INSERT_RUN with duplicate run id {run_id}"
                    )));
                }
                self.runs.insert(*run_id, RunInfo { range_id: *range_id });
                if let Some(range) = self.ranges.get_mut(range_id) {
                    range.runs.push(*run_id);
                }
            }
            Record::DeleteRun { run_id } => {
                self.note_run_id(*run_id);
                let Some(run) = self.runs.remove(run_id) else {
                    return Err(Error::Corrupt(format!(
                        "DELETE_RUN for unknown run {run_id}"
                    )));
                };
                if let Some(range) = self.ranges.get_mut(&run.range_id) {
                    range.runs.retain(|id| id != run_id);
                }
            }
        }
        Ok(())
    }

    fn note_range_id(&mut self, range_id: i64) {
        self.range_id_max = self.range_id_max.max(range_id);
    }

    fn note_run_id(&mut self, run_id: i64) {
        self.run_id_max = self.run_id_max.max(run_id);
    }

    /// True if `index_id` was dropped or never created in this journal.
    #[must_use]
    pub fn index_is_dropped(&self, index_id: i64) -> bool {
        self.indexes.get(&index_id).is_none_or(|i| i.dropped)
    }

    /// Replay the structure of one live index into `cb`.
    ///
    /// The callback sees CREATE_INDEX first, then for each live range (in
    /// journal order) INSERT_RANGE followed immediately by that range's
    /// INSERT_RUN records, also in journal order. A callback error aborts
    /// iteration and is returned as-is.
    ///
    /// A tombstoned index produces no callbacks; an index the journal has
    /// never seen is reported as corruption.
    pub fn load_index<F>(&self, index_id: i64, mut cb: F) -> Result<()>
    where
        F: FnMut(&Record) -> Result<()>,
    {
        let Some(index) = self.indexes.get(&index_id) else {
            return Err(Error::Corrupt(format!(
                "load of index {index_id} unknown to the metadata log"
            )));
        };
        if index.dropped {
            return Ok(());
        }
        cb(&Record::CreateIndex { index_id })?;
        for &range_id in &index.ranges {
            let range = self.ranges.get(&range_id).ok_or_else(|| {
                Error::Corrupt(format!("index {index_id} references unknown range {range_id}"))
            })?;
            cb(&Record::InsertRange {
                index_id,
                range_id,
                begin: range.begin.clone(),
                end: range.end.clone(),
            })?;
            for &run_id in &range.runs {
                cb(&Record::InsertRun { range_id, run_id })?;
            }
        }
        Ok(())
    }

    /// Ids of all non-dropped indexes, ascending.
    #[must_use]
    pub fn live_index_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .indexes
            .iter()
            .filter(|(_, info)| !info.dropped)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Signature of the journal this model was recovered from.
    #[must_use]
    pub fn signature(&self) -> i64 {
        self.signature
    }

    /// Largest range id the journal has ever mentioned, or -1.
    #[must_use]
    pub fn range_id_max(&self) -> i64 {
        self.range_id_max
    }

    /// Largest run id the journal has ever mentioned, or -1.
    #[must_use]
    pub fn run_id_max(&self) -> i64 {
        self.run_id_max
    }

    /// Look up an index by id, tombstones included.
    #[must_use]
    pub fn index(&self, index_id: i64) -> Option<&IndexInfo> {
        self.indexes.get(&index_id)
    }

    /// Look up a live range by id.
    #[must_use]
    pub fn range(&self, range_id: i64) -> Option<&RangeInfo> {
        self.ranges.get(&range_id)
    }

    /// Look up a live run by id.
    #[must_use]
    pub fn run(&self, run_id: i64) -> Option<&RunInfo> {
        self.runs.get(&run_id)
    }
}
