//! The metadata log writer: transactional, buffered, latch-protected
//! append of structural records.
//!
//! [`MetaLog`] is a cheaply cloneable handle over shared state, wired
//! once at engine init. Mutators stage records with [`tx_begin`] /
//! [`write`] (pure in-memory, no suspension) and make them durable with
//! [`tx_commit`] / [`tx_try_commit`], which write the whole batch as one
//! atomic journal transaction and fsync before returning.
//!
//! Callers serialize their own transactions: one logical writer stages a
//! batch at a time. The internal latch only serializes the journal write
//! itself against rotation, and is the sole lock held across I/O.
//!
//! [`tx_begin`]: MetaLog::tx_begin
//! [`write`]: MetaLog::write
//! [`tx_commit`]: MetaLog::tx_commit
//! [`tx_try_commit`]: MetaLog::tx_try_commit

#[cfg(debug_assertions)]
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::sync::Mutex as AsyncMutex;

use crate::config::MetaLogConfig;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::xlog::XlogWriter;

/// Max records a single transaction may hold.
///
/// The cap bounds the size of one journal transaction; the buffer is a
/// fixed array, not a growable sequence.
pub const TX_BUF_CAPACITY: usize = 64;

/// Shared writer for the metadata log of one storage engine instance.
///
/// Clones share the same journal, buffer, and id counters.
#[derive(Clone)]
pub struct MetaLog {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) config: MetaLogConfig,
    /// Latch guarding the journal handle. Held across the journal write
    /// inside commit and across the whole of rotation; FIFO waiters.
    pub(crate) latch: AsyncMutex<LogState>,
    /// Transaction buffer and id counters. Never held across I/O.
    tx: StdMutex<TxState>,
    #[cfg(debug_assertions)]
    errinj_commit: std::sync::atomic::AtomicU32,
}

pub(crate) struct LogState {
    pub(crate) xlog: Option<XlogWriter>,
    pub(crate) signature: i64,
}

struct TxState {
    buf: Box<[Option<Record>; TX_BUF_CAPACITY]>,
    /// First record of the current transaction.
    tx_begin: usize,
    /// One past the last staged record.
    tx_end: usize,
    in_tx: bool,
    /// Set when a record was dropped on overflow; the commit then fails.
    poisoned: bool,
    next_range_id: i64,
    next_run_id: i64,
}

impl TxState {
    fn new() -> Self {
        Self {
            buf: Box::new(std::array::from_fn(|_| None)),
            tx_begin: 0,
            tx_end: 0,
            in_tx: false,
            poisoned: false,
            next_range_id: 0,
            next_run_id: 0,
        }
    }

    /// Encode every staged record, retained leftovers included.
    fn encode_all(&self) -> Result<Vec<Vec<u8>>> {
        let mut payloads = Vec::with_capacity(self.tx_end);
        for record in self.buf[..self.tx_end].iter().flatten() {
            let mut buf = Vec::new();
            record.encode(&mut buf)?;
            payloads.push(buf);
        }
        Ok(payloads)
    }

    /// Drop the current transaction's records, keeping retained ones.
    fn discard_current(&mut self) {
        for slot in &mut self.buf[self.tx_begin..self.tx_end] {
            *slot = None;
        }
        self.tx_end = self.tx_begin;
    }

    fn clear(&mut self) {
        for slot in &mut self.buf[..self.tx_end] {
            *slot = None;
        }
        self.tx_begin = 0;
        self.tx_end = 0;
        self.poisoned = false;
    }
}

/// How a failed commit treats the staged records.
#[derive(Clone, Copy, PartialEq, Eq)]
enum CommitMode {
    /// Drop the current transaction's records.
    Discard,
    /// Keep everything buffered so the next commit retries the flush.
    Retain,
}

impl MetaLog {
    /// Create a writer that is not yet bound to a journal file.
    ///
    /// Records may be staged and committed right away; they stay in the
    /// buffer and are flushed as the first journal transaction by
    /// [`open`](Self::open). This supports bootstrap code that emits
    /// records before the journal directory is ready.
    #[must_use]
    pub fn new(config: MetaLogConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                latch: AsyncMutex::new(LogState {
                    xlog: None,
                    signature: 0,
                }),
                tx: StdMutex::new(TxState::new()),
                #[cfg(debug_assertions)]
                errinj_commit: std::sync::atomic::AtomicU32::new(0),
            }),
        }
    }

    /// Open the journal for `signature` for appending, creating it if
    /// absent, then flush any records buffered before `open` as a single
    /// transaction.
    ///
    /// If the bootstrap flush fails, the journal is closed again, the
    /// records stay buffered, and the error is returned.
    ///
    /// # Panics
    ///
    /// Panics if the log is already open.
    pub async fn open(&self, signature: i64) -> Result<()> {
        let mut log = self.shared.latch.lock().await;
        assert!(log.xlog.is_none(), "metadata log opened twice");

        let dir = self.shared.config.dir.clone();
        let mut xlog = tokio::task::spawn_blocking(move || XlogWriter::open(&dir, signature))
            .await
            .map_err(join_error)??;

        let payloads = self.tx().encode_all()?;
        if !payloads.is_empty() {
            let buffered = payloads.len();
            match write_batch(xlog, payloads).await {
                (Some(flushed), Ok(())) => {
                    xlog = flushed;
                    self.tx().clear();
                    tracing::info!(signature, records = buffered, "bootstrap records flushed");
                }
                (_, res) => {
                    // Close the file; the caller may retry the open.
                    tracing::warn!(signature, "bootstrap flush failed, journal stays closed");
                    res?;
                    return Err(Error::Closed);
                }
            }
        }

        log.signature = signature;
        log.xlog = Some(xlog);
        tracing::info!(signature, dir = %self.shared.config.dir.display(), "metadata log opened");
        Ok(())
    }

    /// Close the journal and clear the buffer.
    pub async fn close(&self) {
        let mut log = self.shared.latch.lock().await;
        log.xlog = None;
        let mut tx = self.tx();
        tx.clear();
        tx.in_tx = false;
    }

    /// Signature of the journal commits currently land in.
    pub async fn signature(&self) -> i64 {
        self.shared.latch.lock().await.signature
    }

    /// Configuration this writer was built with.
    #[must_use]
    pub fn config(&self) -> &MetaLogConfig {
        &self.shared.config
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Start a transaction.
    ///
    /// Records retained by a failed [`tx_try_commit`](Self::tx_try_commit)
    /// (or buffered before open) stay ahead of the new transaction and are
    /// flushed together with it.
    ///
    /// # Panics
    ///
    /// Panics if a transaction is already active and the buffer is not
    /// empty.
    pub fn tx_begin(&self) {
        let mut tx = self.tx();
        assert!(
            !tx.in_tx || tx.tx_end == 0,
            "metadata log transaction already active"
        );
        tx.in_tx = true;
        tx.tx_begin = tx.tx_end;
    }

    /// Stage one record into the current transaction.
    ///
    /// The record is copied into the fixed buffer. Past the 64-record cap
    /// the record is dropped and the transaction is poisoned; the commit
    /// will fail with [`Error::TxFull`].
    pub fn write(&self, record: Record) {
        let mut tx = self.tx();
        if tx.poisoned {
            return;
        }
        if tx.tx_end == TX_BUF_CAPACITY {
            tracing::warn!(
                record = %record,
                "transaction buffer overflow, poisoning transaction"
            );
            tx.poisoned = true;
            return;
        }
        let at = tx.tx_end;
        tx.buf[at] = Some(record);
        tx.tx_end += 1;
    }

    /// Commit the current transaction: flush the buffer as one journal
    /// transaction and fsync.
    ///
    /// On any error the transaction's records are discarded and the error
    /// is returned; the caller decides whether to re-issue the logical
    /// operation or escalate. Retained records from earlier failed
    /// [`tx_try_commit`](Self::tx_try_commit) calls are kept either way.
    pub async fn tx_commit(&self) -> Result<()> {
        self.commit_impl(CommitMode::Discard).await
    }

    /// Like [`tx_commit`](Self::tx_commit), but on error all records stay
    /// buffered, to be flushed by the next commit.
    pub async fn tx_try_commit(&self) -> Result<()> {
        self.commit_impl(CommitMode::Retain).await
    }

    async fn commit_impl(&self, mode: CommitMode) -> Result<()> {
        // Stage under the buffer lock, never across I/O.
        let payloads = {
            let mut tx = self.tx();
            if tx.poisoned {
                // The batch is incomplete, retrying it would persist a
                // partial transaction. Both commit flavors drop it.
                tx.discard_current();
                tx.poisoned = false;
                tx.in_tx = false;
                return Err(Error::TxFull);
            }
            if tx.tx_end == 0 {
                tx.in_tx = false;
                tx.tx_begin = 0;
                return Ok(());
            }
            match tx.encode_all() {
                Ok(payloads) => payloads,
                Err(err) => {
                    if mode == CommitMode::Discard {
                        tx.discard_current();
                    }
                    tx.in_tx = false;
                    return Err(err);
                }
            }
        };
        let records = payloads.len();

        let write_res = {
            let mut log = self.shared.latch.lock().await;
            match log.xlog.take() {
                None => {
                    // Not open yet: the records stay buffered and become
                    // the first transaction flushed by open().
                    drop(log);
                    let mut tx = self.tx();
                    tx.in_tx = false;
                    tracing::debug!(records, "journal not open, transaction buffered");
                    return Ok(());
                }
                Some(xlog) => {
                    if self.take_injected_failure() {
                        log.xlog = Some(xlog);
                        Err(Error::Io(std::io::Error::other(
                            "injected journal write failure",
                        )))
                    } else {
                        let (xlog, res) = write_batch(xlog, payloads).await;
                        log.xlog = xlog;
                        res
                    }
                }
            }
        };

        let mut tx = self.tx();
        tx.in_tx = false;
        match write_res {
            Ok(()) => {
                tx.clear();
                tracing::debug!(records, "metadata transaction committed");
                Ok(())
            }
            Err(err) => {
                match mode {
                    CommitMode::Discard => {
                        tracing::warn!(records, error = %err, "commit failed, discarding transaction");
                        tx.discard_current();
                    }
                    CommitMode::Retain => {
                        tracing::warn!(records, error = %err, "commit failed, records retained for retry");
                    }
                }
                Err(err)
            }
        }
    }

    // =========================================================================
    // Typed record helpers
    // =========================================================================

    /// Log an index creation. `index_id` is the creation LSN.
    pub fn create_index(&self, index_id: i64) {
        self.write(Record::CreateIndex { index_id });
    }

    /// Log an index drop.
    pub fn drop_index(&self, index_id: i64) {
        self.write(Record::DropIndex { index_id });
    }

    /// Log a range insertion. Boundary keys are copied; `None` stands for
    /// the unbounded end of the key space.
    pub fn insert_range(
        &self,
        index_id: i64,
        range_id: i64,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) {
        self.write(Record::InsertRange {
            index_id,
            range_id,
            begin: begin.map(<[u8]>::to_vec),
            end: end.map(<[u8]>::to_vec),
        });
    }

    /// Log a range deletion. Recovery cascades to the range's runs.
    pub fn delete_range(&self, range_id: i64) {
        self.write(Record::DeleteRange { range_id });
    }

    /// Log a run insertion.
    pub fn insert_run(&self, range_id: i64, run_id: i64) {
        self.write(Record::InsertRun { range_id, run_id });
    }

    /// Log a run deletion.
    pub fn delete_run(&self, run_id: i64) {
        self.write(Record::DeleteRun { run_id });
    }

    // =========================================================================
    // Id allocation
    // =========================================================================

    /// Allocate a range id. Ids are monotonic and never reissued, even if
    /// the record they were minted for is never persisted.
    pub fn next_range_id(&self) -> i64 {
        let mut tx = self.tx();
        let id = tx.next_range_id;
        tx.next_range_id += 1;
        id
    }

    /// Allocate a run id. Same monotonicity contract as range ids.
    pub fn next_run_id(&self) -> i64 {
        let mut tx = self.tx();
        let id = tx.next_run_id;
        tx.next_run_id += 1;
        id
    }

    /// Re-seed the id allocators from a recovered model so ids minted
    /// after restart never alias ids the journal has already seen.
    pub fn restore_ids(&self, range_id_max: i64, run_id_max: i64) {
        let mut tx = self.tx();
        tx.next_range_id = range_id_max.max(0) + 1;
        tx.next_run_id = run_id_max.max(0) + 1;
    }

    // =========================================================================
    // Internals
    // =========================================================================

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    fn tx(&self) -> MutexGuard<'_, TxState> {
        self.shared.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm `count` injected commit failures. Debug builds only; the
    /// counter does not exist in release builds.
    #[cfg(debug_assertions)]
    pub fn inject_commit_failures(&self, count: u32) {
        self.shared.errinj_commit.store(count, Ordering::SeqCst);
    }

    #[cfg(debug_assertions)]
    fn take_injected_failure(&self) -> bool {
        self.shared
            .errinj_commit
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[cfg(not(debug_assertions))]
    fn take_injected_failure(&self) -> bool {
        false
    }
}

/// Append `payloads` as one journal transaction on a blocking thread,
/// handing the journal handle back afterwards.
///
/// Runs detached from the caller: cancelling the awaiting task cannot
/// tear the batch, it either commits wholly or is trimmed by the next
/// scan. A lost handle (worker panic) leaves the log closed.
async fn write_batch(
    mut xlog: XlogWriter,
    payloads: Vec<Vec<u8>>,
) -> (Option<XlogWriter>, Result<()>) {
    let outcome = tokio::task::spawn_blocking(move || {
        let res = append_tx_sync(&mut xlog, &payloads);
        (xlog, res)
    })
    .await;
    match outcome {
        Ok((xlog, res)) => (Some(xlog), res),
        Err(err) => (None, Err(join_error(err))),
    }
}

fn append_tx_sync(xlog: &mut XlogWriter, payloads: &[Vec<u8>]) -> Result<()> {
    for payload in payloads {
        xlog.append(payload)?;
    }
    xlog.commit()
}

fn join_error(err: tokio::task::JoinError) -> Error {
    Error::Io(std::io::Error::other(format!("journal task failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::Recovery;

    fn test_log(dir: &std::path::Path) -> MetaLog {
        MetaLog::new(MetaLogConfig::new(dir))
    }

    #[tokio::test]
    async fn commit_is_durable() {
        let tmp = tempfile::tempdir().unwrap();
        let log = test_log(tmp.path());
        log.open(1).await.unwrap();

        log.tx_begin();
        log.create_index(100);
        log.insert_range(100, 1, Some(b"a"), Some(b"z"));
        log.tx_commit().await.unwrap();

        let recovery = Recovery::new(tmp.path(), 1).await.unwrap();
        assert!(!recovery.index_is_dropped(100));
        assert_eq!(recovery.index(100).unwrap().ranges(), &[1]);
    }

    #[tokio::test]
    async fn empty_commit_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let log = test_log(tmp.path());
        log.open(1).await.unwrap();
        log.tx_begin();
        log.tx_commit().await.unwrap();
        let recovery = Recovery::new(tmp.path(), 1).await.unwrap();
        assert!(recovery.live_index_ids().is_empty());
    }

    #[tokio::test]
    async fn capacity_boundary() {
        let tmp = tempfile::tempdir().unwrap();
        let log = test_log(tmp.path());
        log.open(1).await.unwrap();

        // Exactly 64 records commit fine.
        log.tx_begin();
        for i in 0..TX_BUF_CAPACITY as i64 {
            log.create_index(i);
        }
        log.tx_commit().await.unwrap();

        // The 65th write poisons; the commit fails and discards.
        log.tx_begin();
        for i in 0..=TX_BUF_CAPACITY as i64 {
            log.create_index(100 + i);
        }
        let err = log.tx_commit().await.unwrap_err();
        assert!(matches!(err, Error::TxFull));

        let recovery = Recovery::new(tmp.path(), 1).await.unwrap();
        assert_eq!(recovery.live_index_ids().len(), TX_BUF_CAPACITY);
        // A fresh transaction works again after the poisoned one.
        log.tx_begin();
        log.create_index(500);
        log.tx_commit().await.unwrap();
        let recovery = Recovery::new(tmp.path(), 1).await.unwrap();
        assert!(!recovery.index_is_dropped(500));
    }

    #[tokio::test]
    async fn commit_failure_discards_current_transaction() {
        let tmp = tempfile::tempdir().unwrap();
        let log = test_log(tmp.path());
        log.open(1).await.unwrap();

        log.tx_begin();
        log.create_index(1);
        log.insert_range(1, 1, Some(b"a"), Some(b"b"));
        log.inject_commit_failures(1);
        assert!(log.tx_commit().await.is_err());

        // Nothing reached the journal and the buffer is empty again.
        let recovery = Recovery::new(tmp.path(), 1).await.unwrap();
        assert!(recovery.live_index_ids().is_empty());
        log.tx_begin();
        log.create_index(2);
        log.tx_commit().await.unwrap();
        let recovery = Recovery::new(tmp.path(), 1).await.unwrap();
        assert_eq!(recovery.live_index_ids(), vec![2]);
    }

    #[tokio::test]
    async fn try_commit_retains_and_retries_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let log = test_log(tmp.path());
        log.open(1).await.unwrap();

        log.tx_begin();
        log.create_index(1);
        log.inject_commit_failures(3);
        for _ in 0..3 {
            assert!(log.tx_try_commit().await.is_err());
            // Replay-and-extend: the retained record stays ahead.
            log.tx_begin();
        }
        log.create_index(2);
        log.tx_commit().await.unwrap();

        let recovery = Recovery::new(tmp.path(), 1).await.unwrap();
        assert_eq!(recovery.live_index_ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn pre_open_records_flush_at_open() {
        let tmp = tempfile::tempdir().unwrap();
        let log = test_log(tmp.path());

        // Bootstrap: commit before open buffers instead of failing.
        log.tx_begin();
        log.create_index(7);
        log.tx_commit().await.unwrap();

        log.open(3).await.unwrap();
        let recovery = Recovery::new(tmp.path(), 3).await.unwrap();
        assert!(!recovery.index_is_dropped(7));
    }

    #[tokio::test]
    async fn reopen_continues_existing_journal() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let log = test_log(tmp.path());
            log.open(1).await.unwrap();
            log.tx_begin();
            log.create_index(1);
            log.tx_commit().await.unwrap();
            log.close().await;
        }
        {
            let log = test_log(tmp.path());
            log.open(1).await.unwrap();
            log.tx_begin();
            log.create_index(2);
            log.tx_commit().await.unwrap();
        }
        let recovery = Recovery::new(tmp.path(), 1).await.unwrap();
        assert_eq!(recovery.live_index_ids(), vec![1, 2]);
    }

    #[tokio::test]
    async fn id_allocation_is_monotonic() {
        let tmp = tempfile::tempdir().unwrap();
        let log = test_log(tmp.path());
        assert_eq!(log.next_range_id(), 0);
        assert_eq!(log.next_range_id(), 1);
        assert_eq!(log.next_run_id(), 0);

        log.restore_ids(41, 17);
        assert_eq!(log.next_range_id(), 42);
        assert_eq!(log.next_run_id(), 18);

        // An empty model seeds the counters at 1.
        log.restore_ids(-1, -1);
        assert_eq!(log.next_range_id(), 1);
        assert_eq!(log.next_run_id(), 1);
    }

    #[test]
    #[should_panic(expected = "transaction already active")]
    fn nested_tx_begin_panics() {
        let tmp = tempfile::tempdir().unwrap();
        let log = test_log(tmp.path());
        log.tx_begin();
        log.create_index(1);
        log.tx_begin();
    }

    #[tokio::test]
    async fn clones_share_state() {
        let tmp = tempfile::tempdir().unwrap();
        let log = test_log(tmp.path());
        log.open(1).await.unwrap();

        let clone = log.clone();
        clone.tx_begin();
        clone.create_index(9);
        log.tx_commit().await.unwrap();

        let recovery = Recovery::new(tmp.path(), 1).await.unwrap();
        assert!(!recovery.index_is_dropped(9));
        assert_eq!(log.signature().await, 1);
    }
}
