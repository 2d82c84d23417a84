//! End-to-end scenarios across the writer, recovery, and rotation.

use basalt_metalog::{MetaLog, MetaLogConfig, Record, Recovery};

fn open_log(dir: &std::path::Path) -> MetaLog {
    MetaLog::new(MetaLogConfig::new(dir).with_gc_on_rotate(false))
}

#[tokio::test]
async fn create_insert_range_insert_run_then_recover() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path());
    log.open(10).await.unwrap();

    log.tx_begin();
    log.create_index(100);
    log.insert_range(100, 1, Some(b"a"), Some(b"z"));
    log.insert_run(1, 10);
    log.tx_commit().await.unwrap();

    let recovery = Recovery::new(tmp.path(), 10).await.unwrap();
    assert!(!recovery.index_is_dropped(100));
    assert_eq!(recovery.index(100).unwrap().ranges(), &[1]);

    let range = recovery.range(1).unwrap();
    assert_eq!(range.index_id(), 100);
    assert_eq!(range.begin(), Some(&b"a"[..]));
    assert_eq!(range.end(), Some(&b"z"[..]));
    assert_eq!(range.runs(), &[10]);
    assert_eq!(recovery.run(10).unwrap().range_id(), 1);

    assert_eq!(recovery.range_id_max(), 1);
    assert_eq!(recovery.run_id_max(), 10);
}

#[tokio::test]
async fn drop_cascades_to_ranges_and_runs() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path());
    log.open(10).await.unwrap();

    log.tx_begin();
    log.create_index(100);
    log.insert_range(100, 1, Some(b"a"), Some(b"z"));
    log.insert_run(1, 10);
    log.tx_commit().await.unwrap();

    log.tx_begin();
    log.drop_index(100);
    log.tx_commit().await.unwrap();

    let recovery = Recovery::new(tmp.path(), 10).await.unwrap();
    assert!(recovery.index_is_dropped(100));
    assert!(recovery.index(100).is_some(), "tombstone persists until rotation");
    assert!(recovery.range(1).is_none());
    assert!(recovery.run(10).is_none());
}

#[tokio::test]
async fn rotation_compacts_away_dropped_indexes() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path());
    log.open(10).await.unwrap();

    log.tx_begin();
    log.create_index(100);
    log.insert_range(100, 1, Some(b"a"), Some(b"z"));
    log.insert_run(1, 10);
    log.tx_commit().await.unwrap();

    log.tx_begin();
    log.drop_index(100);
    log.tx_commit().await.unwrap();

    log.tx_begin();
    log.create_index(200);
    log.insert_range(200, 2, Some(b""), Some(b""));
    log.tx_commit().await.unwrap();

    log.rotate(11).await.unwrap();

    let recovery = Recovery::new(tmp.path(), 11).await.unwrap();
    // Index 100 is gone entirely: not even a tombstone.
    assert!(recovery.index(100).is_none());
    assert!(recovery.index_is_dropped(100));

    assert_eq!(recovery.live_index_ids(), vec![200]);
    let range = recovery.range(2).unwrap();
    assert_eq!(range.begin(), Some(&b""[..]));
    assert_eq!(range.end(), Some(&b""[..]));
    assert!(range.runs().is_empty());
}

#[tokio::test]
async fn failed_commit_is_atomic_and_discards() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path());
    log.open(10).await.unwrap();

    log.tx_begin();
    log.create_index(1);
    log.insert_range(1, 1, Some(b"a"), Some(b"b"));
    log.inject_commit_failures(1);
    assert!(log.tx_commit().await.is_err());

    // Neither record reached the journal.
    let recovery = Recovery::new(tmp.path(), 10).await.unwrap();
    assert!(recovery.index_is_dropped(1));
    assert!(recovery.range(1).is_none());

    // The buffer was emptied: the next transaction carries only itself.
    log.tx_begin();
    log.create_index(2);
    log.tx_commit().await.unwrap();
    let recovery = Recovery::new(tmp.path(), 10).await.unwrap();
    assert_eq!(recovery.live_index_ids(), vec![2]);
}

#[tokio::test]
async fn failed_try_commit_is_atomic_and_retains() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path());
    log.open(10).await.unwrap();

    log.tx_begin();
    log.create_index(1);
    log.insert_range(1, 1, Some(b"a"), Some(b"b"));
    log.inject_commit_failures(1);
    assert!(log.tx_try_commit().await.is_err());

    let recovery = Recovery::new(tmp.path(), 10).await.unwrap();
    assert!(recovery.index_is_dropped(1));

    // The records were retained and flush with the next transaction.
    log.tx_begin();
    log.insert_run(1, 7);
    log.tx_commit().await.unwrap();

    let recovery = Recovery::new(tmp.path(), 10).await.unwrap();
    assert_eq!(recovery.live_index_ids(), vec![1]);
    assert_eq!(recovery.range(1).unwrap().runs(), &[7]);
}

#[tokio::test]
async fn load_index_interleaves_runs_with_their_range() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path());
    log.open(10).await.unwrap();

    log.tx_begin();
    log.create_index(5);
    log.insert_range(5, 1, None, None);
    log.insert_range(5, 2, None, None);
    log.insert_run(1, 10);
    log.insert_run(2, 20);
    log.insert_run(1, 11);
    log.tx_commit().await.unwrap();

    let recovery = Recovery::new(tmp.path(), 10).await.unwrap();
    let mut seen = Vec::new();
    recovery
        .load_index(5, |record| {
            seen.push(record.clone());
            Ok(())
        })
        .unwrap();

    assert_eq!(
        seen,
        vec![
            Record::CreateIndex { index_id: 5 },
            Record::InsertRange {
                index_id: 5,
                range_id: 1,
                begin: None,
                end: None,
            },
            Record::InsertRun { range_id: 1, run_id: 10 },
            Record::InsertRun { range_id: 1, run_id: 11 },
            Record::InsertRange {
                index_id: 5,
                range_id: 2,
                begin: None,
                end: None,
            },
            Record::InsertRun { range_id: 2, run_id: 20 },
        ]
    );
}

#[tokio::test]
async fn capacity_boundary_is_exact() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path());
    log.open(10).await.unwrap();

    log.tx_begin();
    for i in 0..64 {
        log.create_index(i);
    }
    log.tx_commit().await.unwrap();

    log.tx_begin();
    for i in 0..65 {
        log.create_index(1000 + i);
    }
    let err = log.tx_commit().await.unwrap_err();
    assert!(matches!(err, basalt_metalog::Error::TxFull));

    let recovery = Recovery::new(tmp.path(), 10).await.unwrap();
    let live = recovery.live_index_ids();
    assert_eq!(live.len(), 64);
    assert_eq!(live, (0..64).collect::<Vec<i64>>());
}

#[tokio::test]
async fn rotation_preserves_live_state() {
    let tmp = tempfile::tempdir().unwrap();
    let log = open_log(tmp.path());
    log.open(1).await.unwrap();

    log.tx_begin();
    log.create_index(10);
    log.insert_range(10, 1, Some(b"a"), Some(b"m"));
    log.insert_range(10, 2, Some(b"m"), None);
    log.insert_run(1, 100);
    log.insert_run(2, 101);
    log.insert_run(1, 102);
    log.create_index(20);
    log.delete_run(101);
    log.tx_commit().await.unwrap();

    let before = Recovery::new(tmp.path(), 1).await.unwrap();
    log.rotate(2).await.unwrap();
    let after = Recovery::new(tmp.path(), 2).await.unwrap();

    assert_eq!(before.live_index_ids(), after.live_index_ids());
    for index_id in before.live_index_ids() {
        let mut expected = Vec::new();
        before
            .load_index(index_id, |r| {
                expected.push(r.clone());
                Ok(())
            })
            .unwrap();
        let mut actual = Vec::new();
        after
            .load_index(index_id, |r| {
                actual.push(r.clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(expected, actual, "index {index_id} changed across rotation");
    }
}
