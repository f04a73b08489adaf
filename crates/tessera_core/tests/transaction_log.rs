//! Transaction log behaviour observed through a recording applier.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tessera_core::{Config, DataId, RetryConfig, TransactionLog, TransactionSupport};
use tessera_storage::InMemoryBackend;
use tessera_testkit::{init_tracing, Applied, CrashSwitch, CrashableBackend, RecordingApplier};

const CHUNK: usize = 8;

fn config() -> Config {
    Config::default().chunk_size(CHUNK)
}

fn open(memory: &InMemoryBackend, recorder: &Arc<RecordingApplier>) -> TransactionLog {
    TransactionLog::open(Box::new(memory.share()), recorder.clone(), &config()).unwrap()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

#[test]
fn rollback_of_multi_chunk_value_never_stores() {
    init_tracing();
    let memory = InMemoryBackend::new();
    let recorder = Arc::new(RecordingApplier::new());
    let log = open(&memory, &recorder);

    let value = vec![7u8; CHUNK * 5 + 3];
    let txid = log.start_transaction().unwrap();
    log.store(txid, "user", DataId::new(1), &mut value.as_slice())
        .unwrap();
    log.delete(txid, "user", DataId::new(2)).unwrap();
    assert!(log.wal_size().unwrap() > value.len() as u64);

    log.rollback(txid).unwrap();

    assert!(recorder.calls().is_empty());
    assert_eq!(log.open_transactions(), 0);
    assert_eq!(log.wal_size().unwrap(), 0);
}

#[test]
fn interleaved_transactions_apply_their_own_effects_once() {
    let memory = InMemoryBackend::new();
    let recorder = Arc::new(RecordingApplier::new());
    let log = open(&memory, &recorder);

    let long_a = vec![0xAA; CHUNK * 3];
    let long_b = vec![0xBB; CHUNK * 2 + 1];

    let first = log.start_transaction().unwrap();
    let second = log.start_transaction().unwrap();
    log.store(first, "user", DataId::new(1), &mut &b"a1"[..]).unwrap();
    log.store(second, "user", DataId::new(2), &mut long_b.as_slice()).unwrap();
    log.store(first, "user", DataId::new(3), &mut long_a.as_slice()).unwrap();
    log.store(second, "user", DataId::new(4), &mut &b"b2"[..]).unwrap();

    log.commit(second).unwrap();
    log.commit(first).unwrap();

    assert_eq!(
        recorder.stores(),
        vec![
            (second, DataId::new(2), long_b),
            (second, DataId::new(4), b"b2".to_vec()),
            (first, DataId::new(1), b"a1".to_vec()),
            (first, DataId::new(3), long_a),
        ]
    );
    assert_eq!(log.wal_size().unwrap(), 0);
}

#[test]
fn committed_transaction_still_in_the_log_is_replayed_on_open() {
    let memory = InMemoryBackend::new();
    let first = Arc::new(RecordingApplier::new());
    let (open_tx, committed_tx) = {
        let log = open(&memory, &first);
        let open_tx = log.start_transaction().unwrap();
        log.store(open_tx, "user", DataId::new(9), &mut &b"pending"[..]).unwrap();

        let committed_tx = log.start_transaction().unwrap();
        log.store(committed_tx, "user", DataId::new(1), &mut &b"kept"[..]).unwrap();
        log.commit(committed_tx).unwrap();
        // crash: the open transaction keeps the log from being cleared
        (open_tx, committed_tx)
    };
    assert_eq!(first.store_count(), 1);

    let replayed = Arc::new(RecordingApplier::new());
    let log = open(&memory, &replayed);

    assert_eq!(
        replayed.stores(),
        vec![(committed_tx, DataId::new(1), b"kept".to_vec())]
    );
    assert_eq!(log.open_transactions(), 1);

    // the re-registered transaction can still finish normally
    log.rollback(open_tx).unwrap();
    assert_eq!(replayed.store_count(), 1);
    assert_eq!(log.wal_size().unwrap(), 0);

    let next = log.start_transaction().unwrap();
    assert!(next > committed_tx);
}

#[test]
fn torn_commit_is_discarded_on_open() {
    init_tracing();
    let memory = InMemoryBackend::new();
    let switch = CrashSwitch::new();
    let recorder = Arc::new(RecordingApplier::new());

    let size_before_commit = {
        let backend = CrashableBackend::new(Box::new(memory.share()), switch.clone());
        let log = TransactionLog::open(Box::new(backend), recorder.clone(), &config()).unwrap();
        let txid = log.start_transaction().unwrap();
        log.store(txid, "user", DataId::new(1), &mut &b"value"[..]).unwrap();
        let size = log.wal_size().unwrap();

        switch.crash_after(3);
        assert!(log.commit(txid).is_err());
        size
    };
    assert!(switch.has_crashed());
    assert_eq!(memory.data().len() as u64, size_before_commit + 3);

    let reopened = Arc::new(RecordingApplier::new());
    let log = open(&memory, &reopened);

    assert_eq!(reopened.store_count(), 0);
    assert_eq!(log.open_transactions(), 1);
    assert_eq!(log.wal_size().unwrap(), size_before_commit);
}

#[test]
fn failed_apply_is_reported_to_the_applier() {
    let memory = InMemoryBackend::new();
    let recorder = Arc::new(RecordingApplier::new());
    recorder.fail_store_of(DataId::new(2));
    let log = open(&memory, &recorder);

    let txid = log.start_transaction().unwrap();
    log.store(txid, "user", DataId::new(1), &mut &b"ok"[..]).unwrap();
    log.store(txid, "user", DataId::new(2), &mut &b"refused"[..]).unwrap();
    assert!(log.commit(txid).is_err());

    let calls = recorder.calls();
    assert!(matches!(calls.last(), Some(Applied::Complete(id, Some(_))) if *id == txid));
    assert_eq!(recorder.store_count(), 1);
}

#[test]
fn failed_apply_keeps_the_log_for_replay() {
    let memory = InMemoryBackend::new();
    let refusing = Arc::new(RecordingApplier::new());
    refusing.fail_store_of(DataId::new(1));
    {
        let log = open(&memory, &refusing);
        let txid = log.start_transaction().unwrap();
        log.store(txid, "user", DataId::new(1), &mut &b"first"[..]).unwrap();
        log.store(txid, "user", DataId::new(2), &mut &b"second"[..]).unwrap();
        assert!(log.commit(txid).is_err());

        // later effects of the same transaction still ran
        assert_eq!(refusing.stores().len(), 1);
        assert_eq!(refusing.persist_count(), 0);
        assert!(log.wal_size().unwrap() > 0);

        // the log stays put even once later transactions finish
        let next = log.start_transaction().unwrap();
        log.commit(next).unwrap();
        assert!(log.wal_size().unwrap() > 0);
    }

    let replayed = Arc::new(RecordingApplier::new());
    let log = open(&memory, &replayed);
    let ids: Vec<DataId> = replayed.stores().into_iter().map(|(_, id, _)| id).collect();
    assert_eq!(ids, vec![DataId::new(1), DataId::new(2)]);
    assert_eq!(replayed.persist_count(), 1);
    assert_eq!(log.wal_size().unwrap(), 0);
}

#[test]
fn applied_effects_are_persisted_before_the_log_is_cleared() {
    let memory = InMemoryBackend::new();
    let recorder = Arc::new(RecordingApplier::new());
    let log = open(&memory, &recorder);

    let first = log.start_transaction().unwrap();
    let second = log.start_transaction().unwrap();
    log.store(first, "user", DataId::new(1), &mut &b"a"[..]).unwrap();
    log.commit(first).unwrap();
    // another transaction is still open: nothing to persist yet
    assert_eq!(recorder.persist_count(), 0);

    log.rollback(second).unwrap();
    assert_eq!(recorder.persist_count(), 1);
    assert_eq!(log.wal_size().unwrap(), 0);
}

#[test]
fn stale_transactions_are_swept() {
    let memory = InMemoryBackend::new();
    let recorder = Arc::new(RecordingApplier::new());
    let config = config().stale_transaction_timeout(Duration::from_secs(60));
    let log = TransactionLog::open(Box::new(memory.share()), recorder.clone(), &config).unwrap();

    let abandoned = log.start_transaction().unwrap();
    log.store(abandoned, "user", DataId::new(1), &mut &b"lost"[..]).unwrap();

    assert_eq!(log.sweep_stale().unwrap(), 0);
    assert_eq!(log.sweep_stale_at(now_ms() + 61_000).unwrap(), 1);

    assert_eq!(log.open_transactions(), 0);
    assert!(recorder.calls().is_empty());
    assert!(log.commit(abandoned).is_err());
}

#[test]
fn support_commits_through_the_log() {
    let memory = InMemoryBackend::new();
    let recorder = Arc::new(RecordingApplier::new());
    let log = Arc::new(open(&memory, &recorder));
    let support = TransactionSupport::new(Arc::clone(&log), RetryConfig::no_retry());

    let mut outer = support.begin();
    support
        .run_nested(&outer, |tx| tx.store_bytes("user", DataId::new(1), b"inner"))
        .unwrap();
    assert_eq!(recorder.store_count(), 0);

    outer.store_bytes("user", DataId::new(2), b"outer").unwrap();
    outer.commit().unwrap();

    let ids: Vec<DataId> = recorder.stores().into_iter().map(|(_, id, _)| id).collect();
    assert_eq!(ids, vec![DataId::new(1), DataId::new(2)]);
}
