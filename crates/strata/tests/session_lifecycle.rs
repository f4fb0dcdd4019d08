//! End-to-end session lifecycle: open/commit/close, state-machine
//! rules, crash detection, compatibility checks, compaction.

mod common;

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;

use common::{RecordingHistory, lock_path, temp_db};
use strata::{
    Durability, Session, SessionOptions, SnapshotId, SnapshotStore, StrataError, TransactStage,
    VersionSpec, layout,
};

#[test]
fn single_participant_open_commit_close() {
    let (_dir, db) = temp_db("basic.strata");
    let mut session = Session::open(&db, SessionOptions::default()).unwrap();

    assert_eq!(session.participant_count().unwrap(), 1);
    assert_eq!(session.latest_snapshot_version().unwrap(), 1);
    assert_eq!(session.number_of_versions().unwrap(), 1);

    // The seed snapshot is version 1 with a null top ref.
    session.begin_read(VersionSpec::Latest).unwrap();
    {
        let pin = session.pinned_snapshot().unwrap();
        assert_eq!(pin.version(), 1);
        assert!(pin.top_ref().is_null());
    }
    session.end_read().unwrap();

    // First commit: version 2; the seed version is still live because
    // cleanup ran while this writer pinned it.
    session.begin_write().unwrap();
    session.store_mut().stage(b"first");
    assert_eq!(session.commit().unwrap(), 2);
    assert_eq!(session.latest_snapshot_version().unwrap(), 2);
    assert_eq!(session.number_of_versions().unwrap(), 2);

    // Steady state: each commit recycles everything up to the writer's
    // own base snapshot.
    session.begin_write().unwrap();
    session.store_mut().stage(b"second");
    assert_eq!(session.commit().unwrap(), 3);
    assert_eq!(session.number_of_versions().unwrap(), 2);

    session.close().unwrap();
    assert!(!session.is_attached());
    session.close().unwrap(); // idempotent
}

#[test]
fn committed_data_survives_reopen() {
    let (_dir, db) = temp_db("durable.strata");
    {
        let mut session = Session::open(&db, SessionOptions::default()).unwrap();
        session.begin_write().unwrap();
        session.store_mut().stage(b"persisted bytes");
        session.commit().unwrap();
    }

    let mut session = Session::open(&db, SessionOptions::default()).unwrap();
    assert_eq!(session.latest_snapshot_version().unwrap(), 2);
    session.begin_read(VersionSpec::Latest).unwrap();
    assert_eq!(
        session.store().bound_payload().unwrap(),
        b"persisted bytes"
    );
    session.end_read().unwrap();
}

#[test]
fn wrong_transact_state_transitions() {
    let (_dir, db) = temp_db("states.strata");
    let mut session = Session::open(&db, SessionOptions::default()).unwrap();

    // Reading excludes writing and re-reading.
    session.begin_read(VersionSpec::Latest).unwrap();
    assert!(matches!(
        session.begin_read(VersionSpec::Latest),
        Err(StrataError::WrongTransactState)
    ));
    assert!(matches!(
        session.begin_write(),
        Err(StrataError::WrongTransactState)
    ));
    assert!(matches!(
        session.rollback(),
        Err(StrataError::WrongTransactState)
    ));
    session.end_read().unwrap();

    // Ready: commit and end-of-nothing.
    assert!(matches!(
        session.commit(),
        Err(StrataError::WrongTransactState)
    ));
    session.end_read().unwrap(); // idempotent from Ready
    session.rollback().unwrap(); // idempotent from Ready

    // Writing excludes reading.
    session.begin_write().unwrap();
    assert!(matches!(
        session.begin_read(VersionSpec::Latest),
        Err(StrataError::WrongTransactState)
    ));
    assert!(matches!(
        session.end_read(),
        Err(StrataError::WrongTransactState)
    ));
    session.rollback().unwrap();
    assert_eq!(session.transact_stage(), TransactStage::Ready);
}

#[test]
fn rollback_discards_the_version() {
    let (_dir, db) = temp_db("rollback.strata");
    let mut session = Session::open(&db, SessionOptions::default()).unwrap();

    session.begin_write().unwrap();
    session.store_mut().stage(b"doomed");
    session.rollback().unwrap();

    assert_eq!(session.latest_snapshot_version().unwrap(), 1);

    // The next commit publishes version 2 as if the rollback never
    // happened.
    session.begin_write().unwrap();
    assert_eq!(session.commit().unwrap(), 2);
}

#[test]
fn commit_and_continue_as_read_binds_own_commit() {
    let (_dir, db) = temp_db("continue.strata");
    let mut session = Session::open(&db, SessionOptions::default()).unwrap();

    session.begin_write().unwrap();
    session.store_mut().stage(b"kept visible");
    let version = session.commit_and_continue_as_read().unwrap();
    assert_eq!(version, 2);
    assert_eq!(session.transact_stage(), TransactStage::Reading);
    assert_eq!(session.pinned_snapshot().unwrap().version(), 2);
    assert_eq!(session.store().bound_payload().unwrap(), b"kept visible");
    session.end_read().unwrap();
}

#[test]
fn pin_release_is_a_noop_on_observable_state() {
    let (_dir, db) = temp_db("noop_pin.strata");
    let mut session = Session::open(&db, SessionOptions::default()).unwrap();
    session.begin_write().unwrap();
    session.commit().unwrap();

    let latest = session.latest_snapshot_version().unwrap();
    let versions = session.number_of_versions().unwrap();

    session.begin_read(VersionSpec::Latest).unwrap();
    session.end_read().unwrap();

    assert_eq!(session.latest_snapshot_version().unwrap(), latest);
    assert_eq!(session.number_of_versions().unwrap(), versions);
}

#[test]
fn pin_handover_tokens() {
    let (_dir, db) = temp_db("handover.strata");
    let mut session = Session::open(&db, SessionOptions::default()).unwrap();
    session.begin_write().unwrap();
    session.commit().unwrap();

    session.begin_read(VersionSpec::Latest).unwrap();
    let token = session.pin_version().unwrap();
    session.end_read().unwrap();

    // The extra pin keeps version 2 alive across later commits.
    session.begin_write().unwrap();
    session.commit().unwrap();
    session.begin_write().unwrap();
    session.commit().unwrap();

    let mut reader = Session::open(&db, SessionOptions::default()).unwrap();
    reader.begin_read(VersionSpec::Exact(token)).unwrap();
    assert_eq!(reader.pinned_snapshot().unwrap().version(), token.version);
    reader.end_read().unwrap();

    session.unpin_version(token).unwrap();
}

#[test]
fn stale_token_raises_bad_version_without_leaking() {
    let (_dir, db) = temp_db("stale.strata");
    let mut session = Session::open(&db, SessionOptions::default()).unwrap();
    session.begin_write().unwrap();
    session.commit().unwrap(); // v2

    let token = session.begin_read(VersionSpec::Latest).unwrap();
    session.end_read().unwrap();

    // Enough commits to recycle the slot that held v2.
    for _ in 0..4 {
        session.begin_write().unwrap();
        session.commit().unwrap();
    }

    assert!(matches!(
        session.begin_read(VersionSpec::Exact(token)),
        Err(StrataError::BadVersion)
    ));
    assert_eq!(session.transact_stage(), TransactStage::Ready);

    // No pin leaked: history keeps collapsing to the steady state.
    session.begin_write().unwrap();
    session.commit().unwrap();
    assert_eq!(session.number_of_versions().unwrap(), 2);
}

#[test]
fn bogus_token_index_is_bad_version() {
    let (_dir, db) = temp_db("bogus.strata");
    let mut session = Session::open(&db, SessionOptions::default()).unwrap();
    let bogus = SnapshotId {
        version: 1,
        index: 999,
    };
    assert!(matches!(
        session.begin_read(VersionSpec::Exact(bogus)),
        Err(StrataError::BadVersion)
    ));
}

#[test]
fn crash_in_critical_phase_breaks_the_session() {
    let (_dir, db) = temp_db("crash.strata");
    let mut a = Session::open(&db, SessionOptions::default()).unwrap();
    let mut b = Session::open(&db, SessionOptions::default()).unwrap();

    // Simulate a writer dying mid-publish: the critical-phase byte is
    // left set in the session file.
    let lock_file = OpenOptions::new()
        .write(true)
        .open(lock_path(&db))
        .unwrap();
    lock_file
        .write_all_at(&[1], layout::offsets::COMMIT_IN_CRITICAL_PHASE)
        .unwrap();

    assert!(matches!(a.begin_write(), Err(StrataError::SessionBroken)));
    assert!(matches!(b.begin_write(), Err(StrataError::SessionBroken)));
    assert_eq!(a.transact_stage(), TransactStage::Ready);

    // Reads are still possible; only writers fail fast.
    a.begin_read(VersionSpec::Latest).unwrap();
    a.end_read().unwrap();

    // Restarting the session (last participant out, first back in)
    // reinitializes the lock file and clears the flag.
    a.close().unwrap();
    b.close().unwrap();
    let mut fresh = Session::open(&db, SessionOptions::default()).unwrap();
    fresh.begin_write().unwrap();
    fresh.commit().unwrap();
}

#[test]
fn coordination_directory_carries_the_control_files() {
    let (_dir, db) = temp_db("coord.strata");
    let _session = Session::open(&db, SessionOptions::default()).unwrap();

    let management = std::path::PathBuf::from(format!("{}.management", db.display()));
    for tag in [
        "write",
        "control",
        "balance",
        "new_commit",
        "daemon_ready",
        "work_ready",
        "allow_write",
    ] {
        assert!(
            management.join(format!("access_control.{tag}")).exists(),
            "missing coordination file for {tag}"
        );
    }
}

#[test]
fn mem_only_file_is_deleted_on_last_close() {
    let (_dir, db) = temp_db("transient.strata");
    let options = SessionOptions {
        durability: Durability::MemOnly,
        ..SessionOptions::default()
    };

    let mut a = Session::open(&db, options.clone()).unwrap();
    let mut b = Session::open(&db, options.clone()).unwrap();
    a.begin_write().unwrap();
    a.store_mut().stage(b"ephemeral");
    a.commit().unwrap();

    a.close().unwrap();
    assert!(db.exists(), "file must survive while participants remain");
    b.close().unwrap();
    assert!(!db.exists(), "last participant removes a mem-only file");

    // A fresh mem-only session starts over from scratch.
    let mut fresh = Session::open(&db, options).unwrap();
    assert_eq!(fresh.latest_snapshot_version().unwrap(), 1);
    fresh.close().unwrap();
}

#[test]
fn mixed_durability_is_rejected() {
    let (_dir, db) = temp_db("mixed_dura.strata");
    let _full = Session::open(&db, SessionOptions::default()).unwrap();

    let mem = SessionOptions {
        durability: Durability::MemOnly,
        ..SessionOptions::default()
    };
    assert!(matches!(
        Session::open(&db, mem),
        Err(StrataError::MixedDurability)
    ));
    assert_eq!(_full.participant_count().unwrap(), 1);
}

#[test]
fn async_durability_is_not_built() {
    let (_dir, db) = temp_db("async.strata");
    let options = SessionOptions {
        durability: Durability::Async,
        ..SessionOptions::default()
    };
    assert!(matches!(
        Session::open(&db, options),
        Err(StrataError::AsyncUnsupported)
    ));
}

#[test]
fn mixed_history_type_is_rejected() {
    use strata::HistoryType;

    let (_dir, db) = temp_db("mixed_hist.strata");
    let (initiator_history, _) = RecordingHistory::new(HistoryType::InFile);
    let initiator = Session::open_with(
        strata::SlabStore::new(),
        Some(Box::new(initiator_history)),
        &db,
        SessionOptions::default(),
    )
    .unwrap();

    let (joiner_history, _) = RecordingHistory::new(HistoryType::Sync);
    assert!(matches!(
        Session::open_with(
            strata::SlabStore::new(),
            Some(Box::new(joiner_history)),
            &db,
            SessionOptions::default(),
        ),
        Err(StrataError::MixedHistoryType)
    ));
    assert_eq!(
        initiator.participant_count().unwrap(),
        1,
        "failed join must not change the participant count"
    );
}

#[test]
fn incompatible_stored_history_rejected_at_session_start() {
    use strata::HistoryType;

    let (_dir, db) = temp_db("stored_hist.strata");
    {
        let (history, _) = RecordingHistory::new(HistoryType::InFile);
        let mut s = Session::open_with(
            strata::SlabStore::new(),
            Some(Box::new(history)),
            &db,
            SessionOptions::default(),
        )
        .unwrap();
        s.begin_write().unwrap();
        s.commit().unwrap();
    }

    // A later history-free session cannot adopt an in-file history.
    assert!(matches!(
        Session::open(&db, SessionOptions::default()),
        Err(StrataError::InvalidDatabase { .. })
    ));
}

#[test]
fn history_hook_sees_the_transaction_lifecycle() {
    use strata::HistoryType;

    let (_dir, db) = temp_db("hook.strata");
    let (history, events) = RecordingHistory::new(HistoryType::InFile);
    let mut session = Session::open_with(
        strata::SlabStore::new(),
        Some(Box::new(history)),
        &db,
        SessionOptions::default(),
    )
    .unwrap();

    session.begin_write().unwrap();
    session.commit().unwrap();
    session.begin_write().unwrap();
    session.rollback().unwrap();
    session.close().unwrap();

    let log = events.lock().unwrap().clone();
    assert_eq!(
        log,
        vec![
            "initiate_session(1)".to_owned(),
            "initiate_transact(1)".to_owned(),
            "prepare_commit(1)".to_owned(),
            "set_oldest_bound_version(1)".to_owned(),
            "finalize_commit".to_owned(),
            "initiate_transact(2)".to_owned(),
            "abort_transact".to_owned(),
            "terminate_session".to_owned(),
        ]
    );
}

#[test]
fn corrupted_lock_file_prefix_is_incompatible() {
    let (_dir, db) = temp_db("corrupt.strata");
    {
        let _s = Session::open(&db, SessionOptions::default()).unwrap();
    }

    // Stamp a wrong layout version while nobody holds the session,
    // then flip init_complete back on so the opener reaches the
    // compatibility checks... it must NOT: with no participants the
    // opener reinitializes the file and succeeds. So hold a shared
    // lock through a live session instead.
    let keeper = Session::open(&db, SessionOptions::default()).unwrap();
    let lock_file = OpenOptions::new()
        .write(true)
        .open(lock_path(&db))
        .unwrap();
    lock_file
        .write_all_at(
            &7u16.to_le_bytes(),
            layout::offsets::SHARED_INFO_VERSION,
        )
        .unwrap();

    assert!(matches!(
        Session::open(&db, SessionOptions::default()),
        Err(StrataError::IncompatibleLockFile { .. })
    ));
    drop(keeper);
}

#[test]
fn compaction_rewrites_and_reopens() {
    let (_dir, db) = temp_db("compact.strata");
    let mut session = Session::open(&db, SessionOptions::default()).unwrap();
    for _ in 0..8 {
        session.begin_write().unwrap();
        session.store_mut().stage(b"payload that piles up over commits");
        session.commit().unwrap();
    }
    let latest = session.latest_snapshot_version().unwrap();
    let before = std::fs::metadata(&db).unwrap().len();

    assert!(session.compact().unwrap());
    assert!(session.is_attached());

    let after = std::fs::metadata(&db).unwrap().len();
    assert!(after < before, "compaction must shrink the file");
    assert_eq!(session.latest_snapshot_version().unwrap(), latest);

    // The live payload survived.
    session.begin_read(VersionSpec::Latest).unwrap();
    assert_eq!(
        session.store().bound_payload().unwrap(),
        b"payload that piles up over commits"
    );
    session.end_read().unwrap();

    // And the compacted file keeps accepting commits.
    session.begin_write().unwrap();
    assert_eq!(session.commit().unwrap(), latest + 1);
}

#[test]
fn compaction_refuses_with_other_participants() {
    let (_dir, db) = temp_db("compact_multi.strata");
    let mut a = Session::open(&db, SessionOptions::default()).unwrap();
    let _b = Session::open(&db, SessionOptions::default()).unwrap();

    assert!(!a.compact().unwrap());
    assert!(a.is_attached());
    assert_eq!(a.participant_count().unwrap(), 2);
}

#[test]
fn compaction_requires_ready_state() {
    let (_dir, db) = temp_db("compact_state.strata");
    let mut session = Session::open(&db, SessionOptions::default()).unwrap();
    session.begin_read(VersionSpec::Latest).unwrap();
    assert!(matches!(
        session.compact(),
        Err(StrataError::WrongTransactState)
    ));
    session.end_read().unwrap();
}

#[test]
fn below_target_file_format_requires_upgrade() {
    let (_dir, db) = temp_db("upgrade.strata");
    {
        let mut session = Session::open(&db, SessionOptions::default()).unwrap();
        session.begin_write().unwrap();
        session.commit().unwrap(); // persists the current file format
    }

    // Age the file: stamp an older format version into the slab
    // header (byte 8).
    let db_file = OpenOptions::new().write(true).open(&db).unwrap();
    db_file
        .write_all_at(&[strata::CURRENT_FILE_FORMAT - 1], 8)
        .unwrap();
    drop(db_file);

    let no_upgrade = SessionOptions {
        allow_file_format_upgrade: false,
        ..SessionOptions::default()
    };
    assert!(matches!(
        Session::open(&db, no_upgrade),
        Err(StrataError::FileFormatUpgradeRequired)
    ));

    // With upgrades allowed the open succeeds and makes the new
    // format durable.
    let mut session = Session::open(&db, SessionOptions::default()).unwrap();
    assert_eq!(
        session.store().committed_file_format_version().unwrap(),
        strata::CURRENT_FILE_FORMAT
    );
    session.begin_write().unwrap();
    session.commit().unwrap();
}

#[test]
fn encrypted_session_is_shared_within_the_process() {
    let key = vec![7u8; 64];
    let (_dir, db) = temp_db("encrypted.strata");
    let options = SessionOptions {
        encryption_key: Some(key),
        ..SessionOptions::default()
    };

    let initiator = Session::open(&db, options.clone()).unwrap();
    // Same process, same pid: joining is allowed.
    let joiner = Session::open(&db, options).unwrap();
    assert_eq!(initiator.participant_count().unwrap(), 2);
    drop(joiner);
    drop(initiator);
}

#[test]
fn operations_after_close_fail_cleanly() {
    let (_dir, db) = temp_db("closed.strata");
    let mut session = Session::open(&db, SessionOptions::default()).unwrap();
    session.close().unwrap();

    assert!(matches!(
        session.begin_read(VersionSpec::Latest),
        Err(StrataError::SessionClosed)
    ));
    assert!(matches!(
        session.begin_write(),
        Err(StrataError::SessionClosed)
    ));
    assert!(matches!(
        session.participant_count(),
        Err(StrataError::SessionClosed)
    ));
}
