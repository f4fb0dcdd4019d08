//! Shared helpers for the end-to-end session tests.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use strata::{HistoryHook, HistoryType, Result};

/// A tempdir-backed database path.
pub fn temp_db(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(name);
    (dir, path)
}

/// Path of the session lock file for a database path.
pub fn lock_path(db: &std::path::Path) -> PathBuf {
    PathBuf::from(format!("{}.lock", db.display()))
}

/// History hook that records every call it receives.
pub struct RecordingHistory {
    kind: HistoryType,
    pub events: Arc<Mutex<Vec<String>>>,
}

impl RecordingHistory {
    pub fn new(kind: HistoryType) -> (Self, Arc<Mutex<Vec<String>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                kind,
                events: Arc::clone(&events),
            },
            events,
        )
    }

    fn record(&self, event: String) {
        self.events.lock().expect("events lock").push(event);
    }
}

impl HistoryHook for RecordingHistory {
    fn history_type(&self) -> HistoryType {
        self.kind
    }

    fn initiate_session(&mut self, version: u64) -> Result<()> {
        self.record(format!("initiate_session({version})"));
        Ok(())
    }

    fn terminate_session(&mut self) {
        self.record("terminate_session".to_owned());
    }

    fn initiate_transact(&mut self, version: u64) -> Result<()> {
        self.record(format!("initiate_transact({version})"));
        Ok(())
    }

    fn prepare_commit(&mut self, current_version: u64) -> Result<u64> {
        self.record(format!("prepare_commit({current_version})"));
        Ok(current_version + 1)
    }

    fn finalize_commit(&mut self) {
        self.record("finalize_commit".to_owned());
    }

    fn abort_transact(&mut self) {
        self.record("abort_transact".to_owned());
    }

    fn set_oldest_bound_version(&mut self, version: u64) -> Result<()> {
        self.record(format!("set_oldest_bound_version({version})"));
        Ok(())
    }
}
