//! Change notification: waiting for a newer snapshot.
//!
//! Waiters compare the version their session last observed against the
//! session header's latest version, re-reading the header on every
//! wakeup so commits from other processes are observed no later than
//! one poll interval after they land. In-process commits wake waiters
//! immediately through the condvar.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use strata_error::Result;
use strata_store::SnapshotStore;

use crate::ipc::IpcCondVar;
use crate::layout::{self, offsets};
use crate::session::Session;

impl<S: SnapshotStore> Session<S> {
    /// Whether a snapshot newer than the last one this session observed
    /// has been committed.
    pub fn has_changed(&self) -> Result<bool> {
        let att = self.attachment()?;
        let latest = layout::read_u64_at(&att.lock_file, offsets::LATEST_VERSION)?;
        Ok(self.read_lock.version() != latest)
    }

    /// Block until a newer snapshot is committed or waiting is
    /// cancelled. Returns whether a newer snapshot exists.
    pub fn wait_for_change(&mut self) -> Result<bool> {
        let pinned = self.read_lock.version();
        loop {
            let att = self.attachment()?;
            let latest = att
                .control_mutex
                .with(|| layout::read_u64_at(&att.lock_file, offsets::LATEST_VERSION))?;
            if latest != pinned {
                return Ok(true);
            }
            if !self.wait_enabled.load(Ordering::Acquire) {
                return Ok(false);
            }
            att.new_commit.wait_interval();
        }
    }

    /// Cancel all waiters of this session; they return with the current
    /// state.
    pub fn wait_for_change_release(&self) -> Result<()> {
        self.notifier()?.wait_for_change_release();
        Ok(())
    }

    /// Re-enable waiting after a release.
    pub fn enable_wait_for_change(&self) -> Result<()> {
        self.notifier()?.enable_wait_for_change();
        Ok(())
    }

    /// A handle for cancelling this session's waiters from another
    /// thread.
    pub fn notifier(&self) -> Result<ChangeNotifier> {
        let att = self.attachment()?;
        Ok(ChangeNotifier {
            new_commit: att.new_commit.clone(),
            enabled: Arc::clone(&self.wait_enabled),
        })
    }
}

/// Cancellation handle for [`Session::wait_for_change`].
#[derive(Clone)]
pub struct ChangeNotifier {
    new_commit: IpcCondVar,
    enabled: Arc<AtomicBool>,
}

impl ChangeNotifier {
    /// Disable waiting and wake all waiters immediately.
    pub fn wait_for_change_release(&self) {
        self.enabled.store(false, Ordering::Release);
        self.new_commit.notify_all();
    }

    /// Re-enable waiting.
    pub fn enable_wait_for_change(&self) {
        self.enabled.store(true, Ordering::Release);
    }
}
