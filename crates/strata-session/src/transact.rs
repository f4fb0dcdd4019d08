//! The transaction state machine: Ready, Reading, Writing.
//!
//! Illegal transitions raise `WrongTransactState` without touching any
//! shared state. `end_read` and `rollback` are idempotent from Ready so
//! teardown paths can call them unconditionally.

use strata_error::{Result, StrataError};
use strata_store::SnapshotStore;
use strata_types::{SnapshotId, VersionSpec};

use crate::layout::{self, offsets};
use crate::readlock::ReadLockInfo;
use crate::session::Session;

/// Transaction stage of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactStage {
    /// No transaction in progress.
    #[default]
    Ready,
    /// Bound to a snapshot read-only.
    Reading,
    /// Holding the write mutex with a bound base snapshot.
    Writing,
}

impl<S: SnapshotStore> Session<S> {
    /// Current transaction stage.
    #[must_use]
    pub fn transact_stage(&self) -> TransactStage {
        self.stage
    }

    /// The read lock backing the current transaction, if any.
    #[must_use]
    pub fn pinned_snapshot(&self) -> Option<&ReadLockInfo> {
        match self.stage {
            TransactStage::Ready => None,
            TransactStage::Reading | TransactStage::Writing => Some(&self.read_lock),
        }
    }

    /// Token of the snapshot bound by the current transaction.
    #[must_use]
    pub fn current_version_id(&self) -> SnapshotId {
        self.read_lock.snapshot_id()
    }

    // -----------------------------------------------------------------------
    // Read transactions
    // -----------------------------------------------------------------------

    /// Begin a read transaction bound to `spec`.
    pub fn begin_read(&mut self, spec: VersionSpec) -> Result<SnapshotId> {
        if self.stage != TransactStage::Ready {
            return Err(StrataError::WrongTransactState);
        }
        self.do_begin_read(spec, false)?;
        self.stage = TransactStage::Reading;
        Ok(self.read_lock.snapshot_id())
    }

    /// End the read transaction. Idempotent from Ready.
    pub fn end_read(&mut self) -> Result<()> {
        match self.stage {
            TransactStage::Ready => Ok(()),
            TransactStage::Writing => Err(StrataError::WrongTransactState),
            TransactStage::Reading => {
                self.do_end_read();
                self.stage = TransactStage::Ready;
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Write transactions
    // -----------------------------------------------------------------------

    /// Begin a write transaction: acquire the write mutex, bind the
    /// latest snapshot, and open the history transaction.
    pub fn begin_write(&mut self) -> Result<()> {
        if self.stage != TransactStage::Ready {
            return Err(StrataError::WrongTransactState);
        }
        self.do_begin_write()?;

        // The pin necessarily lands on the latest snapshot: no other
        // write transaction can be initiated while we hold the write
        // mutex.
        if let Err(e) = self.do_begin_read(VersionSpec::Latest, true) {
            self.do_end_write();
            return Err(e);
        }

        let base_version = self.read_lock.version();
        let mut history = self.history.take();
        let initiated = history
            .as_mut()
            .map_or(Ok(()), |h| h.initiate_transact(base_version));
        self.history = history;
        if let Err(e) = initiated {
            self.do_end_read();
            self.do_end_write();
            return Err(e);
        }

        self.stage = TransactStage::Writing;
        Ok(())
    }

    /// Commit the write transaction; returns the published version.
    ///
    /// On error the session stays in Writing so the caller can
    /// [`rollback`](Self::rollback).
    pub fn commit(&mut self) -> Result<u64> {
        if self.stage != TransactStage::Writing {
            return Err(StrataError::WrongTransactState);
        }
        let new_version = self.do_commit()?;
        self.do_end_write();
        self.do_end_read();
        self.stage = TransactStage::Ready;
        Ok(new_version)
    }

    /// Abandon the write transaction. Idempotent from Ready.
    pub fn rollback(&mut self) -> Result<()> {
        match self.stage {
            TransactStage::Ready => Ok(()),
            TransactStage::Reading => Err(StrataError::WrongTransactState),
            TransactStage::Writing => {
                self.do_end_write();
                self.do_end_read();
                if let Some(h) = self.history.as_mut() {
                    h.abort_transact();
                }
                self.stage = TransactStage::Ready;
                Ok(())
            }
        }
    }

    /// Commit and immediately continue as a read transaction on the
    /// just-published snapshot.
    ///
    /// Equivalent to `commit(); begin_read(Latest)` but atomic with
    /// respect to other writers: the new pin is taken before the write
    /// mutex is released, so it is guaranteed to land on our own
    /// commit.
    pub fn commit_and_continue_as_read(&mut self) -> Result<u64> {
        if self.stage != TransactStage::Writing {
            return Err(StrataError::WrongTransactState);
        }
        let new_version = self.do_commit()?;

        {
            let att = self.att.as_mut().ok_or(StrataError::SessionClosed)?;
            let old = self.read_lock;
            att.ring.release_read_lock(&att.lock_file, &old)?;
            att.ring
                .grab_read_lock(&att.lock_file, &mut self.read_lock, VersionSpec::Latest)?;
        }
        self.do_end_write();

        // The file grew under the accessor; re-bind it to the new
        // snapshot.
        self.store
            .remap(self.read_lock.top_ref(), self.read_lock.file_size())?;
        self.stage = TransactStage::Reading;
        Ok(new_version)
    }

    // -----------------------------------------------------------------------
    // Pin handover
    // -----------------------------------------------------------------------

    /// Take an extra pin on the current transaction's snapshot, for
    /// handover to another session or thread.
    pub fn pin_version(&mut self) -> Result<SnapshotId> {
        if self.stage == TransactStage::Ready {
            return Err(StrataError::WrongTransactState);
        }
        let id = self.read_lock.snapshot_id();
        let att = self.att.as_mut().ok_or(StrataError::SessionClosed)?;
        let mut extra = ReadLockInfo::for_index(id);
        att.ring
            .grab_read_lock(&att.lock_file, &mut extra, VersionSpec::Exact(id))?;
        Ok(id)
    }

    /// Release a pin taken with [`pin_version`](Self::pin_version).
    pub fn unpin_version(&mut self, token: SnapshotId) -> Result<()> {
        let att = self.att.as_mut().ok_or(StrataError::SessionClosed)?;
        let lock = ReadLockInfo::for_index(token);
        att.ring.release_read_lock(&att.lock_file, &lock)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    pub(crate) fn do_begin_read(&mut self, spec: VersionSpec, writable: bool) -> Result<()> {
        {
            let att = self.att.as_mut().ok_or(StrataError::SessionClosed)?;
            att.ring
                .grab_read_lock(&att.lock_file, &mut self.read_lock, spec)?;
        }
        let (top_ref, file_size) = (self.read_lock.top_ref(), self.read_lock.file_size());
        if let Err(e) = self.store.bind_snapshot(top_ref, file_size, writable) {
            // The pin must not leak when the accessor cannot attach.
            let att = self.att.as_mut().ok_or(StrataError::SessionClosed)?;
            att.ring
                .release_read_lock(&att.lock_file, &self.read_lock)?;
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn do_end_read(&mut self) {
        if let Some(att) = self.att.as_mut() {
            // The pin was grabbed through this mapping, so the release
            // can only fail if a remap fails; the pin is then leaked
            // until the session restarts, which is still safe.
            if let Err(e) = att.ring.release_read_lock(&att.lock_file, &self.read_lock) {
                tracing::warn!(target: "strata.session", error = %e, "read-lock release failed");
            }
        }
        self.store.unbind_snapshot();
    }

    pub(crate) fn do_begin_write(&mut self) -> Result<()> {
        let att = self.att.as_ref().ok_or(StrataError::SessionClosed)?;
        att.write_mutex.lock()?;

        // A writer that died while mutating the ring leaves the flag
        // set; the shared state cannot be trusted until the session
        // file is reinitialized.
        match layout::read_u8_at(&att.lock_file, offsets::COMMIT_IN_CRITICAL_PHASE) {
            Ok(0) => Ok(()),
            Ok(_) => {
                att.write_mutex.unlock();
                Err(StrataError::SessionBroken)
            }
            Err(e) => {
                att.write_mutex.unlock();
                Err(e)
            }
        }
    }

    pub(crate) fn do_end_write(&mut self) {
        if let Some(att) = self.att.as_ref() {
            att.write_mutex.unlock();
        }
    }

    pub(crate) fn do_commit(&mut self) -> Result<u64> {
        let current = {
            let att = self.att.as_mut().ok_or(StrataError::SessionClosed)?;
            let last = att.ring.last();
            att.ring.grow(&att.lock_file, last)?;
            att.ring.slot(last).version()
        };
        let default_version = current + 1;

        let mut history = self.history.take();
        let result = if let Some(h) = history.as_mut() {
            match h.prepare_commit(current) {
                Ok(new_version) => match self.low_level_commit(new_version, Some(&mut **h)) {
                    Ok(()) => {
                        h.finalize_commit();
                        Ok(new_version)
                    }
                    Err(e) => {
                        h.abort_transact();
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            }
        } else {
            self.low_level_commit(default_version, None)
                .map(|()| default_version)
        };
        self.history = history;
        result
    }
}
