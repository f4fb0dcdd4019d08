//! Session coordinator: the open/join/close protocol.
//!
//! A session is the interval from the first participant's open of a
//! database file to the last participant's close. Participants
//! coordinate through the transient `<db>.lock` file:
//!
//! 1. Try an exclusive lock on the file. The winner truncates it,
//!    writes a fresh header with `init_complete = 0`, flips
//!    `init_complete` to 1 as a separate step, and releases.
//! 2. Take a shared lock (held for the participant's lifetime). A
//!    short or uninitialized file means a concurrent initializer died;
//!    drop the lock and retry from the top.
//! 3. Verify the layout (frozen prefix, mutex/condvar sizes) and probe
//!    the control mutex.
//! 4. Under the control mutex: attach the database store, map the
//!    shared ring region, run the initiator or joiner checks, and bump
//!    the participant count.
//!
//! Every participant — same process or not — memory-maps the ring
//! region of the session file, so all of them operate on the same
//! physical slot counters (see [`crate::ring`]). There is no
//! per-process copy of the ring to reconcile: the mapping *is* the
//! shared state.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use strata_error::{Result, StrataError};
use strata_store::{HistoryHook, SlabStore, SnapshotStore};
use strata_types::{
    AttachConfig, Durability, HistoryType, SessionOptions, TopRef, target_file_format_for_session,
};

use crate::ipc::{self, IpcCondVar, IpcMutex, ofd_lock, ofd_unlock};
use crate::layout::{self, offsets};
use crate::readlock::ReadLockInfo;
use crate::ring::VersionRing;
use crate::transact::TransactStage;

// ---------------------------------------------------------------------------
// Attachment
// ---------------------------------------------------------------------------

/// Everything a participant holds while attached to a session.
///
/// The ring mapping and the shared file lock live and die together:
/// dropping the attachment unmaps first (field order) and then closes
/// the lock file, which releases the shared lock — so the session file
/// can never be truncated out from under a live mapping.
pub(crate) struct Attachment {
    pub(crate) ring: VersionRing,
    pub(crate) lock_file: Arc<File>,
    pub(crate) write_mutex: IpcMutex,
    pub(crate) control_mutex: IpcMutex,
    pub(crate) new_commit: IpcCondVar,
    pub(crate) target_file_format: u8,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A participant in a shared database session.
///
/// One `Session` is one participant; open several (in one process or
/// many) to share the database. Transactions run through
/// [`begin_read`](Session::begin_read) /
/// [`begin_write`](Session::begin_write) and friends.
pub struct Session<S: SnapshotStore> {
    pub(crate) db_path: PathBuf,
    pub(crate) lockfile_path: PathBuf,
    coordination_dir: PathBuf,
    pub(crate) options: SessionOptions,
    pub(crate) store: S,
    pub(crate) history: Option<Box<dyn HistoryHook>>,
    pub(crate) att: Option<Attachment>,
    pub(crate) stage: TransactStage,
    pub(crate) read_lock: ReadLockInfo,
    pub(crate) wait_enabled: Arc<AtomicBool>,
}

impl Session<SlabStore> {
    /// Open a session with the default slab store and no history.
    pub fn open(db_path: impl AsRef<Path>, options: SessionOptions) -> Result<Self> {
        Self::open_with(SlabStore::new(), None, db_path, options)
    }
}

impl<S: SnapshotStore> Session<S> {
    /// Open a session with an explicit store and optional history hook.
    pub fn open_with(
        store: S,
        history: Option<Box<dyn HistoryHook>>,
        db_path: impl AsRef<Path>,
        options: SessionOptions,
    ) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let lockfile_path = suffixed(&db_path, ".lock");
        let coordination_dir = suffixed(&db_path, ".management");
        let mut session = Self {
            db_path,
            lockfile_path,
            coordination_dir,
            options,
            store,
            history,
            att: None,
            stage: TransactStage::Ready,
            read_lock: ReadLockInfo::unbound_at(0),
            wait_enabled: Arc::new(AtomicBool::new(true)),
        };
        session.do_open()?;
        Ok(session)
    }

    /// The open protocol; also used by compaction to re-attach.
    pub(crate) fn do_open(&mut self) -> Result<()> {
        if self.options.durability == Durability::Async {
            return Err(StrataError::AsyncUnsupported);
        }
        fs::create_dir_all(&self.coordination_dir)?;
        let requested_history = self
            .history
            .as_ref()
            .map_or(HistoryType::None, |h| h.history_type());

        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.lockfile_path)?;

            if ofd_lock(&file, libc::F_WRLCK, false)? {
                // We are alone; initialize the session file. Truncating
                // first maximizes the chance that a half-initialized
                // file is rejected by participants that get the shared
                // lock after an initializer died mid-way.
                file.set_len(0)?;
                let image = layout::initial_image(self.options.durability, requested_history);
                file.write_all_at(&image, 0)?;
                // Completing initialization is a separate step so a
                // crash at any earlier point leaves init_complete == 0.
                layout::write_u8_at(&file, offsets::INIT_COMPLETE, 1)?;
                ofd_unlock(&file)?;
                tracing::debug!(
                    target: "strata.session",
                    path = %self.lockfile_path.display(),
                    "initialized session file"
                );
            }

            // Shared lock held from here until close.
            ofd_lock(&file, libc::F_RDLCK, true)?;

            let len = file.metadata()?.len();
            if len < layout::FROZEN_PREFIX_BYTES
                || layout::read_u8_at(&file, offsets::INIT_COMPLETE)? == 0
            {
                // The preceding initialization attempt failed; give up
                // the shared lock and retry as initializer.
                drop(file);
                continue;
            }

            layout::check_compatibility(&file)?;

            let write_mutex = IpcMutex::open(&self.coordination_dir, "write")?;
            let control_mutex = IpcMutex::open(&self.coordination_dir, "control")?;
            if !control_mutex.is_valid() {
                return Err(StrataError::incompatible("control mutex is invalid"));
            }
            // Reserved coordination files (balance mutex and the
            // condvar tags of the async extension).
            for tag in ["balance", "new_commit", "daemon_ready", "work_ready", "allow_write"] {
                ipc::touch_tag(&self.coordination_dir, tag)?;
            }

            control_mutex.lock()?;
            let joined = self.join_session(&file, requested_history);
            control_mutex.unlock();

            match joined {
                Ok((ring, target_file_format)) => {
                    let condvar_key = self
                        .lockfile_path
                        .canonicalize()
                        .unwrap_or_else(|_| self.lockfile_path.clone());
                    self.att = Some(Attachment {
                        ring,
                        lock_file: Arc::new(file),
                        write_mutex,
                        control_mutex,
                        new_commit: ipc::condvar_for(&condvar_key),
                        target_file_format,
                    });
                }
                Err(e) if e.is_transient() => continue,
                Err(e) => return Err(e),
            }
            break;
        }

        self.stage = TransactStage::Ready;
        self.wait_enabled.store(true, Ordering::Release);

        // Track the latest version so change detection works before the
        // first read transaction.
        let latest = {
            let att = self.att.as_mut().expect("attached above");
            att.ring.latest_snapshot_version(&att.lock_file)?
        };
        self.read_lock = ReadLockInfo::unbound_at(latest);

        if let Err(e) = self.adopt_or_upgrade_file_format() {
            let _ = self.close();
            return Err(e);
        }

        tracing::debug!(
            target: "strata.session",
            path = %self.db_path.display(),
            latest,
            "session opened"
        );
        Ok(())
    }

    /// Initiator/joiner branch under the control mutex.
    fn join_session(
        &mut self,
        file: &File,
        requested_history: HistoryType,
    ) -> Result<(VersionRing, u8)> {
        let num_participants = layout::read_u32_at(file, offsets::NUM_PARTICIPANTS)?;
        let begin_new_session = num_participants == 0;

        let cfg = AttachConfig {
            session_initiator: begin_new_session,
            is_shared: true,
            read_only: false,
            skip_validate: !begin_new_session,
            // Only the session initiator may create the database file.
            no_create: !begin_new_session,
            // A mem-only file that outlived its session should have
            // been deleted on close; clear whatever is left of it.
            clear_file: begin_new_session && self.options.durability == Durability::MemOnly,
            encryption_key: self.options.encryption_key.clone(),
        };
        let top_ref = self.store.attach(&self.db_path, &cfg)?;

        let joined = self.join_attached(file, requested_history, begin_new_session, top_ref);
        match joined {
            Ok((ring, target)) => {
                layout::write_u32_at(file, offsets::NUM_PARTICIPANTS, num_participants + 1)?;
                Ok((ring, target))
            }
            Err(e) => {
                // A failed join must not retain the attachment; a later
                // session may reinitialize the file underneath it.
                self.store.detach();
                Err(e)
            }
        }
    }

    fn join_attached(
        &mut self,
        file: &File,
        requested_history: HistoryType,
        begin_new_session: bool,
        top_ref: TopRef,
    ) -> Result<(VersionRing, u8)> {
        let target_file_format = target_file_format_for_session(self.store.file_format_version());

        if begin_new_session {
            let (version, stored_history) = self.store.stored_version_and_history()?;
            if !requested_history.accepts_stored(stored_history, top_ref.is_null()) {
                return Err(StrataError::invalid_database(
                    &self.db_path,
                    "bad or incompatible history type",
                ));
            }
            if stored_history != requested_history {
                self.store.set_history_type(requested_history)?;
            }
            if let Some(h) = self.history.as_mut() {
                h.initiate_session(version)?;
            }
            if self.options.encryption_key.is_some() {
                layout::write_u64_at(file, offsets::SESSION_INITIATOR_PID, process_id())?;
            }
            layout::write_u8_at(file, offsets::FILE_FORMAT_VERSION, target_file_format)?;
            layout::write_u64_at(file, offsets::NUMBER_OF_VERSIONS, 1)?;
            layout::write_u64_at(file, offsets::LATEST_VERSION, version)?;

            // Seed the shared ring with the on-disk snapshot.
            let ring = VersionRing::map(file)?;
            ring.reinit_last(version, top_ref.get(), self.store.baseline());
            tracing::debug!(
                target: "strata.session",
                version,
                history = %requested_history,
                "initiated session"
            );
            Ok((ring, target_file_format))
        } else {
            // Durability, history type, file format, and (under
            // encryption) the initiator pid must all match the running
            // session.
            let stored_durability =
                Durability::from_u16(layout::read_u16_at(file, offsets::DURABILITY)?)
                    .ok_or_else(|| StrataError::incompatible("unknown durability code"))?;
            if stored_durability != self.options.durability {
                return Err(StrataError::MixedDurability);
            }
            let history_code =
                i8::from_le_bytes([layout::read_u8_at(file, offsets::HISTORY_TYPE)?]);
            let stored_history = HistoryType::from_i8(history_code)
                .ok_or_else(|| StrataError::incompatible("unknown history type code"))?;
            if stored_history != requested_history {
                return Err(StrataError::MixedHistoryType);
            }
            if self.options.encryption_key.is_some() {
                let initiator_pid = layout::read_u64_at(file, offsets::SESSION_INITIATOR_PID)?;
                if initiator_pid != process_id() {
                    return Err(StrataError::EncryptedCrossProcess {
                        initiator_pid,
                        current_pid: process_id(),
                    });
                }
            }
            let stored_format = layout::read_u8_at(file, offsets::FILE_FORMAT_VERSION)?;
            if stored_format != target_file_format {
                return Err(StrataError::incompatible(format!(
                    "file format version mismatch: {stored_format} {target_file_format}"
                )));
            }

            // Map the same shared ring every other participant uses.
            let ring = VersionRing::map(file)?;
            Ok((ring, target_file_format))
        }
    }

    /// Close this participant. Idempotent.
    ///
    /// An open transaction is rolled back (writes) or ended (reads).
    /// When the last participant leaves a mem-only session, the
    /// database file is deleted.
    pub fn close(&mut self) -> Result<()> {
        if self.att.is_none() {
            return Ok(());
        }
        match self.stage {
            TransactStage::Writing => self.rollback()?,
            TransactStage::Reading => self.end_read()?,
            TransactStage::Ready => {}
        }
        if self.store.is_attached() {
            self.store.detach();
        }

        let att = self.att.take().expect("attachment checked above");
        let durability = self.options.durability;
        let db_path = self.db_path.clone();
        let history = self.history.as_mut();
        let result = att.control_mutex.with(|| {
            let remaining = layout::read_u32_at(&att.lock_file, offsets::NUM_PARTICIPANTS)?
                .saturating_sub(1);
            layout::write_u32_at(&att.lock_file, offsets::NUM_PARTICIPANTS, remaining)?;
            if remaining == 0 {
                if durability == Durability::MemOnly {
                    // Transient backing file; errors are irrelevant.
                    let _ = fs::remove_file(&db_path);
                }
                if let Some(h) = history {
                    h.terminate_session();
                }
                tracing::debug!(
                    target: "strata.session",
                    path = %db_path.display(),
                    "session ended"
                );
            }
            Ok(())
        });

        // Dropping the attachment unmaps the ring and then closes the
        // lock file, releasing the shared file lock. The shared parts
        // in the file are left as they are for any remaining
        // participants.
        drop(att);
        self.stage = TransactStage::Ready;
        result
    }

    // -----------------------------------------------------------------------
    // File-format adoption / upgrade
    // -----------------------------------------------------------------------

    fn adopt_or_upgrade_file_format(&mut self) -> Result<()> {
        let target = self.attachment()?.target_file_format;
        let current = self.store.file_format_version();
        if current == 0 {
            // Fresh file: adopt the session target; it becomes durable
            // with the first commit.
            self.store.set_file_format_version(target);
            return Ok(());
        }
        if current < target {
            self.upgrade_file_format(target)?;
        }
        Ok(())
    }

    /// Upgrade the database file format under a write transaction.
    fn upgrade_file_format(&mut self, target: u8) -> Result<()> {
        self.begin_write()?;
        let committed = match self.store.committed_file_format_version() {
            Ok(v) => v,
            Err(e) => {
                self.rollback()?;
                return Err(e);
            }
        };
        if committed < target {
            if !self.options.allow_file_format_upgrade {
                self.rollback()?;
                return Err(StrataError::FileFormatUpgradeRequired);
            }
            self.store.set_file_format_version(target);
            self.commit()?;
            tracing::debug!(
                target: "strata.session",
                from = committed,
                to = target,
                "upgraded file format"
            );
        } else {
            // Another participant upgraded concurrently.
            self.store.set_file_format_version(target);
            self.rollback()?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Path of the database file.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Whether the session is attached (not closed).
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.att.is_some()
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mutable access to the backing store (to stage changes inside a
    /// write transaction).
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Number of participants currently in the session.
    pub fn participant_count(&self) -> Result<u32> {
        let att = self.attachment()?;
        att.control_mutex
            .with(|| layout::read_u32_at(&att.lock_file, offsets::NUM_PARTICIPANTS))
    }

    /// Number of live versions (newest − oldest + 1).
    pub fn number_of_versions(&self) -> Result<u64> {
        let att = self.attachment()?;
        att.control_mutex
            .with(|| layout::read_u64_at(&att.lock_file, offsets::NUMBER_OF_VERSIONS))
    }

    /// Version of the newest published snapshot (lock-free probe).
    pub fn latest_snapshot_version(&mut self) -> Result<u64> {
        let att = self.att.as_mut().ok_or(StrataError::SessionClosed)?;
        att.ring.latest_snapshot_version(&att.lock_file)
    }

    /// Current capacity of the version ring.
    pub fn ring_capacity(&self) -> Result<u32> {
        Ok(self.attachment()?.ring.entries())
    }

    pub(crate) fn attachment(&self) -> Result<&Attachment> {
        self.att.as_ref().ok_or(StrataError::SessionClosed)
    }
}

impl<S: SnapshotStore> Drop for Session<S> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Append `suffix` to the final path component.
pub(crate) fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// This process's id, widened for the header field.
pub(crate) fn process_id() -> u64 {
    u64::from(nix::unistd::getpid().as_raw().unsigned_abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffixed_paths() {
        let db = Path::new("/data/things.strata");
        assert_eq!(
            suffixed(db, ".lock"),
            PathBuf::from("/data/things.strata.lock")
        );
        assert_eq!(
            suffixed(db, ".management"),
            PathBuf::from("/data/things.strata.management")
        );
    }

    #[test]
    fn process_id_is_stable_and_nonzero() {
        assert_ne!(process_id(), 0);
        assert_eq!(process_id(), process_id());
    }
}
