//! Trait seams between the session coordinator and its collaborators.
//!
//! The coordinator never touches database-file bytes itself; it drives a
//! [`SnapshotStore`] to attach files and serialize snapshots, and an
//! optional [`HistoryHook`] for change-history bookkeeping. Both traits
//! are object safe so a session can hold them behind `dyn`.

use std::path::Path;

use strata_error::Result;
use strata_types::{AttachConfig, HistoryType, TopRef};

/// Outcome of serializing a snapshot into the database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotWriteOutcome {
    /// Root ref of the newly written snapshot.
    pub top_ref: TopRef,
    /// Logical file size covering the new snapshot.
    pub file_size: u64,
}

/// The on-disk snapshot store backing a session (the slab allocator /
/// group-writer pair seen from the coordinator's side).
///
/// Contract notes the coordinator relies on:
///
/// - [`attach`](Self::attach) may fail with `StrataError::Retry` when it
///   loses an open race; the session open loop restarts the handshake.
/// - After [`write_snapshot`](Self::write_snapshot) returns, the reported
///   `{top_ref, file_size}` must remain readable until the version they
///   belong to is recycled by ring cleanup.
/// - [`detach`](Self::detach) must drop any cached mapping so a
///   re-initialized file (e.g. after compaction) is never read through a
///   stale view.
pub trait SnapshotStore {
    /// Attach the database file, creating it if the config allows.
    /// Returns the top ref of the newest durable snapshot.
    fn attach(&mut self, path: &Path, cfg: &AttachConfig) -> Result<TopRef>;

    /// Detach from the database file.
    fn detach(&mut self);

    /// Whether a file is currently attached.
    fn is_attached(&self) -> bool;

    /// Logical size of the attached file as of the newest durable
    /// snapshot.
    fn baseline(&self) -> u64;

    /// Version number and history type stored in the attached file.
    fn stored_version_and_history(&self) -> Result<(u64, HistoryType)>;

    /// Persist the history type (session initiator only).
    fn set_history_type(&mut self, history: HistoryType) -> Result<()>;

    /// File format version adopted by this store instance.
    fn file_format_version(&self) -> u8;

    /// Adopt a file format version in memory; persisted by the next
    /// snapshot write.
    fn set_file_format_version(&mut self, version: u8);

    /// File format version as committed on disk.
    fn committed_file_format_version(&self) -> Result<u8>;

    /// Bind an accessor to the snapshot named by `{top_ref, file_size}`.
    fn bind_snapshot(&mut self, top_ref: TopRef, file_size: u64, writable: bool) -> Result<()>;

    /// Drop the bound accessor.
    fn unbind_snapshot(&mut self);

    /// Re-bind the accessor after a commit extended the file
    /// (commit-and-continue path).
    fn remap(&mut self, top_ref: TopRef, file_size: u64) -> Result<()>;

    /// Serialize the working state as snapshot `new_version`. Free space
    /// of versions older than `oldest_live_version` may be recycled.
    fn write_snapshot(
        &mut self,
        new_version: u64,
        oldest_live_version: u64,
    ) -> Result<SnapshotWriteOutcome>;

    /// Make the snapshot named by `top_ref` durable (fsync).
    fn sync_commit(&mut self, top_ref: TopRef) -> Result<()>;

    /// Write a fresh file at `dest` holding only the live data of the
    /// bound snapshot, fsynced. Used by compaction.
    fn write_compacted(&mut self, dest: &Path, version: u64) -> Result<()>;
}

/// Change-history hooks invoked around the transaction lifecycle.
///
/// Mirrors the coordinator's call sites exactly: a session initiator
/// calls [`initiate_session`](Self::initiate_session) once, every write
/// transaction brackets its work with
/// [`initiate_transact`](Self::initiate_transact) and either the
/// `prepare_commit`/`finalize_commit` pair or
/// [`abort_transact`](Self::abort_transact), and the commit pipeline
/// reports the reclaim horizon through
/// [`set_oldest_bound_version`](Self::set_oldest_bound_version).
///
/// `Send` because sessions (and the hooks inside them) move across
/// threads.
pub trait HistoryHook: Send {
    /// History type this hook maintains.
    fn history_type(&self) -> HistoryType;

    /// A new session begins at `version`.
    fn initiate_session(&mut self, version: u64) -> Result<()>;

    /// The last participant left the session.
    fn terminate_session(&mut self);

    /// A write transaction begins on top of `version`.
    fn initiate_transact(&mut self, version: u64) -> Result<()>;

    /// Reserve the commit; returns the version number the commit will
    /// publish (normally `current_version + 1`).
    fn prepare_commit(&mut self, current_version: u64) -> Result<u64>;

    /// The commit published successfully.
    fn finalize_commit(&mut self);

    /// The write transaction was abandoned.
    fn abort_transact(&mut self);

    /// History entries older than `version` may be dropped.
    fn set_oldest_bound_version(&mut self, version: u64) -> Result<()>;
}
