//! Shared identifier, snapshot, and configuration types for Strata.
//!
//! These types are deliberately small and dependency-free so that every
//! crate in the workspace (the store seam, the session coordinator, the
//! umbrella crate) can agree on them without pulling in the core.

use std::fmt;
use std::path::PathBuf;

/// The database file format version written by this build.
///
/// Stored both in the database file header and in the session file so all
/// session participants agree on the target format. A stored value of 0
/// means the file has not yet committed under any format (fresh file).
pub const CURRENT_FILE_FORMAT: u8 = 9;

/// Target file format for a session opening a file currently at
/// `current`. A fresh file (`current == 0`) adopts the latest format
/// without an upgrade; an older file must be upgraded to the target.
#[must_use]
pub const fn target_file_format_for_session(current: u8) -> u8 {
    let _ = current;
    CURRENT_FILE_FORMAT
}

// ---------------------------------------------------------------------------
// TopRef
// ---------------------------------------------------------------------------

/// Opaque offset into the database file naming the root of a snapshot.
///
/// A value of 0 is the null ref: the snapshot has no payload yet (empty
/// database).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct TopRef(u64);

impl TopRef {
    /// The null ref (empty database).
    pub const NULL: Self = Self(0);

    /// Create a top ref from a raw file offset.
    #[inline]
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Get the raw file offset.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this is the null ref.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TopRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// SnapshotId / VersionSpec
// ---------------------------------------------------------------------------

/// Token naming a pinned snapshot: the version number plus the ring slot
/// index it was pinned at.
///
/// A `SnapshotId` may be handed to another thread and re-pinned there; the
/// pairing with the slot index lets the receiver find the slot without a
/// search, and lets a stale token be rejected (`BadVersion`) when the slot
/// has been recycled for a different version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotId {
    /// Monotonically increasing snapshot number.
    pub version: u64,
    /// Ring slot index the version was pinned at.
    pub index: u32,
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}@{}", self.version, self.index)
    }
}

/// Which snapshot a read transaction should bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionSpec {
    /// The newest published snapshot at pin time.
    #[default]
    Latest,
    /// A specific snapshot named by a previously obtained token.
    Exact(SnapshotId),
}

// ---------------------------------------------------------------------------
// Durability
// ---------------------------------------------------------------------------

/// Durability level of a session. Fixed at session creation; all
/// participants must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Durability {
    /// fsync on every commit.
    #[default]
    Full,
    /// No fsync; the database file is deleted when the last participant
    /// leaves.
    MemOnly,
    /// Daemon-mediated fsync (optional extension, not built here).
    Async,
}

impl Durability {
    /// Wire code stored in the session file.
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::Full => 0,
            Self::MemOnly => 1,
            Self::Async => 2,
        }
    }

    /// Parse a wire code; `None` for unknown values.
    #[must_use]
    pub const fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::Full),
            1 => Some(Self::MemOnly),
            2 => Some(Self::Async),
            _ => None,
        }
    }
}

impl fmt::Display for Durability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Full => "full",
            Self::MemOnly => "mem-only",
            Self::Async => "async",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// HistoryType
// ---------------------------------------------------------------------------

/// Kind of change history attached to a database file. Must match across
/// all session participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HistoryType {
    /// No history.
    #[default]
    None,
    /// History kept outside the database file.
    OutOfBand,
    /// History embedded in the database file.
    InFile,
    /// Synchronization history.
    Sync,
}

impl HistoryType {
    /// Wire code stored in the session file and the database header.
    #[must_use]
    pub const fn to_i8(self) -> i8 {
        match self {
            Self::None => 0,
            Self::OutOfBand => 1,
            Self::InFile => 2,
            Self::Sync => 3,
        }
    }

    /// Parse a wire code; `None` for unknown values.
    #[must_use]
    pub const fn from_i8(v: i8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::OutOfBand),
            2 => Some(Self::InFile),
            3 => Some(Self::Sync),
            _ => None,
        }
    }

    /// Whether a session requesting `self` may initiate on a file whose
    /// stored history type is `stored`.
    ///
    /// `file_is_empty` is true when the file holds no committed payload
    /// yet (null top ref); a Sync session may adopt such a file even
    /// though its stored history type is still `None`.
    #[must_use]
    pub const fn accepts_stored(self, stored: Self, file_is_empty: bool) -> bool {
        match self {
            Self::None | Self::OutOfBand => matches!(stored, Self::None),
            Self::InFile => matches!(stored, Self::None | Self::InFile),
            Self::Sync => match stored {
                Self::Sync => true,
                Self::None => file_is_empty,
                _ => false,
            },
        }
    }
}

impl fmt::Display for HistoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::None => "none",
            Self::OutOfBand => "out-of-band",
            Self::InFile => "in-file",
            Self::Sync => "sync",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// SessionOptions
// ---------------------------------------------------------------------------

/// Options for opening a session on a database file.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Durability level; must match across all session participants.
    pub durability: Durability,
    /// Whether a below-target file format may be upgraded at open.
    pub allow_file_format_upgrade: bool,
    /// Encryption key. When set, the session cannot be shared across
    /// processes (the session initiator's pid gates joiners).
    pub encryption_key: Option<Vec<u8>>,
    /// Directory for temporary files (compaction scratch). Defaults to
    /// `TMPDIR`, falling back to the system temp dir.
    pub temp_dir: PathBuf,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            durability: Durability::Full,
            allow_file_format_upgrade: true,
            encryption_key: None,
            temp_dir: sys_tmp_dir(),
        }
    }
}

/// The default temporary directory: `TMPDIR` if set, otherwise the
/// platform temp dir.
#[must_use]
pub fn sys_tmp_dir() -> PathBuf {
    std::env::var_os("TMPDIR")
        .map_or_else(std::env::temp_dir, PathBuf::from)
}

// ---------------------------------------------------------------------------
// AttachConfig
// ---------------------------------------------------------------------------

/// Configuration passed to a store when attaching the database file.
#[derive(Debug, Clone, Default)]
pub struct AttachConfig {
    /// This participant found the session empty and is bootstrapping it.
    pub session_initiator: bool,
    /// The file is shared with other participants.
    pub is_shared: bool,
    /// Open read-only.
    pub read_only: bool,
    /// Skip header validation (joiners trust the initiator's checks).
    pub skip_validate: bool,
    /// Fail if the file does not exist instead of creating it.
    pub no_create: bool,
    /// Truncate any existing content before use (stale mem-only files).
    pub clear_file: bool,
    /// Encryption key, if any.
    pub encryption_key: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_ref_null() {
        assert!(TopRef::NULL.is_null());
        assert!(TopRef::new(0).is_null());
        assert!(!TopRef::new(48).is_null());
        assert_eq!(TopRef::new(48).get(), 48);
    }

    #[test]
    fn durability_codes_roundtrip() {
        for d in [Durability::Full, Durability::MemOnly, Durability::Async] {
            assert_eq!(Durability::from_u16(d.to_u16()), Some(d));
        }
        assert_eq!(Durability::from_u16(7), None);
    }

    #[test]
    fn history_codes_roundtrip() {
        for h in [
            HistoryType::None,
            HistoryType::OutOfBand,
            HistoryType::InFile,
            HistoryType::Sync,
        ] {
            assert_eq!(HistoryType::from_i8(h.to_i8()), Some(h));
        }
        assert_eq!(HistoryType::from_i8(-1), None);
        assert_eq!(HistoryType::from_i8(4), None);
    }

    #[test]
    fn history_compatibility_matrix() {
        use HistoryType::{InFile, None as HNone, OutOfBand, Sync};

        // Requested None / OutOfBand: only a history-free file.
        for req in [HNone, OutOfBand] {
            assert!(req.accepts_stored(HNone, false));
            assert!(!req.accepts_stored(InFile, false));
            assert!(!req.accepts_stored(Sync, false));
        }

        // Requested InFile: history-free or in-file.
        assert!(InFile.accepts_stored(HNone, false));
        assert!(InFile.accepts_stored(InFile, false));
        assert!(!InFile.accepts_stored(Sync, false));

        // Requested Sync: sync, or history-free only when empty.
        assert!(Sync.accepts_stored(Sync, false));
        assert!(Sync.accepts_stored(HNone, true));
        assert!(!Sync.accepts_stored(HNone, false));
        assert!(!Sync.accepts_stored(InFile, true));
    }

    #[test]
    fn version_spec_default_is_latest() {
        assert_eq!(VersionSpec::default(), VersionSpec::Latest);
    }

    #[test]
    fn snapshot_id_display() {
        let id = SnapshotId {
            version: 17,
            index: 3,
        };
        assert_eq!(id.to_string(), "v17@3");
    }

    #[test]
    fn target_format_is_current() {
        assert_eq!(target_file_format_for_session(0), CURRENT_FILE_FORMAT);
        assert_eq!(target_file_format_for_session(7), CURRENT_FILE_FORMAT);
    }

    #[test]
    fn default_options() {
        let opts = SessionOptions::default();
        assert_eq!(opts.durability, Durability::Full);
        assert!(opts.allow_file_format_upgrade);
        assert!(opts.encryption_key.is_none());
        assert!(!opts.temp_dir.as_os_str().is_empty());
    }
}
