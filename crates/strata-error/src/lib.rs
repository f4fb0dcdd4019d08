use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for Strata session operations.
///
/// Variants fall into four groups: compatibility failures (fatal to the
/// open attempt, shared state untouched), protocol misuse (fatal logic
/// errors, no shared-state mutation), snapshot availability, and
/// transient conditions that open loops retry internally.
#[derive(Error, Debug)]
pub enum StrataError {
    // === Compatibility ===
    /// The session file was initialized by an incompatible build.
    #[error("incompatible session lock file: {detail}")]
    IncompatibleLockFile { detail: String },

    /// The database file is invalid or incompatible with the session.
    #[error("invalid database file '{path}': {detail}")]
    InvalidDatabase { path: PathBuf, detail: String },

    /// The file format is below the session target and upgrades are
    /// disallowed.
    #[error("database file format upgrade required")]
    FileFormatUpgradeRequired,

    /// An encrypted session cannot be shared across processes.
    #[error(
        "encrypted interprocess sharing is unsupported: session initiated \
         by pid {initiator_pid}, current pid is {current_pid}"
    )]
    EncryptedCrossProcess { initiator_pid: u64, current_pid: u64 },

    /// Async durability requires the commit daemon, which this build does
    /// not include.
    #[error("async durability is not supported by this build")]
    AsyncUnsupported,

    // === Protocol misuse ===
    /// Operation is illegal in the current transaction state.
    #[error("wrong transactional state")]
    WrongTransactState,

    /// Durability setting differs from the running session's.
    #[error("mixed durability: all session participants must agree")]
    MixedDurability,

    /// History type differs from the running session's.
    #[error("mixed history type: all session participants must agree")]
    MixedHistoryType,

    /// The session has been closed.
    #[error("session is closed")]
    SessionClosed,

    // === Snapshot availability ===
    /// The requested snapshot is no longer (or not yet) available.
    #[error("snapshot version is not available")]
    BadVersion,

    // === Unrecoverable runtime ===
    /// A writer died inside the commit critical phase; the shared state
    /// cannot be trusted until the session file is reinitialized.
    #[error("crash of other process detected, session restart required")]
    SessionBroken,

    // === Transient ===
    /// The open handshake lost a race and should be retried.
    #[error("session open must be retried")]
    Retry,

    // === External I/O ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StrataError {
    /// Create an [`StrataError::IncompatibleLockFile`].
    pub fn incompatible(detail: impl Into<String>) -> Self {
        Self::IncompatibleLockFile {
            detail: detail.into(),
        }
    }

    /// Create an [`StrataError::InvalidDatabase`].
    pub fn invalid_database(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::InvalidDatabase {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Whether the open loop may retry after this error.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Retry)
    }

    /// Whether this error left shared session state untouched.
    ///
    /// Compatibility and misuse errors never mutate the session file or
    /// the ring; I/O errors raised mid-commit may not (see the commit
    /// pipeline's critical-phase contract).
    #[must_use]
    pub const fn is_side_effect_free(&self) -> bool {
        !matches!(self, Self::Io(_) | Self::SessionBroken)
    }
}

/// Result type alias using [`StrataError`].
pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings() {
        assert_eq!(
            StrataError::SessionBroken.to_string(),
            "crash of other process detected, session restart required"
        );
        assert_eq!(
            StrataError::WrongTransactState.to_string(),
            "wrong transactional state"
        );
        assert_eq!(
            StrataError::incompatible("mutex size mismatch: 40 24").to_string(),
            "incompatible session lock file: mutex size mismatch: 40 24"
        );
    }

    #[test]
    fn transiency() {
        assert!(StrataError::Retry.is_transient());
        assert!(!StrataError::BadVersion.is_transient());
        assert!(!StrataError::SessionBroken.is_transient());
    }

    #[test]
    fn side_effect_classification() {
        assert!(StrataError::BadVersion.is_side_effect_free());
        assert!(StrataError::MixedDurability.is_side_effect_free());
        assert!(!StrataError::SessionBroken.is_side_effect_free());
        let io = StrataError::Io(std::io::Error::other("disk on fire"));
        assert!(!io.is_side_effect_free());
    }

    #[test]
    fn io_error_from() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: StrataError = io.into();
        assert!(matches!(err, StrataError::Io(_)));
    }

    #[test]
    fn invalid_database_fields() {
        let err = StrataError::invalid_database("/tmp/x.strata", "bad history");
        assert!(
            err.to_string().contains("/tmp/x.strata") && err.to_string().contains("bad history")
        );
    }
}
