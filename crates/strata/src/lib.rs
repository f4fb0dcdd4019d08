//! Strata: shared-session MVCC coordination for embedded database
//! files.
//!
//! Open a [`Session`] on a database path and any number of other
//! sessions — in this process or others — may open the same path
//! concurrently. Readers bind immutable snapshots; one writer at a
//! time publishes new ones:
//!
//! ```no_run
//! use strata::{Session, SessionOptions, VersionSpec};
//!
//! # fn main() -> strata::Result<()> {
//! let mut session = Session::open("/data/app.strata", SessionOptions::default())?;
//!
//! session.begin_write()?;
//! session.store_mut().stage(b"change set");
//! let v2 = session.commit()?;
//!
//! session.begin_read(VersionSpec::Latest)?;
//! assert_eq!(session.pinned_snapshot().unwrap().version(), v2);
//! session.end_read()?;
//! # Ok(())
//! # }
//! ```

pub use strata_error::{Result, StrataError};
pub use strata_session::{
    ChangeNotifier, ReadLockInfo, Session, TransactStage, layout, ring,
};
pub use strata_store::{
    HistoryHook, SlabStore, SnapshotStore, SnapshotWriteOutcome,
};
pub use strata_types::{
    AttachConfig, CURRENT_FILE_FORMAT, Durability, HistoryType, SessionOptions, SnapshotId,
    TopRef, VersionSpec,
};
