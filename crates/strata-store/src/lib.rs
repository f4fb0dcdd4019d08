//! Database-file collaborators of the Strata session coordinator.
//!
//! The coordinator consumes two seams: [`SnapshotStore`] (attach the
//! database file, serialize snapshots, compact) and [`HistoryHook`]
//! (change-history bookkeeping around the transaction lifecycle).
//! [`SlabStore`] is the default file-backed store used by the umbrella
//! crate and the test suites.

pub mod slab;
pub mod traits;

pub use slab::{SLAB_HEADER_SIZE, SlabStore};
pub use traits::{HistoryHook, SnapshotStore, SnapshotWriteOutcome};
