//! Multi-process MVCC session coordination for a shared database file.
//!
//! Many independent participants (threads or processes) share one
//! database file, observe consistent snapshots, and commit new
//! snapshots without corrupting one another. Coordination state lives
//! in the transient `<db>.lock` session file, recreated at the start of
//! each session and torn down when the last participant leaves.
//!
//! The heart of the design is the version ring ([`ring`]): a bounded
//! circular list of snapshot descriptors whose packed per-slot counters
//! ([`counters`]) let readers pin snapshots lock-free while a single
//! serialized writer publishes new versions and recycles old ones.
//! Under contention these counter operations are where nearly all of a
//! read transaction's begin/end time goes, so they are built as
//! optimistic fetch-add/undo pairs rather than anything heavier.
//!
//! The ring lives inside the session file and is memory-mapped shared
//! by every participant (the `shm` module), so a reader pin taken in
//! one process is the same physical atomic the writer's cleanup
//! inspects in another.
//!
//! Around the ring sit the session open/join/close protocol
//! ([`session`]), the reader pin manager ([`readlock`]), the
//! Ready/Reading/Writing transaction machine ([`transact`]), the commit
//! pipeline ([`commit`]), change notification ([`notify`]), and
//! compaction ([`compact`]). The on-file layout is in [`layout`]; the
//! interprocess lock primitives in [`ipc`].

pub mod counters;
pub mod ipc;
pub mod layout;
pub mod notify;
pub mod readlock;
pub mod ring;
pub mod session;
pub mod transact;

mod commit;
mod compact;
mod shm;

pub use notify::ChangeNotifier;
pub use readlock::ReadLockInfo;
pub use ring::{RING_SEED_ENTRIES, SlotRef, VersionRing};
pub use session::Session;
pub use transact::TransactStage;
