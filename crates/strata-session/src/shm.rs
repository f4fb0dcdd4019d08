//! Shared mapping of the session file.
//!
//! The session file is mmap'd shared by every participant, so the ring
//! slot counters are the same physical atomics in every process that
//! opens the database — cross-process pins and recycling coordinate
//! through real atomic instructions, not through file I/O.
//!
//! This is the one module in the workspace that touches raw memory.
//! The safety argument rests on three protocol invariants:
//!
//! - A mapping is only created over a file region the caller has
//!   already sized (`set_len` before map), and all accessor offsets
//!   are bounds-checked against the mapped length.
//! - The session file is truncated only under an exclusive file lock,
//!   which cannot be acquired while any participant holds its shared
//!   lock — and every participant's mapping lives inside the same
//!   attachment as its shared lock, so no live mapping can see the
//!   backing pages disappear.
//! - Every access to mapped bytes goes through `AtomicU32`/`AtomicU64`
//!   references at naturally aligned offsets (the mapping base is page
//!   aligned), so concurrent access from other threads and processes
//!   is never a data race.
#![allow(unsafe_code)]

use std::fs::File;
use std::sync::atomic::{AtomicU32, AtomicU64};

use memmap2::{MmapOptions, MmapRaw};
use strata_error::Result;

/// A shared, fixed-length mapping of the session file.
///
/// Participants remap (create a new `SharedMapping`) when the ring
/// grows past the region they have mapped; the old mapping is dropped
/// only once no borrows into it remain, which the borrow checker
/// enforces because every accessor ties its result to `&self`.
#[derive(Debug)]
pub(crate) struct SharedMapping {
    raw: MmapRaw,
}

impl SharedMapping {
    /// Map the first `len` bytes of `file` shared.
    ///
    /// The file must already be at least `len` bytes long.
    pub fn map(file: &File, len: u64) -> Result<Self> {
        let len = usize::try_from(len).expect("mapping length fits in usize");
        let raw = MmapOptions::new().len(len).map_raw(file)?;
        Ok(Self { raw })
    }

    /// Length of the mapped region in bytes.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// The shared `u32` at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the offset is out of bounds or not 4-byte aligned.
    pub fn atomic_u32(&self, offset: u64) -> &AtomicU32 {
        let offset = usize::try_from(offset).expect("offset fits in usize");
        assert!(offset + 4 <= self.raw.len(), "u32 at {offset} out of bounds");
        assert_eq!(offset % 4, 0, "u32 at {offset} misaligned");
        // SAFETY: in bounds and aligned (checked above; the mapping
        // base is page aligned), the mapping outlives the borrow, and
        // all concurrent access to this location is atomic.
        unsafe { &*self.raw.as_mut_ptr().add(offset).cast::<AtomicU32>() }
    }

    /// The shared `u64` at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the offset is out of bounds or not 8-byte aligned.
    pub fn atomic_u64(&self, offset: u64) -> &AtomicU64 {
        let offset = usize::try_from(offset).expect("offset fits in usize");
        assert!(offset + 8 <= self.raw.len(), "u64 at {offset} out of bounds");
        assert_eq!(offset % 8, 0, "u64 at {offset} misaligned");
        // SAFETY: as for `atomic_u32`.
        unsafe { &*self.raw.as_mut_ptr().add(offset).cast::<AtomicU64>() }
    }
}
