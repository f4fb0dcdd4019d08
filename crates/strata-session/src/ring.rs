//! The nonblocking version ring buffer, in shared memory.
//!
//! A circular list of snapshot slots with a single producer (the
//! writer, serialized by the write mutex) and many concurrent readers.
//! Slots from `old_pos` through `put_pos` inclusive are live; slots
//! after `put_pos` up to (not including) `old_pos` are free and hold a
//! count of exactly 1 (the free bit). Cleanup starts at `old_pos` and
//! walks forward, atomically flipping zero-count slots to free; it
//! stops at the first pinned slot or at `put_pos`. Only write
//! transactions run cleanup, so freeing never races with allocation.
//!
//! The ring lives in the session file and is memory-mapped shared by
//! every participant, so a slot's packed counter is the same physical
//! atomic in every process: a pin taken anywhere is visible to the
//! writer's cleanup everywhere, with the acquire/release pairing of
//! [`crate::counters`] carrying the payload synchronization.
//!
//! Each participant holds a [`VersionRing`]: a private mapping of the
//! ring region covering `local_max_entry` slots. The mapping only ever
//! needs to grow; [`VersionRing::grow`] remaps when the shared entry
//! count has moved past the local view (the writer preallocates the
//! file before publishing a larger entry count, so a remap after an
//! acquire-load of `entries` always finds the bytes present).

use std::fs::File;
use std::sync::atomic::{AtomicU32, Ordering};

use strata_error::{Result, StrataError};

use crate::counters;
use crate::layout::{self, offsets};
use crate::shm::SharedMapping;

/// Initial ring capacity; also the growth increment.
pub const RING_SEED_ENTRIES: u32 = 32;

// ---------------------------------------------------------------------------
// SlotRef
// ---------------------------------------------------------------------------

/// A view of one ring slot inside the shared mapping.
///
/// The count field is the synchronization point for the payload fields:
/// a successful pin is an acquire, publishing a new entry release-clears
/// the free bit.
#[derive(Clone, Copy)]
pub struct SlotRef<'a> {
    map: &'a SharedMapping,
    base: u64,
}

impl SlotRef<'_> {
    /// Snapshot version held by this slot.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.map
            .atomic_u64(self.base + layout::SLOT_VERSION)
            .load(Ordering::Relaxed)
    }

    /// Logical database file size of the snapshot.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.map
            .atomic_u64(self.base + layout::SLOT_FILE_SIZE)
            .load(Ordering::Relaxed)
    }

    /// Root ref of the snapshot.
    #[must_use]
    pub fn top_ref(&self) -> u64 {
        self.map
            .atomic_u64(self.base + layout::SLOT_TOP_REF)
            .load(Ordering::Relaxed)
    }

    /// The packed `(readers << 1) | free` counter.
    #[must_use]
    pub fn count(&self) -> &AtomicU32 {
        self.map.atomic_u32(self.base + layout::SLOT_COUNT)
    }

    fn next(&self) -> u32 {
        self.map
            .atomic_u32(self.base + layout::SLOT_NEXT)
            .load(Ordering::Relaxed)
    }

    fn set_next(&self, next: u32) {
        self.map
            .atomic_u32(self.base + layout::SLOT_NEXT)
            .store(next, Ordering::Relaxed);
    }

    fn set_payload(&self, version: u64, top_ref: u64, file_size: u64) {
        self.map
            .atomic_u64(self.base + layout::SLOT_VERSION)
            .store(version, Ordering::Relaxed);
        self.map
            .atomic_u64(self.base + layout::SLOT_TOP_REF)
            .store(top_ref, Ordering::Relaxed);
        self.map
            .atomic_u64(self.base + layout::SLOT_FILE_SIZE)
            .store(file_size, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// VersionRing
// ---------------------------------------------------------------------------

/// A participant's mapping of the shared version ring.
///
/// All instances over one session file address the same memory; this
/// struct only carries the local view bounds.
pub struct VersionRing {
    map: SharedMapping,
    local_max_entry: u32,
}

impl VersionRing {
    /// Map the ring region of an initialized session file.
    pub(crate) fn map(file: &File) -> Result<Self> {
        let entries = layout::read_u32_at(file, offsets::RING_ENTRIES)?;
        if entries == 0 || entries % RING_SEED_ENTRIES != 0 {
            return Err(StrataError::incompatible("malformed ring entry count"));
        }
        let len = layout::layout_size(entries);
        if file.metadata()?.len() < len {
            return Err(StrataError::incompatible("session file shorter than its ring"));
        }
        let map = SharedMapping::map(file, len)?;
        Ok(Self {
            map,
            local_max_entry: entries,
        })
    }

    fn entries_atomic(&self) -> &AtomicU32 {
        self.map.atomic_u32(offsets::RING_ENTRIES)
    }

    fn put_pos(&self) -> &AtomicU32 {
        self.map.atomic_u32(offsets::RING_PUT_POS)
    }

    fn old_pos(&self) -> &AtomicU32 {
        self.map.atomic_u32(offsets::RING_OLD_POS)
    }

    /// Current entry count of the shared ring (may exceed the local
    /// view; grow before indexing that far).
    #[must_use]
    pub fn entries(&self) -> u32 {
        self.entries_atomic().load(Ordering::Acquire)
    }

    /// Number of entries the local mapping covers.
    #[must_use]
    pub fn local_max_entry(&self) -> u32 {
        self.local_max_entry
    }

    /// Index of the newest published slot.
    #[must_use]
    pub fn last(&self) -> u32 {
        self.put_pos().load(Ordering::Acquire)
    }

    /// Index of the oldest live slot.
    #[must_use]
    pub fn oldest_index(&self) -> u32 {
        self.old_pos().load(Ordering::Relaxed)
    }

    /// The slot at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is beyond the local mapping; grow first.
    #[must_use]
    pub fn slot(&self, index: u32) -> SlotRef<'_> {
        assert!(
            index < self.local_max_entry,
            "ring slot {index} beyond local mapping"
        );
        SlotRef {
            map: &self.map,
            base: layout::slot_offset(index),
        }
    }

    /// Extend the local mapping to cover `index` if the shared ring has
    /// grown past it.
    ///
    /// Returns `true` only if the mapping was actually extended;
    /// callers on the pin path retry from scratch after a remap. An
    /// index beyond the shared ring leaves the mapping unchanged and
    /// returns `false`, so lookup loops terminate on garbage tokens.
    pub fn grow(&mut self, file: &File, index: u32) -> Result<bool> {
        if index < self.local_max_entry {
            return Ok(false);
        }
        let before = self.local_max_entry;
        let entries = self.entries();
        if entries != before {
            self.map = SharedMapping::map(file, layout::layout_size(entries))?;
            self.local_max_entry = entries;
        }
        Ok(self.local_max_entry != before)
    }

    /// Index the next publish will use. Do not call when full.
    #[must_use]
    pub fn next_index(&self) -> u32 {
        self.slot(self.last()).next()
    }

    /// Whether all slots are live.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.next_index() == self.old_pos().load(Ordering::Relaxed)
    }

    /// Re-seed the newest slot in place. Writer only, and only while
    /// the caller is provably the sole participant (session bootstrap
    /// under the control mutex).
    pub fn reinit_last(&self, version: u64, top_ref: u64, file_size: u64) {
        let slot = self.slot(self.last());
        slot.set_payload(version, top_ref, file_size);
        slot.count().store(0, Ordering::Relaxed);
    }

    /// Publish a new snapshot into the next slot. Writer only; the ring
    /// must not be full.
    ///
    /// Payload is written first; release-clearing the free bit and the
    /// release-store of `put_pos` make it visible to readers in that
    /// order.
    pub fn publish_next(&self, version: u64, top_ref: u64, file_size: u64) {
        let idx = self.next_index();
        let slot = self.slot(idx);
        slot.set_payload(version, top_ref, file_size);
        counters::dec_release(slot.count());
        self.put_pos().store(idx, Ordering::Release);
    }

    /// Recycle trailing slots with no readers. Writer only.
    ///
    /// Reader counts live in the shared mapping, so pins taken by any
    /// process stop the walk here.
    pub fn cleanup(&self) {
        // The loop stops before put_pos, so the current snapshot is
        // never recycled.
        while self.old_pos().load(Ordering::Relaxed) != self.put_pos().load(Ordering::Relaxed) {
            let slot = self.slot(self.old_pos().load(Ordering::Relaxed));
            if !counters::one_if_zero(slot.count()) {
                break;
            }
            self.old_pos().store(slot.next(), Ordering::Relaxed);
        }
    }

    /// Grow the shared ring to `new_entries`, splicing the new free
    /// slots between the current `put_pos` and `old_pos`. Writer only;
    /// the caller must have extended the file to cover the new size
    /// beforehand.
    pub fn expand_to(&mut self, file: &File, new_entries: u32) -> Result<()> {
        let entries = self.entries();
        debug_assert!(new_entries > entries && new_entries % RING_SEED_ENTRIES == 0);

        self.map = SharedMapping::map(file, layout::layout_size(new_entries))?;
        self.local_max_entry = new_entries;

        for i in entries..new_entries {
            let slot = self.slot(i);
            slot.set_payload(1, 0, 0);
            slot.count().store(1, Ordering::Relaxed);
            slot.set_next(i + 1);
        }
        self.slot(new_entries - 1)
            .set_next(self.old_pos().load(Ordering::Relaxed));
        self.slot(self.put_pos().load(Ordering::Relaxed))
            .set_next(entries);
        // Published last: any participant that observes the new count
        // finds the file already sized and the new chain initialized.
        self.entries_atomic().store(new_entries, Ordering::Release);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Seed image
// ---------------------------------------------------------------------------

/// Byte image of a freshly seeded ring region: 32 slots chained
/// circularly, slot 0 the live seed snapshot (version 1, null top
/// ref), all others free.
#[must_use]
pub(crate) fn seed_image() -> Vec<u8> {
    let header = (offsets::RING_SLOTS - offsets::RING_ENTRIES) as usize;
    let stride = layout::SLOT_STRIDE_BYTES as usize;
    let mut buf = vec![0u8; header + RING_SEED_ENTRIES as usize * stride];

    buf[0..4].copy_from_slice(&RING_SEED_ENTRIES.to_le_bytes());
    // put_pos and old_pos start at slot 0 (already zero).

    for i in 0..RING_SEED_ENTRIES {
        let at = header + i as usize * stride;
        buf[at..at + 8].copy_from_slice(&1u64.to_le_bytes()); // version
        let count: u32 = if i == 0 { 0 } else { 1 };
        buf[at + layout::SLOT_COUNT as usize..at + layout::SLOT_COUNT as usize + 4]
            .copy_from_slice(&count.to_le_bytes());
        let next = if i == RING_SEED_ENTRIES - 1 { 0 } else { i + 1 };
        buf[at + layout::SLOT_NEXT as usize..at + layout::SLOT_NEXT as usize + 4]
            .copy_from_slice(&next.to_le_bytes());
    }
    buf
}
