//! Reader pins: grab, release, and local-mapping growth.
//!
//! A pin guards access to a ring slot's `{version, top_ref, file_size}`
//! and keeps the underlying database pages for that version alive. The
//! fast path is a single `fetch_add` on the slot's packed counter in
//! the shared mapping — visible to every process at once — and all
//! contention handling is optimistic retry.

use strata_error::{Result, StrataError};
use strata_types::{SnapshotId, TopRef, VersionSpec};

use crate::counters;
use crate::ring::VersionRing;

/// A held (or previously held) read lock.
///
/// The struct outlives the pin itself: after release it keeps recording
/// the version the session last observed, which backs change tracking.
#[derive(Debug, Clone, Copy)]
pub struct ReadLockInfo {
    version: u64,
    index: u32,
    top_ref: TopRef,
    file_size: u64,
}

impl ReadLockInfo {
    /// A lock record that tracks `version` without holding a pin.
    pub(crate) fn unbound_at(version: u64) -> Self {
        Self {
            version,
            index: 0,
            top_ref: TopRef::NULL,
            file_size: 0,
        }
    }

    pub(crate) fn for_index(id: SnapshotId) -> Self {
        Self {
            version: id.version,
            index: id.index,
            top_ref: TopRef::NULL,
            file_size: 0,
        }
    }

    /// Pinned snapshot version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Ring slot index of the pin.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Root ref of the pinned snapshot.
    #[must_use]
    pub fn top_ref(&self) -> TopRef {
        self.top_ref
    }

    /// Logical database file size of the pinned snapshot.
    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Handover token for this pin.
    #[must_use]
    pub fn snapshot_id(&self) -> SnapshotId {
        SnapshotId {
            version: self.version,
            index: self.index,
        }
    }
}

impl VersionRing {
    /// Pin a snapshot per `spec`, filling `out` on success.
    ///
    /// The LATEST loop retries on both cleanup races and local-mapping
    /// growth; the exact-version loop distinguishes "being probed by
    /// cleanup" (slot is the oldest: retry) from "recycled"
    /// (`BadVersion`).
    pub(crate) fn grab_read_lock(
        &mut self,
        file: &std::fs::File,
        out: &mut ReadLockInfo,
        spec: VersionSpec,
    ) -> Result<()> {
        match spec {
            VersionSpec::Latest => loop {
                let index = self.last();
                if self.grow(file, index)? {
                    // Remapping takes time; retry with a fresh index.
                    continue;
                }
                let slot = self.slot(index);
                if !counters::double_inc_if_even(slot.count()) {
                    // Recycled between the put_pos load and the pin.
                    continue;
                }
                *out = ReadLockInfo {
                    version: slot.version(),
                    index,
                    top_ref: TopRef::new(slot.top_ref()),
                    file_size: slot.file_size(),
                };
                return Ok(());
            },
            VersionSpec::Exact(id) => loop {
                let index = id.index;
                if self.grow(file, index)? {
                    continue;
                }
                if index >= self.local_max_entry() {
                    // The token never named a slot of this ring.
                    return Err(StrataError::BadVersion);
                }
                let slot = self.slot(index);
                while !counters::double_inc_if_even(slot.count()) {
                    // The pin failed either because cleanup is probing
                    // the slot (it is the oldest: retry until the probe
                    // backs off) or because the slot was recycled.
                    if self.oldest_index() != index {
                        return Err(StrataError::BadVersion);
                    }
                }
                if slot.version() != id.version {
                    counters::double_dec(slot.count());
                    return Err(StrataError::BadVersion);
                }
                *out = ReadLockInfo {
                    version: slot.version(),
                    index,
                    top_ref: TopRef::new(slot.top_ref()),
                    file_size: slot.file_size(),
                };
                return Ok(());
            },
        }
    }

    /// Release a pin.
    ///
    /// The lock may have been produced by a participant with a larger
    /// ring, so the local mapping is grown to cover the index first.
    pub(crate) fn release_read_lock(
        &mut self,
        file: &std::fs::File,
        lock: &ReadLockInfo,
    ) -> Result<()> {
        self.grow(file, lock.index)?;
        if lock.index >= self.local_max_entry() {
            // The token never named a slot of this ring.
            return Err(StrataError::BadVersion);
        }
        counters::double_dec(self.slot(lock.index).count());
        Ok(())
    }

    /// Lock-free read of the newest published version.
    ///
    /// Cleanup may recycle the slot under our feet, so the version is
    /// read under a transient pin.
    pub(crate) fn latest_snapshot_version(&mut self, file: &std::fs::File) -> Result<u64> {
        loop {
            let index = self.last();
            if self.grow(file, index)? {
                continue;
            }
            let slot = self.slot(index);
            if !counters::double_inc_if_even(slot.count()) {
                continue;
            }
            let version = slot.version();
            counters::double_dec(slot.count());
            return Ok(version);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::os::unix::fs::FileExt;
    use std::sync::atomic::Ordering;

    use strata_types::{Durability, HistoryType};

    use super::*;
    use crate::layout;

    fn pinned_fixture() -> (tempfile::TempDir, File, VersionRing) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pins.lock");
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .expect("create fixture file");
        let image = layout::initial_image(Durability::Full, HistoryType::None);
        file.write_all_at(&image, 0).expect("write image");
        let ring = VersionRing::map(&file).expect("map ring");
        ring.reinit_last(1, 0, 48);
        (dir, file, ring)
    }

    #[test]
    fn grab_latest_returns_seed_snapshot() {
        let (_dir, file, mut ring) = pinned_fixture();
        let mut lock = ReadLockInfo::unbound_at(0);
        ring.grab_read_lock(&file, &mut lock, VersionSpec::Latest)
            .unwrap();
        assert_eq!(lock.version(), 1);
        assert_eq!(lock.index(), 0);
        assert!(lock.top_ref().is_null());
        assert_eq!(lock.file_size(), 48);
        ring.release_read_lock(&file, &lock).unwrap();
        assert_eq!(
            ring.slot(0).count().load(Ordering::Relaxed),
            0,
            "balanced pin must restore the counter"
        );
    }

    #[test]
    fn grab_exact_rejects_recycled_slot() {
        let (_dir, file, mut ring) = pinned_fixture();

        // Publish a few versions, pinning none, then recycle.
        for v in 2..=6 {
            ring.publish_next(v, 0, 0);
        }
        ring.cleanup();

        // A stale token for version 2 at slot 1.
        let stale = SnapshotId {
            version: 2,
            index: 1,
        };
        let mut lock = ReadLockInfo::unbound_at(0);
        assert!(matches!(
            ring.grab_read_lock(&file, &mut lock, VersionSpec::Exact(stale)),
            Err(StrataError::BadVersion)
        ));
        // No leaked pin.
        assert_eq!(
            ring.slot(1).count().load(Ordering::Relaxed),
            1,
            "slot must stay free after a rejected pin"
        );
    }

    #[test]
    fn grab_exact_rejects_version_mismatch_on_live_slot() {
        let (_dir, file, mut ring) = pinned_fixture();
        ring.publish_next(2, 0, 0);

        // Slot 1 is live but holds version 2, not 9.
        let wrong = SnapshotId {
            version: 9,
            index: 1,
        };
        let mut lock = ReadLockInfo::unbound_at(0);
        assert!(matches!(
            ring.grab_read_lock(&file, &mut lock, VersionSpec::Exact(wrong)),
            Err(StrataError::BadVersion)
        ));
        assert_eq!(
            ring.slot(1).count().load(Ordering::Relaxed),
            0,
            "mismatch release must balance the pin"
        );
    }

    #[test]
    fn grab_exact_out_of_range_index() {
        let (_dir, file, mut ring) = pinned_fixture();
        let bogus = SnapshotId {
            version: 1,
            index: 10_000,
        };
        let mut lock = ReadLockInfo::unbound_at(0);
        assert!(matches!(
            ring.grab_read_lock(&file, &mut lock, VersionSpec::Exact(bogus)),
            Err(StrataError::BadVersion)
        ));
    }

    #[test]
    fn latest_version_probe_leaves_no_pin() {
        let (_dir, file, mut ring) = pinned_fixture();
        for v in 2..=4 {
            ring.publish_next(v, 0, 0);
        }
        assert_eq!(ring.latest_snapshot_version(&file).unwrap(), 4);
        let last = ring.last();
        assert_eq!(ring.slot(last).count().load(Ordering::Relaxed), 0);
    }

    #[test]
    fn pin_blocks_cleanup_until_release() {
        let (_dir, file, mut ring) = pinned_fixture();

        let mut lock = ReadLockInfo::unbound_at(0);
        ring.grab_read_lock(&file, &mut lock, VersionSpec::Latest)
            .unwrap();

        for v in 2..=5 {
            ring.publish_next(v, 0, 0);
        }
        ring.cleanup();
        assert_eq!(
            ring.slot(ring.oldest_index()).version(),
            1,
            "pinned version must survive cleanup"
        );

        ring.release_read_lock(&file, &lock).unwrap();
        ring.cleanup();
        assert_eq!(ring.slot(ring.oldest_index()).version(), 5);
    }

    #[test]
    fn foreign_mapping_pin_visible_to_cleanup() {
        // A pin taken through a different mapping of the same file (a
        // stand-in for another process) must hold the writer's reclaim
        // horizon.
        let (_dir, file, writer_ring) = pinned_fixture();
        let mut foreign = VersionRing::map(&file).unwrap();

        let mut lock = ReadLockInfo::unbound_at(0);
        foreign
            .grab_read_lock(&file, &mut lock, VersionSpec::Latest)
            .unwrap();
        assert_eq!(lock.version(), 1);

        for v in 2..=5 {
            writer_ring.publish_next(v, 0, 0);
        }
        writer_ring.cleanup();
        assert_eq!(
            writer_ring.slot(writer_ring.oldest_index()).version(),
            1,
            "foreign pin must hold the horizon"
        );

        foreign.release_read_lock(&file, &lock).unwrap();
        writer_ring.cleanup();
        assert_eq!(writer_ring.slot(writer_ring.oldest_index()).version(), 5);
    }
}
