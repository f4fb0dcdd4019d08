//! The commit pipeline.
//!
//! Runs entirely under the write mutex. Step order is load-bearing:
//! everything that can fail without consequence (history trim,
//! snapshot serialization, the durable write) happens before the
//! critical-phase flag is raised; the flag covers exactly the window in
//! which the shared ring is being mutated. A writer that dies inside
//! that window leaves the flag set, and every later `begin_write`
//! fails fast until the session file is reinitialized.
//!
//! The cleanup in step 1 walks the ring through the shared mapping, so
//! a pin held by any participant — in this process or any other —
//! stops the reclaim horizon there.

use strata_error::{Result, StrataError};
use strata_store::{HistoryHook, SnapshotStore};
use strata_types::Durability;

use crate::layout::{self, offsets};
use crate::ring::RING_SEED_ENTRIES;
use crate::session::Session;

impl<S: SnapshotStore> Session<S> {
    pub(crate) fn low_level_commit(
        &mut self,
        new_version: u64,
        history: Option<&mut dyn HistoryHook>,
    ) -> Result<()> {
        // 1. Trim: recycle unpinned history and compute the reclaim
        //    horizon. The cleanup walk may touch the whole ring, so the
        //    local mapping is grown to cover it first.
        let oldest_version = {
            let att = self.att.as_mut().ok_or(StrataError::SessionClosed)?;
            let entries = att.ring.entries();
            att.ring
                .grow(&att.lock_file, entries.saturating_sub(1))?;
            att.ring.cleanup();
            att.ring.slot(att.ring.oldest_index()).version()
        };
        debug_assert!(oldest_version <= new_version);
        if let Some(h) = history {
            h.set_oldest_bound_version(oldest_version)?;
        }

        // 2. Serialize the working state as the new snapshot.
        let outcome = self.store.write_snapshot(new_version, oldest_version)?;

        // 3. Durable write. Mem-only sessions use the file purely as
        //    backing storage and never flush it.
        if self.options.durability == Durability::Full {
            self.store.sync_commit(outcome.top_ref)?;
        }

        let att = self.att.as_mut().ok_or(StrataError::SessionClosed)?;

        // 4. Enter the critical phase: from here until step 7 the ring
        //    is temporarily inconsistent.
        layout::write_u8_at(&att.lock_file, offsets::COMMIT_IN_CRITICAL_PHASE, 1)?;

        // 5. Grow the ring if every slot is live: preallocate the file,
        //    then extend and splice the shared ring in place.
        if att.ring.is_full() {
            let new_entries = att.ring.entries() + RING_SEED_ENTRIES;
            let required = layout::layout_size(new_entries);
            if att.lock_file.metadata()?.len() < required {
                att.lock_file.set_len(required)?;
            }
            att.ring.expand_to(&att.lock_file, new_entries)?;
            tracing::debug!(target: "strata.commit", entries = new_entries, "version ring grew");
        }

        // 6. Publish the new snapshot; the release-ordered stores make
        //    it visible to every mapped participant at once.
        att.ring
            .publish_next(new_version, outcome.top_ref.get(), outcome.file_size);

        // 7. Exit the critical phase.
        layout::write_u8_at(&att.lock_file, offsets::COMMIT_IN_CRITICAL_PHASE, 0)?;

        // 8. Aggregate counters and waiter broadcast.
        let number_of_versions = new_version - oldest_version + 1;
        att.control_mutex.with(|| {
            layout::write_u64_at(&att.lock_file, offsets::LATEST_VERSION, new_version)?;
            layout::write_u64_at(
                &att.lock_file,
                offsets::NUMBER_OF_VERSIONS,
                number_of_versions,
            )?;
            att.new_commit.notify_all();
            Ok(())
        })?;

        tracing::debug!(
            target: "strata.commit",
            version = new_version,
            oldest = oldest_version,
            top_ref = outcome.top_ref.get(),
            file_size = outcome.file_size,
            "published snapshot"
        );
        Ok(())
    }
}
