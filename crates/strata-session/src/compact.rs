//! Compaction: rewrite the database file with only live data.
//!
//! Only possible when this participant is alone in the session; the
//! check and the rewrite happen under the control mutex so no joiner
//! can slip in mid-rewrite. Afterwards the participant closes and
//! re-opens the session against the new file, so the ring is reseeded
//! from the compacted snapshot.

use std::fs;
use std::path::Path;

use strata_error::{Result, StrataError};
use strata_store::SnapshotStore;
use strata_types::VersionSpec;

use crate::layout::{self, offsets};
use crate::session::{Session, suffixed};
use crate::transact::TransactStage;

impl<S: SnapshotStore> Session<S> {
    /// Compact the database file.
    ///
    /// Returns `Ok(false)` without side effects when other participants
    /// are present. On success the session has been re-opened against
    /// the compacted file.
    pub fn compact(&mut self) -> Result<bool> {
        if self.att.is_none() {
            return Err(StrataError::SessionClosed);
        }
        if self.stage != TransactStage::Ready {
            return Err(StrataError::WrongTransactState);
        }
        let tmp_path = suffixed(&self.db_path, ".tmp_compaction_space");

        self.attachment()?.control_mutex.lock()?;
        let rewritten = self.rewrite_alone(&tmp_path);
        if let Ok(att) = self.attachment() {
            att.control_mutex.unlock();
        }
        if !rewritten? {
            return Ok(false);
        }

        // Drop every hold on the stale file, then rejoin against the
        // compacted one.
        self.close()?;
        self.do_open()?;
        tracing::debug!(
            target: "strata.session",
            path = %self.db_path.display(),
            "compacted database file"
        );
        Ok(true)
    }

    /// The rewrite step, under the control mutex.
    fn rewrite_alone(&mut self, tmp_path: &Path) -> Result<bool> {
        let att = self.attachment()?;
        let participants = layout::read_u32_at(&att.lock_file, offsets::NUM_PARTICIPANTS)?;
        if participants > 1 {
            return Ok(false);
        }

        // A previous compaction may have died and left its scratch
        // file behind.
        let _ = fs::remove_file(tmp_path);

        // Reading the latest snapshot pins it, so its data cannot be
        // reclaimed while the new file is written.
        self.begin_read(VersionSpec::Latest)?;
        let version = self.read_lock.version();
        let rewrite = self
            .store
            .write_compacted(tmp_path, version)
            .and_then(|()| fs::rename(tmp_path, &self.db_path).map_err(StrataError::Io));
        let ended = self.end_read();
        rewrite?;
        ended?;

        // The mappings of the stale file must be gone before anyone
        // attaches the new one.
        self.store.detach();
        Ok(true)
    }
}
