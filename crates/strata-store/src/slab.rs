//! `SlabStore`: the default file-backed snapshot store.
//!
//! The slab file is a 48-byte header followed by append-only snapshot
//! records. Each record is `{version: u64, payload_len: u64, payload}`;
//! the header names the newest durable record by its file offset (the
//! top ref). All integers are little-endian at fixed offsets:
//!
//! ```text
//! Offset  Size  Field
//!   0       8   magic "STRSLAB\0"
//!   8       1   file_format_version (0 = not yet decided)
//!   9       1   history_type
//!  10       6   reserved
//!  16       8   version of newest snapshot
//!  24       8   top_ref (offset of newest record; 0 = none)
//!  32       8   logical file size
//!  40       8   reserved
//! ```

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use strata_error::{Result, StrataError};
use strata_types::{AttachConfig, HistoryType, TopRef};

use crate::traits::{SnapshotStore, SnapshotWriteOutcome};

/// Magic bytes identifying a slab file.
const MAGIC: [u8; 8] = *b"STRSLAB\0";

/// Header size in bytes; also the offset of the first snapshot record.
pub const SLAB_HEADER_SIZE: u64 = 48;

/// Per-record header: version + payload length.
const RECORD_HEADER_SIZE: u64 = 16;

mod offsets {
    pub const MAGIC: u64 = 0;
    pub const FILE_FORMAT: u64 = 8;
    pub const HISTORY_TYPE: u64 = 9;
    pub const VERSION: u64 = 16;
    pub const TOP_REF: u64 = 24;
    pub const FILE_SIZE: u64 = 32;
}

/// A snapshot accessor bound by `bind_snapshot`.
#[derive(Debug, Clone, Copy)]
struct Binding {
    top_ref: TopRef,
    file_size: u64,
    writable: bool,
}

/// File-backed snapshot store with an append-only record log.
///
/// The working state of a write transaction is a staged payload buffer;
/// `write_snapshot` appends it as one record and rolls the header
/// forward. Space recycling below the reclaim floor is left to
/// compaction.
#[derive(Debug, Default)]
pub struct SlabStore {
    file: Option<File>,
    path: PathBuf,
    version: u64,
    top_ref: TopRef,
    file_size: u64,
    file_format: u8,
    history_type: HistoryType,
    binding: Option<Binding>,
    pending: Vec<u8>,
    reclaim_floor: u64,
}

impl SlabStore {
    /// Create a detached store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage payload bytes for the next snapshot write.
    pub fn stage(&mut self, payload: &[u8]) {
        self.pending.extend_from_slice(payload);
    }

    /// Payload of the bound snapshot, or an empty buffer for the null
    /// top ref.
    pub fn bound_payload(&self) -> Result<Vec<u8>> {
        let binding = self.binding.ok_or(StrataError::WrongTransactState)?;
        if binding.top_ref.is_null() {
            return Ok(Vec::new());
        }
        let file = self.file()?;
        let mut header = [0u8; 16];
        file.read_exact_at(&mut header, binding.top_ref.get())?;
        let len = u64::from_le_bytes(header[8..16].try_into().expect("8-byte slice"));
        let mut payload = vec![0u8; usize::try_from(len).expect("payload fits in memory")];
        file.read_exact_at(&mut payload, binding.top_ref.get() + RECORD_HEADER_SIZE)?;
        Ok(payload)
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or(StrataError::SessionClosed)
    }

    fn write_header(&self) -> Result<()> {
        let file = self.file()?;
        let mut buf = [0u8; SLAB_HEADER_SIZE as usize];
        buf[..8].copy_from_slice(&MAGIC);
        buf[offsets::FILE_FORMAT as usize] = self.file_format;
        buf[offsets::HISTORY_TYPE as usize] = self.history_type.to_i8().to_le_bytes()[0];
        buf[16..24].copy_from_slice(&self.version.to_le_bytes());
        buf[24..32].copy_from_slice(&self.top_ref.get().to_le_bytes());
        buf[32..40].copy_from_slice(&self.file_size.to_le_bytes());
        file.write_all_at(&buf, offsets::MAGIC)?;
        Ok(())
    }

    fn read_header(&mut self) -> Result<()> {
        let file = self.file()?;
        let mut buf = [0u8; SLAB_HEADER_SIZE as usize];
        file.read_exact_at(&mut buf, 0)?;
        self.file_format = buf[offsets::FILE_FORMAT as usize];
        self.history_type = HistoryType::from_i8(i8::from_le_bytes([buf[offsets::HISTORY_TYPE as usize]]))
            .ok_or_else(|| {
                StrataError::invalid_database(&self.path, "unknown stored history type")
            })?;
        self.version = u64::from_le_bytes(buf[16..24].try_into().expect("8-byte slice"));
        self.top_ref = TopRef::new(u64::from_le_bytes(
            buf[24..32].try_into().expect("8-byte slice"),
        ));
        self.file_size = u64::from_le_bytes(buf[32..40].try_into().expect("8-byte slice"));
        Ok(())
    }
}

impl SnapshotStore for SlabStore {
    fn attach(&mut self, path: &Path, cfg: &AttachConfig) -> Result<TopRef> {
        assert!(self.file.is_none(), "store is already attached");

        let file = match OpenOptions::new()
            .read(true)
            .write(!cfg.read_only)
            .create(!cfg.no_create && !cfg.read_only)
            .open(path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StrataError::invalid_database(
                    path,
                    "database file does not exist",
                ));
            }
            Err(e) => return Err(StrataError::Io(e)),
        };

        self.file = Some(file);
        self.path = path.to_path_buf();

        if cfg.clear_file {
            self.file()?.set_len(0)?;
        }

        let on_disk = self.file()?.metadata()?.len();
        if on_disk == 0 {
            // Fresh file: a single empty seed snapshot at version 1.
            self.version = 1;
            self.top_ref = TopRef::NULL;
            self.file_size = SLAB_HEADER_SIZE;
            self.file_format = 0;
            self.history_type = HistoryType::None;
            if cfg.read_only {
                self.file = None;
                return Err(StrataError::invalid_database(
                    path,
                    "cannot initialize a database read-only",
                ));
            }
            self.write_header()?;
            tracing::debug!(target: "strata.store", path = %path.display(), "created slab file");
        } else {
            if on_disk < SLAB_HEADER_SIZE {
                self.file = None;
                // For a joiner, a short file means the session
                // initiator is still writing the header; the open
                // handshake restarts and finds it complete (or becomes
                // the initiator itself). The initiator has nobody to
                // wait for, so for it the file is simply corrupt.
                return Err(if cfg.session_initiator {
                    StrataError::invalid_database(path, "file shorter than header")
                } else {
                    StrataError::Retry
                });
            }
            if !cfg.skip_validate {
                let mut magic = [0u8; 8];
                self.file()?.read_exact_at(&mut magic, 0)?;
                if magic != MAGIC {
                    self.file = None;
                    return Err(StrataError::invalid_database(path, "bad magic"));
                }
            }
            self.read_header()?;
            tracing::debug!(
                target: "strata.store",
                path = %path.display(),
                version = self.version,
                top_ref = self.top_ref.get(),
                "attached slab file"
            );
        }

        self.reclaim_floor = 0;
        Ok(self.top_ref)
    }

    fn detach(&mut self) {
        self.file = None;
        self.binding = None;
        self.pending.clear();
    }

    fn is_attached(&self) -> bool {
        self.file.is_some()
    }

    fn baseline(&self) -> u64 {
        self.file_size
    }

    fn stored_version_and_history(&self) -> Result<(u64, HistoryType)> {
        Ok((self.version, self.history_type))
    }

    fn set_history_type(&mut self, history: HistoryType) -> Result<()> {
        self.history_type = history;
        let file = self.file()?;
        file.write_all_at(&history.to_i8().to_le_bytes(), offsets::HISTORY_TYPE)?;
        Ok(())
    }

    fn file_format_version(&self) -> u8 {
        self.file_format
    }

    fn set_file_format_version(&mut self, version: u8) {
        self.file_format = version;
    }

    fn committed_file_format_version(&self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.file()?.read_exact_at(&mut byte, offsets::FILE_FORMAT)?;
        Ok(byte[0])
    }

    fn bind_snapshot(&mut self, top_ref: TopRef, file_size: u64, writable: bool) -> Result<()> {
        if !top_ref.is_null() && top_ref.get() + RECORD_HEADER_SIZE > file_size {
            return Err(StrataError::invalid_database(
                &self.path,
                "top ref beyond snapshot bounds",
            ));
        }
        self.binding = Some(Binding {
            top_ref,
            file_size,
            writable,
        });
        Ok(())
    }

    fn unbind_snapshot(&mut self) {
        self.binding = None;
        self.pending.clear();
    }

    fn remap(&mut self, top_ref: TopRef, file_size: u64) -> Result<()> {
        let writable = self.binding.is_some_and(|b| b.writable);
        self.bind_snapshot(top_ref, file_size, writable)
    }

    fn write_snapshot(
        &mut self,
        new_version: u64,
        oldest_live_version: u64,
    ) -> Result<SnapshotWriteOutcome> {
        let record_off = self.file_size;
        let payload = std::mem::take(&mut self.pending);
        let payload_len = payload.len() as u64;

        let file = self.file()?;
        let mut record_header = [0u8; RECORD_HEADER_SIZE as usize];
        record_header[..8].copy_from_slice(&new_version.to_le_bytes());
        record_header[8..].copy_from_slice(&payload_len.to_le_bytes());
        file.write_all_at(&record_header, record_off)?;
        file.write_all_at(&payload, record_off + RECORD_HEADER_SIZE)?;

        self.version = new_version;
        self.top_ref = TopRef::new(record_off);
        self.file_size = record_off + RECORD_HEADER_SIZE + payload_len;
        self.reclaim_floor = oldest_live_version;
        self.write_header()?;

        tracing::trace!(
            target: "strata.store",
            version = new_version,
            reclaim_floor = oldest_live_version,
            file_size = self.file_size,
            "wrote snapshot record"
        );

        Ok(SnapshotWriteOutcome {
            top_ref: self.top_ref,
            file_size: self.file_size,
        })
    }

    fn sync_commit(&mut self, _top_ref: TopRef) -> Result<()> {
        self.file()?.sync_all()?;
        Ok(())
    }

    fn write_compacted(&mut self, dest: &Path, version: u64) -> Result<()> {
        let payload = self.bound_payload()?;
        let binding = self.binding.ok_or(StrataError::WrongTransactState)?;

        let out = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(dest)?;

        let mut header = [0u8; SLAB_HEADER_SIZE as usize];
        header[..8].copy_from_slice(&MAGIC);
        header[offsets::FILE_FORMAT as usize] = self.file_format;
        header[offsets::HISTORY_TYPE as usize] = self.history_type.to_i8().to_le_bytes()[0];
        header[16..24].copy_from_slice(&version.to_le_bytes());

        let (top_ref, file_size) = if binding.top_ref.is_null() {
            (TopRef::NULL, SLAB_HEADER_SIZE)
        } else {
            let record_off = SLAB_HEADER_SIZE;
            let mut record_header = [0u8; RECORD_HEADER_SIZE as usize];
            record_header[..8].copy_from_slice(&version.to_le_bytes());
            record_header[8..].copy_from_slice(&(payload.len() as u64).to_le_bytes());
            out.write_all_at(&record_header, record_off)?;
            out.write_all_at(&payload, record_off + RECORD_HEADER_SIZE)?;
            (
                TopRef::new(record_off),
                record_off + RECORD_HEADER_SIZE + payload.len() as u64,
            )
        };
        header[24..32].copy_from_slice(&top_ref.get().to_le_bytes());
        header[32..40].copy_from_slice(&file_size.to_le_bytes());
        out.write_all_at(&header, 0)?;
        out.sync_all()?;

        tracing::debug!(
            target: "strata.store",
            dest = %dest.display(),
            version,
            file_size,
            "wrote compacted file"
        );
        Ok(())
    }
}
