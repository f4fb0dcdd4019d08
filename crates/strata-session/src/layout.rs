//! Session-file (`<db>.lock`) wire layout.
//!
//! The session file is a transient binary image recreated at the start
//! of every session. The first 8 bytes are contractually frozen across
//! all layout versions so that a joining participant can verify the
//! actual format before touching anything else:
//!
//! ```text
//! Offset  Size  Field
//!   0       1   init_complete
//!   1       1   size_of_mutex
//!   2       1   size_of_condvar
//!   3       1   commit_in_critical_phase
//!   4       1   file_format_version
//!   5       1   history_type (i8)
//!   6       2   shared_info_version
//! ```
//!
//! Beyond the prefix: durability, free write slots, participant count,
//! latest version, initiator pid, version count, daemon bytes, then the
//! embedded shared parts of the interprocess mutexes and condvars, and
//! finally the ring region. The ring MUST stay the last field so the
//! file can be extended in place when the ring grows; nothing before it
//! ever moves within a session.
//!
//! The scalar fields are read and written through positioned file I/O;
//! the ring region is memory-mapped shared by every participant (see
//! [`crate::ring`]). Both views stay coherent because they go through
//! the same pages. All integers are little-endian at fixed offsets.

use std::fs::File;
use std::os::unix::fs::FileExt;

use strata_error::{Result, StrataError};
use strata_types::{Durability, HistoryType};

/// Layout version of the session file. Bump on any layout or meaning
/// change beyond the frozen prefix.
pub const SHARED_INFO_VERSION: u16 = 8;

/// Size in bytes of an embedded interprocess-mutex shared part. Stored
/// in the frozen prefix so participants built with a different shape
/// are rejected instead of corrupting each other.
pub const SIZE_OF_MUTEX_PART: u8 = 40;

/// Like [`SIZE_OF_MUTEX_PART`], for condvar shared parts.
pub const SIZE_OF_CONDVAR_PART: u8 = 24;

/// Byte offsets of every field in the session file.
pub mod offsets {
    /// `u8` — 1 once initialization finished.
    pub const INIT_COMPLETE: u64 = 0;
    /// `u8` — embedded mutex shared-part size.
    pub const SIZE_OF_MUTEX: u64 = 1;
    /// `u8` — embedded condvar shared-part size.
    pub const SIZE_OF_CONDVAR: u64 = 2;
    /// `u8` — 1 while a commit is mutating the ring.
    pub const COMMIT_IN_CRITICAL_PHASE: u64 = 3;
    /// `u8` — target database file format for the session.
    pub const FILE_FORMAT_VERSION: u64 = 4;
    /// `i8` — history type code.
    pub const HISTORY_TYPE: u64 = 5;
    /// `u16` — layout version of everything past the prefix.
    pub const SHARED_INFO_VERSION: u64 = 6;

    /// `u16` — durability code; fixed at session creation.
    pub const DURABILITY: u64 = 8;
    /// `u16` — async-mode write budget (reserved; async not built).
    pub const FREE_WRITE_SLOTS: u64 = 10;
    /// `u32` — number of participating sessions.
    pub const NUM_PARTICIPANTS: u64 = 12;
    /// `u64` — latest version number (guarded by the control mutex).
    pub const LATEST_VERSION: u64 = 16;
    /// `u64` — pid of the initiator, nonzero only under encryption.
    pub const SESSION_INITIATOR_PID: u64 = 24;
    /// `u64` — number of live versions.
    pub const NUMBER_OF_VERSIONS: u64 = 32;
    /// `u8` — sync-client presence flag.
    pub const SYNC_CLIENT_PRESENT: u64 = 40;
    /// `u8` — daemon started (reserved; async not built).
    pub const DAEMON_STARTED: u64 = 41;
    /// `u8` — daemon ready (reserved; async not built).
    pub const DAEMON_READY: u64 = 42;

    /// Shared part of the write mutex.
    pub const WRITE_MUTEX_PART: u64 = 48;
    /// Shared part of the control mutex.
    pub const CONTROL_MUTEX_PART: u64 = 88;
    /// Shared part of the balance mutex (async extension).
    pub const BALANCE_MUTEX_PART: u64 = 128;
    /// Shared part of the new-commit condvar.
    pub const NEW_COMMIT_CONDVAR_PART: u64 = 168;
    /// Shared part of the room-to-write condvar (async extension).
    pub const ROOM_TO_WRITE_CONDVAR_PART: u64 = 192;
    /// Shared part of the work-to-do condvar (async extension).
    pub const WORK_TO_DO_CONDVAR_PART: u64 = 216;
    /// Shared part of the daemon-ready condvar (async extension).
    pub const DAEMON_READY_CONDVAR_PART: u64 = 240;

    /// `u32` — ring entry count (start of the shared ring region; the
    /// ring must stay the last field of the layout).
    pub const RING_ENTRIES: u64 = 264;
    /// `u32` — index of the newest published slot.
    pub const RING_PUT_POS: u64 = 268;
    /// `u32` — index of the oldest live slot.
    pub const RING_OLD_POS: u64 = 272;
    /// First ring slot (the slot array runs to end of file).
    pub const RING_SLOTS: u64 = 280;
}

/// Length of the frozen prefix.
pub const FROZEN_PREFIX_BYTES: u64 = 8;

/// Stride of one ring slot.
pub const SLOT_STRIDE_BYTES: u64 = 40;

/// Field offsets within a ring slot.
pub const SLOT_VERSION: u64 = 0;
/// Logical database file size of the slot's snapshot.
pub const SLOT_FILE_SIZE: u64 = 8;
/// Root ref of the slot's snapshot.
pub const SLOT_TOP_REF: u64 = 16;
/// Packed `(readers << 1) | free` counter.
pub const SLOT_COUNT: u64 = 24;
/// Index of the following ring slot.
pub const SLOT_NEXT: u64 = 28;

/// File offset of ring slot `index`.
#[must_use]
pub fn slot_offset(index: u32) -> u64 {
    offsets::RING_SLOTS + u64::from(index) * SLOT_STRIDE_BYTES
}

/// Total session-file size for a ring with `entries` slots.
#[must_use]
pub fn layout_size(entries: u32) -> u64 {
    offsets::RING_SLOTS + u64::from(entries) * SLOT_STRIDE_BYTES
}

// ---------------------------------------------------------------------------
// Positioned field access
// ---------------------------------------------------------------------------

/// Read one byte at `offset`.
pub fn read_u8_at(file: &File, offset: u64) -> Result<u8> {
    let mut buf = [0u8; 1];
    file.read_exact_at(&mut buf, offset)?;
    Ok(buf[0])
}

/// Write one byte at `offset`.
pub fn write_u8_at(file: &File, offset: u64, value: u8) -> Result<()> {
    file.write_all_at(&[value], offset)?;
    Ok(())
}

/// Read a little-endian `u16` at `offset`.
pub fn read_u16_at(file: &File, offset: u64) -> Result<u16> {
    let mut buf = [0u8; 2];
    file.read_exact_at(&mut buf, offset)?;
    Ok(u16::from_le_bytes(buf))
}

/// Read a little-endian `u32` at `offset`.
pub fn read_u32_at(file: &File, offset: u64) -> Result<u32> {
    let mut buf = [0u8; 4];
    file.read_exact_at(&mut buf, offset)?;
    Ok(u32::from_le_bytes(buf))
}

/// Write a little-endian `u32` at `offset`.
pub fn write_u32_at(file: &File, offset: u64, value: u32) -> Result<()> {
    file.write_all_at(&value.to_le_bytes(), offset)?;
    Ok(())
}

/// Read a little-endian `u64` at `offset`.
pub fn read_u64_at(file: &File, offset: u64) -> Result<u64> {
    let mut buf = [0u8; 8];
    file.read_exact_at(&mut buf, offset)?;
    Ok(u64::from_le_bytes(buf))
}

/// Write a little-endian `u64` at `offset`.
pub fn write_u64_at(file: &File, offset: u64, value: u64) -> Result<()> {
    file.write_all_at(&value.to_le_bytes(), offset)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Whole-image construction and checks
// ---------------------------------------------------------------------------

/// Build the initial session-file image with `init_complete = 0` and a
/// seeded 32-slot ring.
///
/// The caller writes this image to the truncated file, then flips
/// `init_complete` to 1 as a separate step so a crash mid-write is
/// always detectable.
#[must_use]
pub fn initial_image(durability: Durability, history: HistoryType) -> Vec<u8> {
    let ring_image = crate::ring::seed_image();
    let mut buf = vec![0u8; offsets::RING_ENTRIES as usize + ring_image.len()];

    buf[offsets::INIT_COMPLETE as usize] = 0;
    buf[offsets::SIZE_OF_MUTEX as usize] = SIZE_OF_MUTEX_PART;
    buf[offsets::SIZE_OF_CONDVAR as usize] = SIZE_OF_CONDVAR_PART;
    buf[offsets::HISTORY_TYPE as usize] = history.to_i8().to_le_bytes()[0];
    buf[offsets::SHARED_INFO_VERSION as usize..offsets::SHARED_INFO_VERSION as usize + 2]
        .copy_from_slice(&SHARED_INFO_VERSION.to_le_bytes());
    buf[offsets::DURABILITY as usize..offsets::DURABILITY as usize + 2]
        .copy_from_slice(&durability.to_u16().to_le_bytes());
    buf[offsets::RING_ENTRIES as usize..].copy_from_slice(&ring_image);
    buf
}

/// Verify that the session file was initialized with the layout this
/// build expects. Reads nothing beyond the checked fields.
pub fn check_compatibility(file: &File) -> Result<()> {
    let info_size = file.metadata()?.len();
    let min_size = layout_size(crate::ring::RING_SEED_ENTRIES);
    if info_size < min_size {
        return Err(StrataError::incompatible(format!(
            "session file too small: {info_size} {min_size}"
        )));
    }
    let shared_info_version = read_u16_at(file, offsets::SHARED_INFO_VERSION)?;
    if shared_info_version != SHARED_INFO_VERSION {
        return Err(StrataError::incompatible(format!(
            "layout version mismatch: {shared_info_version} {SHARED_INFO_VERSION}"
        )));
    }
    let size_of_mutex = read_u8_at(file, offsets::SIZE_OF_MUTEX)?;
    if size_of_mutex != SIZE_OF_MUTEX_PART {
        return Err(StrataError::incompatible(format!(
            "mutex size mismatch: {size_of_mutex} {SIZE_OF_MUTEX_PART}"
        )));
    }
    let size_of_condvar = read_u8_at(file, offsets::SIZE_OF_CONDVAR)?;
    if size_of_condvar != SIZE_OF_CONDVAR_PART {
        return Err(StrataError::incompatible(format!(
            "condvar size mismatch: {size_of_condvar} {SIZE_OF_CONDVAR_PART}"
        )));
    }
    Ok(())
}
