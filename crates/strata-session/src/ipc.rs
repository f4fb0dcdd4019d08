//! Interprocess mutex and condvar primitives.
//!
//! The session's mutexes are two layers deep. Threads of one process
//! are serialized by an in-process gate shared through a global
//! registry keyed by the lock-file path (OS byte-range locks do not
//! exclude threads of the owning process, so the gate must be shared by
//! every handle to the same file in this process). Processes are
//! serialized by an open-file-description `fcntl` write lock on the
//! per-mutex file `<db>.management/access_control.<tag>`.
//!
//! The shared parts embedded in the session header are never destroyed
//! at participant close; another process may still be using them. A
//! later exclusive-lock holder reinitializes them when it rewrites the
//! session file.
//!
//! Condvars are an in-process `parking_lot::Condvar` paired with a
//! bounded repoll: cross-process notifications are observed by waiters
//! re-reading shared state at most one poll interval late.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use strata_error::{Result, StrataError};

/// Prefix of the per-primitive coordination files.
pub const ACCESS_CONTROL_PREFIX: &str = "access_control";

// ---------------------------------------------------------------------------
// fcntl helpers (open-file-description locks)
// ---------------------------------------------------------------------------

/// Attempt an OFD advisory lock over the whole file.
///
/// Returns `Ok(true)` if the lock was acquired, `Ok(false)` if it would
/// block, and `Err` for real I/O errors. With `wait` set the call
/// blocks instead of returning `Ok(false)`.
#[allow(clippy::cast_possible_wrap)]
pub fn ofd_lock(file: &impl AsFd, lock_type: i32, wait: bool) -> Result<bool> {
    let lock_type = i16::try_from(lock_type).expect("fcntl lock type must fit in i16");
    let whence = i16::try_from(libc::SEEK_SET).expect("SEEK_SET must fit in i16");
    let flock = libc::flock {
        l_type: lock_type,
        l_whence: whence,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };

    loop {
        let arg = if wait {
            nix::fcntl::FcntlArg::F_OFD_SETLKW(&flock)
        } else {
            nix::fcntl::FcntlArg::F_OFD_SETLK(&flock)
        };
        return match nix::fcntl::fcntl(file.as_fd().as_raw_fd(), arg) {
            Ok(_) => Ok(true),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::EACCES | nix::errno::Errno::EAGAIN) => Ok(false),
            Err(e) => Err(StrataError::Io(e.into())),
        };
    }
}

/// Release an OFD advisory lock over the whole file.
pub fn ofd_unlock(file: &impl AsFd) -> Result<()> {
    let ok = ofd_lock(file, libc::F_UNLCK, false)?;
    debug_assert!(ok, "F_UNLCK should never report contention");
    Ok(())
}

// ---------------------------------------------------------------------------
// Thread gate registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ThreadGate {
    locked: Mutex<bool>,
    unlocked: Condvar,
}

impl ThreadGate {
    fn lock(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.unlocked.wait(&mut locked);
        }
        *locked = true;
    }

    fn try_lock(&self) -> bool {
        let mut locked = self.locked.lock();
        if *locked {
            false
        } else {
            *locked = true;
            true
        }
    }

    fn unlock(&self) {
        *self.locked.lock() = false;
        self.unlocked.notify_one();
    }
}

/// One gate per coordination file per process.
fn gate_for(path: &Path) -> Arc<ThreadGate> {
    static GATES: OnceLock<Mutex<HashMap<PathBuf, Arc<ThreadGate>>>> = OnceLock::new();
    let mut map = GATES.get_or_init(|| Mutex::new(HashMap::new())).lock();
    Arc::clone(map.entry(path.to_path_buf()).or_default())
}

// ---------------------------------------------------------------------------
// IpcMutex
// ---------------------------------------------------------------------------

/// A process-shared mutex backed by `access_control.<tag>`.
///
/// `lock`/`unlock` are explicit because the write mutex is held across
/// the whole write-transaction span, not a lexical scope; use
/// [`with`](Self::with) for scoped sections.
#[derive(Debug)]
pub struct IpcMutex {
    tag: &'static str,
    file: Arc<File>,
    gate: Arc<ThreadGate>,
}

impl IpcMutex {
    /// Open (creating if absent) the coordination file for `tag` inside
    /// the coordination directory.
    pub fn open(coordination_dir: &Path, tag: &'static str) -> Result<Self> {
        let path = coordination_dir.join(format!("{ACCESS_CONTROL_PREFIX}.{tag}"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        // Key the gate by the resolved path so every handle to this
        // coordination file in the process shares one gate.
        let canonical = path.canonicalize().unwrap_or(path);
        let gate = gate_for(&canonical);
        Ok(Self {
            tag,
            file: Arc::new(file),
            gate,
        })
    }

    /// Acquire the mutex, blocking across threads and processes.
    pub fn lock(&self) -> Result<()> {
        self.gate.lock();
        match ofd_lock(self.file.as_ref(), libc::F_WRLCK, true) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.gate.unlock();
                Err(e)
            }
        }
    }

    /// Try to acquire the mutex without blocking.
    pub fn try_lock(&self) -> Result<bool> {
        if !self.gate.try_lock() {
            return Ok(false);
        }
        match ofd_lock(self.file.as_ref(), libc::F_WRLCK, false) {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.gate.unlock();
                Ok(false)
            }
            Err(e) => {
                self.gate.unlock();
                Err(e)
            }
        }
    }

    /// Release the mutex.
    pub fn unlock(&self) {
        if let Err(e) = ofd_unlock(self.file.as_ref()) {
            tracing::warn!(target: "strata.ipc", tag = self.tag, error = %e, "mutex unlock failed");
        }
        self.gate.unlock();
    }

    /// Liveness probe: can the mutex still be acquired and released?
    ///
    /// The probe only try-locks; it can never mark a dead owner's lock
    /// usable again, so an inconsistent foreign state is reported as
    /// valid-but-busy rather than silently repaired.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        match self.try_lock() {
            Ok(true) => {
                self.unlock();
                true
            }
            Ok(false) => true,
            Err(_) => false,
        }
    }

    /// Run `f` with the mutex held. The mutex is released when `f`
    /// returns or panics.
    pub fn with<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        self.lock()?;
        let _guard = UnlockOnDrop(self);
        f()
    }
}

struct UnlockOnDrop<'a>(&'a IpcMutex);

impl Drop for UnlockOnDrop<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

/// Ensure the coordination file for `tag` exists without locking it.
///
/// Builds with the async extension lock these files; everyone creates
/// them so the on-disk surface of the coordination directory does not
/// depend on build options.
pub fn touch_tag(coordination_dir: &Path, tag: &str) -> Result<()> {
    let path = coordination_dir.join(format!("{ACCESS_CONTROL_PREFIX}.{tag}"));
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// IpcCondVar
// ---------------------------------------------------------------------------

/// Bounded poll interval for cross-process condvar waits.
pub const CONDVAR_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Notification primitive for session waiters.
///
/// Same-process waiters wake immediately through the condvar;
/// waiters in other processes observe the state change on their next
/// repoll, at most [`CONDVAR_POLL_INTERVAL`] later.
#[derive(Debug, Clone, Default)]
pub struct IpcCondVar {
    inner: Arc<CondVarInner>,
}

#[derive(Debug, Default)]
struct CondVarInner {
    generation: Mutex<u64>,
    cv: Condvar,
}

/// One commit condvar per session file per process, so a commit in any
/// session handle wakes waiters of every other handle in this process.
/// Waiters in other processes are covered by the bounded repoll.
pub(crate) fn condvar_for(path: &Path) -> IpcCondVar {
    static CONDVARS: OnceLock<Mutex<HashMap<PathBuf, IpcCondVar>>> = OnceLock::new();
    let mut map = CONDVARS.get_or_init(|| Mutex::new(HashMap::new())).lock();
    map.entry(path.to_path_buf()).or_default().clone()
}

impl IpcCondVar {
    /// Create a condvar.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake all waiters.
    pub fn notify_all(&self) {
        let mut generation = self.inner.generation.lock();
        *generation += 1;
        self.inner.cv.notify_all();
    }

    /// Block until a notification or the poll interval elapses.
    ///
    /// Callers loop around this, re-checking their predicate against
    /// shared state each time.
    pub fn wait_interval(&self) {
        let mut generation = self.inner.generation.lock();
        let _timeout = self
            .inner
            .cv
            .wait_for(&mut generation, CONDVAR_POLL_INTERVAL);
    }
}
