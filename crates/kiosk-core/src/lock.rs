//! [`PidLock`] – one live run per subsystem.
//!
//! The lock file holds `{"owner_pid": .., "acquired_at": ..}` and is guarded
//! by an exclusive `flock(2)` held for the lifetime of the guard, so two
//! contenders can never both pass the ownership check. A record naming a
//! live process other than the caller aborts the new run with
//! [`EngineError::Lock`]; a record left behind by a dead process is
//! overwritten. The file is removed when the guard is dropped, which covers
//! normal returns, `?` propagation and the unwind performed after a
//! termination signal trips the cancel token.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kiosk_types::{EngineError, IoResultExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Attempts before giving up on a lock file that keeps being replaced.
const MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner_pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// RAII guard over a PID lock file.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    record: LockRecord,
    // Holds the flock; closed after the file is unlinked in `drop`.
    _file: File,
}

impl PidLock {
    /// Acquire the lock at `path` for the current process.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        Self::acquire_as(path, std::process::id())
    }

    pub(crate) fn acquire_as(path: impl Into<PathBuf>, pid: u32) -> Result<Self, EngineError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
        }

        for _ in 0..MAX_ATTEMPTS {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .io_context(|| format!("opening lock {}", path.display()))?;
            if !try_lock_exclusive(&file).io_context(|| format!("locking {}", path.display()))? {
                let owner = read_owner(&path).unwrap_or_default();
                return Err(EngineError::Lock { pid: owner, path });
            }
            // A releasing holder unlinks the file before closing it; our
            // descriptor may point at that orphaned inode.
            if !refers_to(&file, &path) {
                debug!(lock = %path.display(), "lock file replaced while locking, retrying");
                continue;
            }

            match read_owner(&path) {
                Some(owner) if owner != pid && process_alive(owner) => {
                    return Err(EngineError::Lock { pid: owner, path });
                }
                Some(owner) if owner != pid => {
                    warn!(lock = %path.display(), stale_pid = owner, "reclaiming stale lock");
                }
                _ => {}
            }

            let record = LockRecord {
                owner_pid: pid,
                acquired_at: Utc::now(),
            };
            let body = serde_json::to_vec(&record)
                .map_err(|e| EngineError::General(format!("encoding lock record: {e}")))?;
            file.set_len(0)
                .and_then(|()| file.seek(SeekFrom::Start(0)))
                .and_then(|_| file.write_all(&body))
                .and_then(|()| file.flush())
                .io_context(|| format!("writing lock {}", path.display()))?;
            debug!(lock = %path.display(), pid, "lock acquired");
            return Ok(Self {
                path,
                record,
                _file: file,
            });
        }

        let owner = read_owner(&path).unwrap_or_default();
        Err(EngineError::Lock { pid: owner, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        // Only remove the file if it still names us.
        if read_owner(&self.path) == Some(self.record.owner_pid) {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(lock = %self.path.display(), error = %e, "failed to release lock");
            } else {
                debug!(lock = %self.path.display(), "lock released");
            }
        }
    }
}

/// Non-blocking exclusive `flock`; `Ok(false)` when another descriptor holds it.
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// `true` while `path` still names the inode open in `file`.
fn refers_to(file: &File, path: &Path) -> bool {
    match (file.metadata(), fs::metadata(path)) {
        (Ok(open), Ok(named)) => open.dev() == named.dev() && open.ino() == named.ino(),
        _ => false,
    }
}

/// Read the owning PID, accepting both the JSON record and a bare PID.
fn read_owner(path: &Path) -> Option<u32> {
    let raw = fs::read_to_string(path).ok()?;
    if let Ok(record) = serde_json::from_str::<LockRecord>(&raw) {
        return Some(record.owner_pid);
    }
    raw.trim().parse().ok()
}

/// `true` when a process with `pid` exists.
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence/permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
