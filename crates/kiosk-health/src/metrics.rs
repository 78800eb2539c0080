//! [`SystemMetrics`] – memory and filesystem usage.
//!
//! Linux only: memory comes from `/proc/meminfo` (`MemTotal` and
//! `MemAvailable`), disk usage from `statvfs(3)`.

use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use kiosk_types::{EngineError, IoResultExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub total_kb: u64,
    pub available_kb: u64,
}

impl MemoryUsage {
    pub fn used_percent(&self) -> f64 {
        if self.total_kb == 0 {
            return 0.0;
        }
        let used = self.total_kb.saturating_sub(self.available_kb);
        used as f64 * 100.0 / self.total_kb as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub used_bytes: u64,
    /// Space available to unprivileged users.
    pub available_bytes: u64,
}

impl DiskUsage {
    /// `df`-style percentage: reserved blocks count as neither used nor free.
    pub fn used_percent(&self) -> f64 {
        let usable = self.used_bytes + self.available_bytes;
        if usable == 0 {
            return 0.0;
        }
        self.used_bytes as f64 * 100.0 / usable as f64
    }
}

pub trait SystemMetrics {
    fn memory(&self) -> Result<MemoryUsage, EngineError>;
    fn disk(&self, path: &Path) -> Result<DiskUsage, EngineError>;
}

/// Reads the live kernel interfaces.
#[derive(Debug, Clone)]
pub struct ProcMetrics {
    meminfo: PathBuf,
}

impl Default for ProcMetrics {
    fn default() -> Self {
        Self {
            meminfo: PathBuf::from("/proc/meminfo"),
        }
    }
}

impl ProcMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_meminfo(path: impl Into<PathBuf>) -> Self {
        Self { meminfo: path.into() }
    }
}

impl SystemMetrics for ProcMetrics {
    fn memory(&self) -> Result<MemoryUsage, EngineError> {
        let raw = fs::read_to_string(&self.meminfo)
            .io_context(|| format!("reading {}", self.meminfo.display()))?;
        parse_meminfo(&raw).ok_or_else(|| {
            EngineError::General(format!("{} lacks MemTotal/MemAvailable", self.meminfo.display()))
        })
    }

    fn disk(&self, path: &Path) -> Result<DiskUsage, EngineError> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| EngineError::General(format!("{} contains a NUL byte", path.display())))?;
        // SAFETY: statvfs is plain old data, fully written on success.
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: valid NUL-terminated path and a writable out-pointer.
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut st) };
        if rc != 0 {
            return Err(EngineError::io(
                format!("statvfs {}", path.display()),
                std::io::Error::last_os_error(),
            ));
        }
        let frsize = st.f_frsize as u64;
        let blocks = st.f_blocks as u64;
        let free = st.f_bfree as u64;
        let avail = st.f_bavail as u64;
        Ok(DiskUsage {
            used_bytes: blocks.saturating_sub(free) * frsize,
            available_bytes: avail * frsize,
        })
    }
}

/// Extract `MemTotal` and `MemAvailable` (both in kB).
pub fn parse_meminfo(raw: &str) -> Option<MemoryUsage> {
    let mut total = None;
    let mut available = None;
    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next().and_then(|v| v.parse::<u64>().ok())) {
            (Some("MemTotal:"), Some(kb)) => total = Some(kb),
            (Some("MemAvailable:"), Some(kb)) => available = Some(kb),
            _ => {}
        }
    }
    Some(MemoryUsage {
        total_kb: total?,
        available_kb: available?,
    })
}
