//! [`ContentLayout`] – the on-disk shape of the content root.
//!
//! ```text
//! <root>/current/          live tree, only ever replaced by rename
//! <root>/staging/          next version under construction
//! <root>/cache/partial/    resumable in-flight downloads
//! <root>/temp/             per-run scratch space
//! <root>/backup-YYYYmmdd-HHMMSS/
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kiosk_types::{EngineError, IoResultExt};
use tracing::{debug, info};

/// File name of the manifest stored alongside each published tree.
pub const MANIFEST_FILE: &str = "manifest.json";

const BACKUP_PREFIX: &str = "backup-";

#[derive(Debug, Clone)]
pub struct ContentLayout {
    root: PathBuf,
}

impl ContentLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn current(&self) -> PathBuf {
        self.root.join("current")
    }

    pub fn staging(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn cache(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn partial_dir(&self) -> PathBuf {
        self.cache().join("partial")
    }

    pub fn temp(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub fn current_manifest(&self) -> PathBuf {
        self.current().join(MANIFEST_FILE)
    }

    pub fn staging_manifest(&self) -> PathBuf {
        self.staging().join(MANIFEST_FILE)
    }

    /// Create every working directory except `current/`, which only comes
    /// into existence through a publish.
    pub fn ensure(&self) -> Result<(), EngineError> {
        for dir in [self.staging(), self.partial_dir(), self.temp()] {
            fs::create_dir_all(&dir).io_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }

    /// Pick an unused backup directory name for `now`.
    pub fn backup_path(&self, now: DateTime<Utc>) -> PathBuf {
        let stamp = now.format("%Y%m%d-%H%M%S").to_string();
        let base = self.root.join(format!("{BACKUP_PREFIX}{stamp}"));
        if !base.exists() {
            return base;
        }
        (1..)
            .map(|n| self.root.join(format!("{BACKUP_PREFIX}{stamp}-{n:02}")))
            .find(|p| !p.exists())
            .unwrap_or(base)
    }

    /// Backup directories, oldest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>, EngineError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut backups: Vec<PathBuf> = fs::read_dir(&self.root)
            .io_context(|| format!("listing {}", self.root.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(BACKUP_PREFIX))
            .map(|entry| entry.path())
            .collect();
        backups.sort();
        Ok(backups)
    }

    /// Delete the oldest backups so that at most `keep` remain.
    ///
    /// Returns the removed directories.
    pub fn prune_backups(&self, keep: usize) -> Result<Vec<PathBuf>, EngineError> {
        let backups = self.list_backups()?;
        let excess = backups.len().saturating_sub(keep);
        let mut removed = Vec::with_capacity(excess);
        for old in backups.into_iter().take(excess) {
            fs::remove_dir_all(&old).io_context(|| format!("removing backup {}", old.display()))?;
            info!(backup = %old.display(), "pruned content backup");
            removed.push(old);
        }
        Ok(removed)
    }
}

/// Remove everything inside `dir` and leave it as an empty directory.
pub fn reset_dir(dir: &Path) -> Result<(), EngineError> {
    if dir.exists() {
        fs::remove_dir_all(dir).io_context(|| format!("clearing {}", dir.display()))?;
    }
    fs::create_dir_all(dir).io_context(|| format!("creating {}", dir.display()))?;
    debug!(dir = %dir.display(), "directory reset");
    Ok(())
}
