//! [`Publisher`] – rename-based swap of `staging/` into `current/`.
//!
//! The live tree is only ever changed by two directory renames on the same
//! filesystem: `current -> backup-<ts>` followed by `staging -> current`.
//! Between them `current/` is briefly absent; [`Publisher::recover_interrupted`]
//! closes that window after a crash by renaming the newest backup back.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use kiosk_core::ContentLayout;
use kiosk_types::{EngineError, IoResultExt};
use tracing::{error, info, warn};

use crate::manifest::Manifest;

/// Directory rename seam; tests inject failures here.
pub trait Renamer {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsRenamer;

impl Renamer for FsRenamer {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Where the previous `current/` went, if there was one.
    pub backup: Option<PathBuf>,
    pub pruned: Vec<PathBuf>,
}

pub struct Publisher<'a, R: Renamer = FsRenamer> {
    layout: &'a ContentLayout,
    keep_backups: usize,
    renamer: R,
}

impl<'a> Publisher<'a, FsRenamer> {
    pub fn new(layout: &'a ContentLayout, keep_backups: usize) -> Self {
        Self::with_renamer(layout, keep_backups, FsRenamer)
    }
}

impl<'a, R: Renamer> Publisher<'a, R> {
    pub fn with_renamer(layout: &'a ContentLayout, keep_backups: usize, renamer: R) -> Self {
        Self {
            layout,
            keep_backups,
            renamer,
        }
    }

    /// Staging holds a manifest and every file it lists.
    pub fn verify_staging(&self) -> Result<Manifest, EngineError> {
        let manifest_path = self.layout.staging_manifest();
        if !manifest_path.is_file() {
            return Err(EngineError::Validation(format!(
                "staging is incomplete: {} missing",
                manifest_path.display()
            )));
        }
        let manifest = Manifest::load(&manifest_path)?;
        let staging = self.layout.staging();
        if let Some(missing) = manifest
            .files
            .iter()
            .find(|entry| !entry.path_under(&staging).is_file())
        {
            return Err(EngineError::Validation(format!(
                "staging is incomplete: {} missing",
                missing.relative_path
            )));
        }
        Ok(manifest)
    }

    /// Swap staging into place, back up the previous tree and rotate backups.
    pub fn publish(&self, now: DateTime<Utc>) -> Result<PublishReport, EngineError> {
        let manifest = self.verify_staging()?;
        let current = self.layout.current();
        let staging = self.layout.staging();

        let backup = if current.exists() {
            let backup = self.layout.backup_path(now);
            self.renamer
                .rename(&current, &backup)
                .io_context(|| format!("moving {} to {}", current.display(), backup.display()))?;
            Some(backup)
        } else {
            None
        };

        if let Err(e) = self.renamer.rename(&staging, &current) {
            return Err(self.roll_back(backup.as_deref(), e));
        }

        let pruned = self.layout.prune_backups(self.keep_backups)?;
        fs::create_dir_all(&staging).io_context(|| format!("recreating {}", staging.display()))?;

        info!(
            version = %manifest.version,
            backup = ?backup,
            pruned = pruned.len(),
            "content published"
        );
        Ok(PublishReport { backup, pruned })
    }

    fn roll_back(&self, backup: Option<&Path>, cause: io::Error) -> EngineError {
        let current = self.layout.current();
        let Some(backup) = backup else {
            return EngineError::General(format!("publishing staging failed: {cause}"));
        };
        match self.renamer.rename(backup, &current) {
            Ok(()) => {
                warn!(backup = %backup.display(), "publish failed, previous content restored");
                EngineError::General(format!(
                    "publishing staging failed ({cause}); previous content restored from {}",
                    backup.display()
                ))
            }
            Err(restore) => {
                error!(
                    backup = %backup.display(),
                    error = %restore,
                    "publish failed and restore failed: manual intervention required"
                );
                EngineError::General(format!(
                    "publishing staging failed ({cause}) and restoring {} failed ({restore}); \
                     manual intervention required",
                    backup.display()
                ))
            }
        }
    }

    /// Restore the newest backup when a previous publish died between renames.
    pub fn recover_interrupted(&self) -> Result<Option<PathBuf>, EngineError> {
        let current = self.layout.current();
        if current.exists() {
            return Ok(None);
        }
        let Some(newest) = self.layout.list_backups()?.pop() else {
            return Ok(None);
        };
        self.renamer
            .rename(&newest, &current)
            .io_context(|| format!("restoring {}", newest.display()))?;
        warn!(backup = %newest.display(), "current was missing, restored newest backup");
        Ok(Some(newest))
    }
}
