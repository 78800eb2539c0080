//! [`ContentSync`] – one content-sync invocation end to end.
//!
//! lock → crash-window recovery → reset scratch → fetch manifest →
//! up-to-date check → stage → publish. Any error after the lock is taken
//! discards `staging/` and `temp/` before it propagates; the lock guard is
//! released on every path. A dry run only reads the content root: its
//! manifest lands in a throwaway directory outside it.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use kiosk_core::layout::reset_dir;
use kiosk_core::{CancelToken, ContentLayout, EngineConfig, PidLock, RetryPolicy};
use kiosk_types::{EngineError, IoResultExt};
use tracing::{info, warn};

use crate::checksum::file_matches;
use crate::download::{DownloadEngine, DownloadOptions, HttpTransport, Transport};
use crate::manifest::{Manifest, fetch_manifest};
use crate::publisher::Publisher;
use crate::staging::{FileSource, StagingValidator};

pub const LOCK_FILE: &str = "content-sync.lock";

/// Everything a sync run needs, resolved from config and CLI flags.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub manifest_url: Option<String>,
    pub content_root: PathBuf,
    pub lock_path: PathBuf,
    pub policy: RetryPolicy,
    pub connect_timeout: Duration,
    pub max_time: Duration,
    pub bandwidth_limit: Option<u64>,
    pub min_video_bytes: u64,
    pub keep_backups: usize,
    pub dry_run: bool,
    pub force: bool,
}

impl SyncSettings {
    pub fn from_config(cfg: &EngineConfig) -> Result<Self, EngineError> {
        let c = &cfg.content;
        Ok(Self {
            manifest_url: c.manifest_url.clone(),
            content_root: cfg.paths.content_root.clone(),
            lock_path: cfg.paths.runtime_dir.join(LOCK_FILE),
            policy: RetryPolicy::new(c.max_retries, Duration::from_secs(c.backoff_base_secs)),
            connect_timeout: Duration::from_secs(c.connect_timeout_secs),
            max_time: Duration::from_secs(c.max_time_secs),
            bandwidth_limit: c.bandwidth_bytes_per_sec()?,
            min_video_bytes: c.min_video_bytes,
            keep_backups: c.keep_backups,
            dry_run: false,
            force: false,
        })
    }
}

/// Summary of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub version: String,
    pub downloaded: usize,
    pub reused: usize,
    pub warnings: Vec<String>,
    pub backup: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Published(SyncReport),
    /// Live tree already matches the manifest; nothing was fetched.
    UpToDate { version: String },
    DryRun { version: String },
}

pub struct ContentSync<T: Transport> {
    settings: SyncSettings,
    layout: ContentLayout,
    engine: DownloadEngine<T>,
    cancel: CancelToken,
}

impl ContentSync<HttpTransport> {
    /// Sync over the real HTTP transport.
    pub fn new(settings: SyncSettings, cancel: CancelToken) -> Result<Self, EngineError> {
        let transport = HttpTransport::new(settings.connect_timeout, settings.max_time)?;
        Ok(Self::with_transport(settings, transport, cancel))
    }
}

impl<T: Transport> ContentSync<T> {
    pub fn with_transport(settings: SyncSettings, transport: T, cancel: CancelToken) -> Self {
        let layout = ContentLayout::new(&settings.content_root);
        let options = DownloadOptions {
            dry_run: settings.dry_run,
            bandwidth_limit: settings.bandwidth_limit,
            max_time: settings.max_time,
            partial_dir: layout.partial_dir(),
        };
        let engine = DownloadEngine::new(transport, settings.policy.clone(), options, cancel.clone());
        Self {
            settings,
            layout,
            engine,
            cancel,
        }
    }

    pub fn layout(&self) -> &ContentLayout {
        &self.layout
    }

    /// Network fetches performed so far, manifest included.
    pub fn downloads(&self) -> u32 {
        self.engine.completed()
    }

    pub fn run(&mut self) -> Result<SyncOutcome, EngineError> {
        let _lock = PidLock::acquire(&self.settings.lock_path)?;
        if self.settings.dry_run {
            return self.rehearse();
        }
        match self.run_locked() {
            Ok(outcome) => {
                self.discard_scratch(false);
                Ok(outcome)
            }
            Err(e) => {
                self.discard_scratch(true);
                Err(e)
            }
        }
    }

    /// Dry run: report what a real run would do without writing under the
    /// content root.
    fn rehearse(&mut self) -> Result<SyncOutcome, EngineError> {
        if !self.layout.current().exists() && !self.layout.list_backups()?.is_empty() {
            info!("dry run: would restore newest backup into current");
        }
        let scratch = tempfile::Builder::new()
            .prefix("kiosk-dry-run-")
            .tempdir()
            .io_context(|| "creating dry-run scratch directory".to_string())?;
        let live_partials = self.engine.set_partial_dir(scratch.path().join("partial"));
        let fetched = fetch_manifest(
            &mut self.engine,
            self.settings.manifest_url.as_deref(),
            scratch.path(),
        );
        self.engine.set_partial_dir(live_partials);
        let fetched = fetched?;
        let version = fetched.manifest.version.clone();

        if !self.settings.force && self.is_up_to_date(&fetched.manifest)? {
            info!(version = %version, "content already up to date");
            return Ok(SyncOutcome::UpToDate { version });
        }

        let validator = StagingValidator::new(
            &self.layout,
            self.settings.force,
            self.settings.min_video_bytes,
            self.cancel.clone(),
        );
        for (file, source) in validator.plan(&fetched.manifest)? {
            match source {
                FileSource::Reuse => info!(file = %file, "dry run: would reuse from current"),
                FileSource::Download => info!(file = %file, "dry run: would download"),
            }
        }
        info!(version = %version, "dry run: nothing staged or published");
        Ok(SyncOutcome::DryRun { version })
    }

    fn run_locked(&mut self) -> Result<SyncOutcome, EngineError> {
        let publisher = Publisher::new(&self.layout, self.settings.keep_backups);
        publisher.recover_interrupted()?;

        self.layout.ensure()?;
        reset_dir(&self.layout.staging())?;
        reset_dir(&self.layout.temp())?;

        let fetched = fetch_manifest(
            &mut self.engine,
            self.settings.manifest_url.as_deref(),
            &self.layout.temp(),
        )?;
        let version = fetched.manifest.version.clone();

        if !self.settings.force && self.is_up_to_date(&fetched.manifest)? {
            info!(version = %version, "content already up to date");
            return Ok(SyncOutcome::UpToDate { version });
        }

        let validator = StagingValidator::new(
            &self.layout,
            self.settings.force,
            self.settings.min_video_bytes,
            self.cancel.clone(),
        );

        let staged = validator.stage(&mut self.engine, &fetched)?;
        self.cancel.check()?;
        let published = publisher.publish(Utc::now())?;

        let report = SyncReport {
            version,
            downloaded: staged.downloaded,
            reused: staged.reused,
            warnings: staged.warnings,
            backup: published.backup,
        };
        info!(
            version = %report.version,
            downloaded = report.downloaded,
            reused = report.reused,
            warnings = report.warnings.len(),
            backup = ?report.backup,
            "content sync complete"
        );
        Ok(SyncOutcome::Published(report))
    }

    /// Same manifest as the live tree, and every listed file intact.
    fn is_up_to_date(&self, fetched: &Manifest) -> Result<bool, EngineError> {
        let live_manifest = self.layout.current_manifest();
        if !live_manifest.is_file() {
            return Ok(false);
        }
        let live = match Manifest::load(&live_manifest) {
            Ok(live) => live,
            Err(e) => {
                warn!(error = %e, "live manifest unreadable, resyncing");
                return Ok(false);
            }
        };
        if &live != fetched {
            return Ok(false);
        }
        let current = self.layout.current();
        for entry in &fetched.files {
            let path = entry.path_under(&current);
            let intact = match entry.expected_digest() {
                Some(digest) => file_matches(&path, &digest)?,
                None => path.is_file(),
            };
            if !intact {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Remove per-run scratch; on failure staging goes too.
    fn discard_scratch(&self, failed: bool) {
        let mut dirs = vec![self.layout.temp()];
        if failed {
            dirs.push(self.layout.staging());
        }
        for dir in dirs {
            if dir.exists()
                && let Err(e) = reset_dir(&dir)
            {
                warn!(dir = %dir.display(), error = %e, "could not discard scratch directory");
            }
        }
    }
}
