//! [`StagingValidator`] – assemble and validate the next content version.
//!
//! Entries are processed strictly in manifest order. Each one is either
//! copied from `current/` (declared checksum matches, no `--force`) or
//! downloaded into `staging/`, then validated according to its
//! [`ContentKind`]. The first failure aborts the whole stage; the caller
//! discards `staging/` so nothing partial can be published.

use std::fs;
use std::path::Path;

use kiosk_core::{CancelToken, ContentLayout};
use kiosk_types::{EngineError, IoResultExt};
use tracing::{debug, info, warn};

use crate::checksum::{file_matches, sha256_file};
use crate::download::{DownloadEngine, Transport};
use crate::manifest::{ContentKind, FetchedManifest, FileEntry, Manifest};

/// Where a staged file comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSource {
    /// Copied from the live tree, zero network.
    Reuse,
    Download,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub downloaded: usize,
    pub reused: usize,
    /// Soft validation findings (image sniff mismatches).
    pub warnings: Vec<String>,
}

pub struct StagingValidator<'a> {
    layout: &'a ContentLayout,
    force: bool,
    min_video_bytes: u64,
    cancel: CancelToken,
}

impl<'a> StagingValidator<'a> {
    pub fn new(layout: &'a ContentLayout, force: bool, min_video_bytes: u64, cancel: CancelToken) -> Self {
        Self {
            layout,
            force,
            min_video_bytes,
            cancel,
        }
    }

    /// Decide reuse vs download for `entry` without touching staging.
    pub fn source_for(&self, entry: &FileEntry) -> Result<FileSource, EngineError> {
        if self.force {
            return Ok(FileSource::Download);
        }
        let Some(expected) = entry.expected_digest() else {
            return Ok(FileSource::Download);
        };
        let live = entry.path_under(&self.layout.current());
        if file_matches(&live, &expected)? {
            Ok(FileSource::Reuse)
        } else {
            Ok(FileSource::Download)
        }
    }

    /// Per-entry intentions, logged by dry runs.
    pub fn plan(&self, manifest: &Manifest) -> Result<Vec<(String, FileSource)>, EngineError> {
        manifest
            .files
            .iter()
            .map(|entry| Ok((entry.relative_path.clone(), self.source_for(entry)?)))
            .collect()
    }

    /// Populate `staging/` from `fetched` and copy the manifest in last.
    pub fn stage<T: Transport>(
        &self,
        engine: &mut DownloadEngine<T>,
        fetched: &FetchedManifest,
    ) -> Result<StageReport, EngineError> {
        let staging = self.layout.staging();
        let mut report = StageReport::default();

        for entry in &fetched.manifest.files {
            self.cancel.check()?;
            let target = entry.path_under(&staging);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
            }

            match self.source_for(entry)? {
                FileSource::Reuse => {
                    let live = entry.path_under(&self.layout.current());
                    fs::copy(&live, &target)
                        .io_context(|| format!("copying {} into staging", live.display()))?;
                    debug!(file = %entry.relative_path, "reused from current");
                    report.reused += 1;
                }
                FileSource::Download => {
                    let revision = entry
                        .expected_digest()
                        .unwrap_or_else(|| fetched.manifest.version.clone());
                    engine.download_revision(&entry.url, Some(&revision), &target, entry.kind)?;
                    report.downloaded += 1;
                }
            }

            if let Some(warning) = self.validate(entry, &target)? {
                warn!(file = %entry.relative_path, "{warning}");
                report.warnings.push(warning);
            }
        }

        let manifest_copy = self.layout.staging_manifest();
        fs::copy(&fetched.raw_path, &manifest_copy)
            .io_context(|| format!("copying manifest into {}", manifest_copy.display()))?;

        info!(
            downloaded = report.downloaded,
            reused = report.reused,
            warnings = report.warnings.len(),
            "staging complete"
        );
        Ok(report)
    }

    /// Checksum first, then the per-kind rule. Rejected files are removed.
    fn validate(&self, entry: &FileEntry, path: &Path) -> Result<Option<String>, EngineError> {
        if let Some(expected) = entry.expected_digest() {
            let actual = sha256_file(path)?;
            if actual != expected {
                discard(path);
                return Err(EngineError::Validation(format!(
                    "checksum mismatch for {}: expected {expected}, got {actual}",
                    entry.relative_path
                )));
            }
        }
        match entry.kind {
            ContentKind::Generic => validate_generic(path),
            ContentKind::Image => validate_image(path),
            ContentKind::Video => validate_video(path, self.min_video_bytes),
        }
    }
}

fn validate_generic(path: &Path) -> Result<Option<String>, EngineError> {
    if path.is_file() {
        Ok(None)
    } else {
        Err(EngineError::Validation(format!("{} was not staged", path.display())))
    }
}

/// Header sniff; a mismatch is only a warning.
fn validate_image(path: &Path) -> Result<Option<String>, EngineError> {
    let sniffed = infer::get_from_path(path).io_context(|| format!("sniffing {}", path.display()))?;
    Ok(match sniffed {
        Some(kind) if kind.matcher_type() == infer::MatcherType::Image => None,
        Some(kind) => Some(format!(
            "{} does not look like an image (detected {})",
            path.display(),
            kind.mime_type()
        )),
        None => Some(format!("{} has no recognisable image header", path.display())),
    })
}

fn validate_video(path: &Path, min_bytes: u64) -> Result<Option<String>, EngineError> {
    let size = fs::metadata(path)
        .io_context(|| format!("inspecting {}", path.display()))?
        .len();
    if size < min_bytes {
        discard(path);
        return Err(EngineError::Validation(format!(
            "{} is {size} bytes, below the {min_bytes}-byte video floor",
            path.display()
        )));
    }
    Ok(None)
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(file = %path.display(), error = %e, "could not remove rejected file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::testing::{FakeTransport, engine};
    use crate::manifest::Manifest;

    // sha256("hello world")
    const HELLO: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";
    const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];

    fn fetched(dir: &Path, raw: &str) -> FetchedManifest {
        let raw_path = dir.join("manifest-src.json");
        fs::write(&raw_path, raw).unwrap();
        FetchedManifest {
            manifest: Manifest::parse(raw.as_bytes()).unwrap(),
            raw_path,
        }
    }

    #[test]
    fn reuses_matching_file_and_downloads_the_rest() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let layout = ContentLayout::new(dir.path());
        layout.ensure().unwrap();
        fs::create_dir_all(layout.current().join("docs")).unwrap();
        fs::write(layout.current().join("docs/hello.txt"), b"hello world").unwrap();

        let raw = format!(
            r#"{{"version":"2","files":[
                {{"url":"https://cdn/hello","filename":"docs/hello.txt","checksum":"{HELLO}"}},
                {{"url":"https://cdn/new","filename":"new.txt"}}]}}"#
        );
        let fetched = fetched(dir.path(), &raw);
        let mut eng = engine(FakeTransport::default().serve("https://cdn/new", b"fresh"), &layout.partial_dir(), 0);
        let validator = StagingValidator::new(&layout, false, 1, CancelToken::new());

        let report = validator.stage(&mut eng, &fetched).expect("stage");
        assert_eq!(report.reused, 1);
        assert_eq!(report.downloaded, 1);
        assert_eq!(eng.completed(), 1);
        assert_eq!(fs::read(layout.staging().join("docs/hello.txt")).unwrap(), b"hello world");
        assert_eq!(fs::read(layout.staging().join("new.txt")).unwrap(), b"fresh");
        assert!(layout.staging_manifest().is_file());
    }

    #[test]
    fn force_downloads_even_when_cached() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let layout = ContentLayout::new(dir.path());
        fs::create_dir_all(layout.current()).unwrap();
        fs::write(layout.current().join("a.txt"), b"hello world").unwrap();
        let raw = format!(r#"{{"version":"1","files":[{{"url":"u","filename":"a.txt","checksum":"{HELLO}"}}]}}"#);
        let manifest = Manifest::parse(raw.as_bytes()).unwrap();

        let cached = StagingValidator::new(&layout, false, 1, CancelToken::new());
        assert_eq!(cached.plan(&manifest).unwrap()[0].1, FileSource::Reuse);
        let forced = StagingValidator::new(&layout, true, 1, CancelToken::new());
        assert_eq!(forced.plan(&manifest).unwrap()[0].1, FileSource::Download);
    }

    #[test]
    fn checksum_mismatch_is_fatal_and_file_discarded() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let layout = ContentLayout::new(dir.path());
        layout.ensure().unwrap();
        let raw = format!(r#"{{"version":"1","files":[{{"url":"u","filename":"a.txt","checksum":"{HELLO}"}}]}}"#);
        let fetched = fetched(dir.path(), &raw);
        let mut eng = engine(FakeTransport::default().serve("u", b"tampered"), &layout.partial_dir(), 0);
        let validator = StagingValidator::new(&layout, false, 1, CancelToken::new());

        let err = validator.stage(&mut eng, &fetched).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(!layout.staging().join("a.txt").exists());
        assert!(!layout.staging_manifest().exists());
    }

    #[test]
    fn short_video_is_rejected() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let video = dir.path().join("clip.mp4");
        fs::write(&video, vec![0u8; 100]).unwrap();
        assert!(validate_video(&video, 1024).is_err());
        assert!(!video.exists());

        fs::write(&video, vec![0u8; 2048]).unwrap();
        assert_eq!(validate_video(&video, 1024).unwrap(), None);
    }

    #[test]
    fn image_sniff_only_warns() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let good = dir.path().join("ok.png");
        fs::write(&good, PNG_HEADER).unwrap();
        assert_eq!(validate_image(&good).unwrap(), None);

        let bad = dir.path().join("bad.png");
        fs::write(&bad, b"plain text, not a picture").unwrap();
        assert!(validate_image(&bad).unwrap().is_some());
        assert!(bad.exists(), "soft check keeps the file");
    }
}
