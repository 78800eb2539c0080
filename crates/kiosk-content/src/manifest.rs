//! Manifest model and [`fetch_manifest`].
//!
//! Wire format:
//!
//! ```json
//! {"version": "2026.10.1",
//!  "files": [{"url": "https://cdn/x.png", "filename": "img/x.png",
//!             "checksum": "<sha256 hex>", "type": "image"}]}
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use kiosk_types::{EngineError, IoResultExt};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::checksum::normalize_digest;
use crate::download::{DownloadEngine, Transport};

/// Validation flavour applied after a file is fetched.
///
/// Anything other than `"image"` or `"video"` (including the default
/// `"file"`) is [`ContentKind::Generic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Image,
    Video,
    #[default]
    #[serde(other)]
    Generic,
}

impl ContentKind {
    /// Media downloads are bandwidth-limited and resumable.
    pub fn is_media(self) -> bool {
        matches!(self, ContentKind::Image | ContentKind::Video)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub url: String,
    #[serde(rename = "filename")]
    pub relative_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: ContentKind,
}

impl FileEntry {
    /// Declared digest, normalised.
    pub fn expected_digest(&self) -> Option<String> {
        self.checksum.as_deref().and_then(normalize_digest)
    }

    pub fn path_under(&self, root: &Path) -> PathBuf {
        root.join(&self.relative_path)
    }
}

/// Version-stamped description of the expected content set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub files: Vec<FileEntry>,
}

impl Manifest {
    /// Parse and validate raw manifest bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, EngineError> {
        let manifest: Manifest = serde_json::from_slice(raw)
            .map_err(|e| EngineError::Validation(format!("malformed manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = fs::read(path).io_context(|| format!("reading manifest {}", path.display()))?;
        Self::parse(&raw)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.version.trim().is_empty() {
            return Err(EngineError::Validation("manifest version is empty".into()));
        }
        let mut seen = HashSet::new();
        for entry in &self.files {
            if entry.url.trim().is_empty() {
                return Err(EngineError::Validation(format!(
                    "entry '{}' has no url",
                    entry.relative_path
                )));
            }
            check_relative(&entry.relative_path)?;
            if !seen.insert(entry.relative_path.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate filename '{}'",
                    entry.relative_path
                )));
            }
            if let Some(raw) = &entry.checksum
                && normalize_digest(raw).is_none()
            {
                return Err(EngineError::Validation(format!(
                    "entry '{}' has an invalid sha256 checksum '{raw}'",
                    entry.relative_path
                )));
            }
        }
        Ok(())
    }
}

/// Reject absolute paths, `..` and anything that could escape the tree.
fn check_relative(name: &str) -> Result<(), EngineError> {
    let path = Path::new(name);
    let mut normal = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            _ => {
                return Err(EngineError::Validation(format!(
                    "filename '{name}' must be a relative path inside the content tree"
                )));
            }
        }
    }
    if normal == 0 {
        return Err(EngineError::Validation(format!("filename '{name}' is empty")));
    }
    if name == crate::MANIFEST_FILE {
        return Err(EngineError::Validation(format!(
            "filename '{name}' is reserved for the manifest"
        )));
    }
    Ok(())
}

/// A parsed manifest plus the raw file it came from.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub manifest: Manifest,
    pub raw_path: PathBuf,
}

/// Download the manifest into `temp_dir` and parse it.
///
/// A missing URL is a CONFIG error. The fetch is read-only and therefore
/// happens in dry-run mode too.
pub fn fetch_manifest<T: Transport>(
    engine: &mut DownloadEngine<T>,
    url: Option<&str>,
    temp_dir: &Path,
) -> Result<FetchedManifest, EngineError> {
    let url = url
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| EngineError::Config("no manifest URL configured".into()))?;

    let raw_path = temp_dir.join(crate::MANIFEST_FILE);
    engine.fetch(url, None, &raw_path, ContentKind::Generic)?;
    let manifest = Manifest::load(&raw_path)?;
    info!(
        version = %manifest.version,
        files = manifest.files.len(),
        "manifest fetched"
    );
    Ok(FetchedManifest { manifest, raw_path })
}
