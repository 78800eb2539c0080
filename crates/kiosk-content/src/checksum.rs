//! SHA-256 digests of staged and live files.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use kiosk_types::{EngineError, IoResultExt};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of the file at `path`.
pub fn sha256_file(path: &Path) -> Result<String, EngineError> {
    let mut file = File::open(path).io_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .io_context(|| format!("reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Lower-case a declared digest and strip an optional `sha256:` prefix.
///
/// Returns `None` unless the result is 64 hex characters.
pub fn normalize_digest(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let hex_part = trimmed
        .strip_prefix("sha256:")
        .or_else(|| trimmed.strip_prefix("SHA256:"))
        .unwrap_or(trimmed);
    if hex_part.len() == 64 && hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(hex_part.to_ascii_lowercase())
    } else {
        None
    }
}

/// `true` when `path` exists and hashes to `expected` (already normalised).
pub fn file_matches(path: &Path, expected: &str) -> Result<bool, EngineError> {
    if !path.is_file() {
        return Ok(false);
    }
    Ok(sha256_file(path)? == expected)
}
