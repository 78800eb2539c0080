//! [`SpamGuard`] – duplicate log-line suppression.
//!
//! Each message is reduced to a SHA-256 digest and remembered together with
//! the time it was last written to the sink. A second identical message
//! inside the window is dropped (but still counted), so a flapping probe
//! produces one line per window instead of one per invocation. The map can
//! be persisted between invocations because every run is a fresh process.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use chrono::Utc;
//! use kiosk_core::spam_guard::SpamGuard;
//!
//! let mut guard = SpamGuard::new(Duration::from_secs(300));
//! let now = Utc::now();
//! assert!(guard.admit("memory CRITICAL", now));
//! assert!(!guard.admit("memory CRITICAL", now));
//! assert_eq!(guard.suppressed(), 1);
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiosk_types::{EngineError, IoResultExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{Level, debug, error, info, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedGuard {
    entries: HashMap<String, DateTime<Utc>>,
}

/// Time-indexed map from message hash to the last time it was emitted.
#[derive(Debug)]
pub struct SpamGuard {
    window: Duration,
    entries: HashMap<String, DateTime<Utc>>,
    emitted: u64,
    suppressed: u64,
}

impl SpamGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
            emitted: 0,
            suppressed: 0,
        }
    }

    /// Load a persisted map from `path`; a missing or unreadable file starts
    /// an empty guard.
    pub fn load(path: &Path, window: Duration) -> Self {
        let mut guard = Self::new(window);
        match fs::read(path) {
            Ok(raw) => match serde_json::from_slice::<PersistedGuard>(&raw) {
                Ok(persisted) => guard.entries = persisted.entries,
                Err(e) => warn!(path = %path.display(), error = %e, "discarding corrupt spam-guard state"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "cannot read spam-guard state"),
        }
        guard
    }

    /// Write unexpired entries to `path`.
    pub fn save(&mut self, path: &Path, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.prune(now);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
        }
        let persisted = PersistedGuard {
            entries: self.entries.clone(),
        };
        let raw = serde_json::to_vec_pretty(&persisted)
            .map_err(|e| EngineError::General(format!("encoding spam-guard state: {e}")))?;
        fs::write(path, raw).io_context(|| format!("writing {}", path.display()))
    }

    /// Return `true` when `message` should reach the sink at `now`.
    pub fn admit(&mut self, message: &str, now: DateTime<Utc>) -> bool {
        let key = message_hash(message);
        let fresh = match self.entries.get(&key) {
            Some(last) => !self.within_window(*last, now),
            None => true,
        };
        if fresh {
            self.entries.insert(key, now);
            self.emitted += 1;
        } else {
            self.suppressed += 1;
        }
        fresh
    }

    fn within_window(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match (now - last).to_std() {
            Ok(elapsed) => elapsed < self.window,
            // Clock went backwards: treat as still inside the window.
            Err(_) => true,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.entries.retain(|_, last| match (now - *last).to_std() {
            Ok(elapsed) => elapsed < window,
            Err(_) => true,
        });
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn message_hash(message: &str) -> String {
    hex::encode(Sha256::digest(message.as_bytes()))
}

/// A `tracing` front-end that routes every line through a [`SpamGuard`].
pub struct SpamLimitedLogger {
    guard: SpamGuard,
    state_path: Option<PathBuf>,
}

impl SpamLimitedLogger {
    /// Logger without persistence, mostly for tests and one-shot tools.
    pub fn in_memory(window: Duration) -> Self {
        Self {
            guard: SpamGuard::new(window),
            state_path: None,
        }
    }

    /// Logger whose map survives across invocations at `state_path`.
    pub fn persistent(state_path: impl Into<PathBuf>, window: Duration) -> Self {
        let state_path = state_path.into();
        Self {
            guard: SpamGuard::load(&state_path, window),
            state_path: Some(state_path),
        }
    }

    /// Emit `message` at `level` unless it repeats inside the window.
    ///
    /// Returns whether the line reached the sink.
    pub fn log(&mut self, level: Level, message: &str) -> bool {
        if !self.guard.admit(message, Utc::now()) {
            debug!(line = message, "suppressed repeated log line");
            return false;
        }
        match level {
            Level::ERROR => error!("{message}"),
            Level::WARN => warn!("{message}"),
            Level::INFO => info!("{message}"),
            _ => debug!("{message}"),
        }
        true
    }

    pub fn error(&mut self, message: &str) -> bool {
        self.log(Level::ERROR, message)
    }

    pub fn warn(&mut self, message: &str) -> bool {
        self.log(Level::WARN, message)
    }

    pub fn info(&mut self, message: &str) -> bool {
        self.log(Level::INFO, message)
    }

    pub fn guard(&self) -> &SpamGuard {
        &self.guard
    }

    /// Persist the map if this logger has a state path.
    pub fn flush(&mut self) -> Result<(), EngineError> {
        match &self.state_path {
            Some(path) => self.guard.save(path, Utc::now()),
            None => Ok(()),
        }
    }
}
