//! [`WatchdogFeeder`] – liveness signal for hardware and software watchdogs.
//!
//! Each health run writes a keepalive byte to the watchdog character device
//! (when one exists) and an RFC 3339 timestamp to a heartbeat file. An
//! external supervisor reads the heartbeat with [`WatchdogFeeder::health`]
//! and treats the engine as *stalled* once the file is older than its
//! deadline.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiosk_types::{EngineError, IoResultExt};
use tracing::{info, warn};

pub const HEARTBEAT_FILE: &str = "heartbeat";

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// What happened to the hardware device on this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    Fed,
    /// No device node; informational only.
    NoDevice,
    Skipped,
    /// The device exists but the write failed.
    Failed(String),
}

/// Liveness as seen from the heartbeat file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatHealth {
    /// Heartbeat written within the deadline.
    Alive,
    /// Heartbeat older than the deadline, or missing.
    Stalled,
}

// ────────────────────────────────────────────────────────────────────────────
// WatchdogFeeder
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WatchdogFeeder {
    device: PathBuf,
    heartbeat: PathBuf,
}

impl WatchdogFeeder {
    pub fn new(device: impl Into<PathBuf>, state_dir: &Path) -> Self {
        Self {
            device: device.into(),
            heartbeat: state_dir.join(HEARTBEAT_FILE),
        }
    }

    pub fn heartbeat_path(&self) -> &Path {
        &self.heartbeat
    }

    /// Feed the device and refresh the heartbeat, unless `skip` is set.
    ///
    /// Never fails the run: device problems come back as [`FeedStatus`] and
    /// heartbeat write errors are logged.
    pub fn feed(&self, skip: bool, now: DateTime<Utc>) -> FeedStatus {
        if skip {
            info!("watchdog feeding skipped");
            return FeedStatus::Skipped;
        }
        if let Err(e) = self.write_heartbeat(now) {
            warn!(error = %e, "heartbeat not written");
        }
        if !self.device.exists() {
            info!(device = %self.device.display(), "no watchdog device present");
            return FeedStatus::NoDevice;
        }
        let written = OpenOptions::new()
            .write(true)
            .open(&self.device)
            .and_then(|mut dev| dev.write_all(b"1"));
        match written {
            Ok(()) => {
                info!(device = %self.device.display(), "watchdog fed");
                FeedStatus::Fed
            }
            Err(e) => {
                warn!(device = %self.device.display(), error = %e, "watchdog write failed");
                FeedStatus::Failed(e.to_string())
            }
        }
    }

    fn write_heartbeat(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if let Some(parent) = self.heartbeat.parent() {
            fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&self.heartbeat, format!("{}\n", now.to_rfc3339()))
            .io_context(|| format!("writing {}", self.heartbeat.display()))
    }

    /// Timestamp of the last heartbeat, if readable.
    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        let raw = fs::read_to_string(&self.heartbeat).ok()?;
        DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// [`HeartbeatHealth::Stalled`] once the heartbeat is older than `deadline`.
    pub fn health(&self, deadline: Duration, now: DateTime<Utc>) -> HeartbeatHealth {
        match self.last_heartbeat().map(|last| (now - last).to_std()) {
            Some(Ok(age)) if age <= deadline => HeartbeatHealth::Alive,
            // A heartbeat from the future is treated as fresh.
            Some(Err(_)) => HeartbeatHealth::Alive,
            _ => HeartbeatHealth::Stalled,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    #[test]
    fn feeds_device_and_writes_heartbeat() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let device = dir.path().join("watchdog");
        fs::write(&device, b"").unwrap();
        let feeder = WatchdogFeeder::new(&device, &dir.path().join("state"));
        let now = Utc::now();

        assert_eq!(feeder.feed(false, now), FeedStatus::Fed);
        assert_eq!(fs::read(&device).unwrap(), b"1");
        assert_eq!(
            feeder.last_heartbeat().map(|t| t.timestamp()),
            Some(now.timestamp())
        );
    }

    #[test]
    fn missing_device_is_informational() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let feeder = WatchdogFeeder::new(dir.path().join("nope"), dir.path());
        assert_eq!(feeder.feed(false, Utc::now()), FeedStatus::NoDevice);
        assert!(feeder.heartbeat_path().exists());
    }

    #[test]
    fn skip_touches_nothing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let device = dir.path().join("watchdog");
        fs::write(&device, b"").unwrap();
        let feeder = WatchdogFeeder::new(&device, dir.path());
        assert_eq!(feeder.feed(true, Utc::now()), FeedStatus::Skipped);
        assert!(fs::read(&device).unwrap().is_empty());
        assert!(!feeder.heartbeat_path().exists());
    }

    #[test]
    fn fresh_heartbeat_is_alive() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let feeder = WatchdogFeeder::new(dir.path().join("nope"), dir.path());
        let now = Utc::now();
        feeder.feed(false, now);
        assert_eq!(feeder.health(Duration::from_secs(60), now), HeartbeatHealth::Alive);
    }

    #[test]
    fn old_heartbeat_is_stalled() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let feeder = WatchdogFeeder::new(dir.path().join("nope"), dir.path());
        let then = Utc::now();
        feeder.feed(false, then);
        let later = then + ChronoDuration::minutes(10);
        assert_eq!(feeder.health(Duration::from_secs(60), later), HeartbeatHealth::Stalled);
    }

    #[test]
    fn missing_heartbeat_is_stalled() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let feeder = WatchdogFeeder::new(dir.path().join("nope"), dir.path());
        assert_eq!(feeder.health(Duration::from_secs(60), Utc::now()), HeartbeatHealth::Stalled);
    }
}
