//! [`RecoveryDispatcher`] – map failing checks to rate-limited remediation.
//!
//! | Trigger                                | Action            |
//! |----------------------------------------|-------------------|
//! | memory CRITICAL                        | `drop_caches`     |
//! | memory WARNING                         | `clear_app_cache` |
//! | process liveness or display failing    | `restart_display` |
//! | application server failing             | `restart_app`     |
//! | disk CRITICAL                          | `prune_storage`   |
//!
//! Every execution, successful or not, is stamped in a [`RecoveryLedger`]
//! persisted under the state directory. An action still inside its cool-down
//! is skipped, so a check that keeps failing across scheduler ticks triggers
//! its remediation at most once per window.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use kiosk_core::config::{CooldownConfig, HealthConfig};
use kiosk_core::{CancelToken, ContentLayout, SpamLimitedLogger};
use kiosk_types::{CheckName, EngineError, IoResultExt, Severity};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::prober::HealthReport;
use crate::supervisor::ProcessSupervisor;

pub const LEDGER_FILE: &str = "recovery.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    RestartDisplay,
    RestartApp,
    /// Drop the page cache, then sweep stale temp files.
    DropCaches,
    ClearAppCache,
    /// Prune content backups, then apply log retention.
    PruneStorage,
}

impl RecoveryAction {
    pub fn target_check(self) -> CheckName {
        match self {
            RecoveryAction::RestartDisplay => CheckName::ProcessLiveness,
            RecoveryAction::RestartApp => CheckName::AppServer,
            RecoveryAction::DropCaches | RecoveryAction::ClearAppCache => CheckName::Memory,
            RecoveryAction::PruneStorage => CheckName::Disk,
        }
    }

    pub fn cooldown(self, cfg: &CooldownConfig) -> Duration {
        Duration::from_secs(match self {
            RecoveryAction::RestartDisplay => cfg.restart_display_secs,
            RecoveryAction::RestartApp => cfg.restart_app_secs,
            RecoveryAction::DropCaches => cfg.drop_caches_secs,
            RecoveryAction::ClearAppCache => cfg.clear_app_cache_secs,
            RecoveryAction::PruneStorage => cfg.prune_storage_secs,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryAction::RestartDisplay => "restart_display",
            RecoveryAction::RestartApp => "restart_app",
            RecoveryAction::DropCaches => "drop_caches",
            RecoveryAction::ClearAppCache => "clear_app_cache",
            RecoveryAction::PruneStorage => "prune_storage",
        }
    }
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remediations for `report`, deduplicated, in a stable order.
pub fn plan(report: &HealthReport) -> Vec<RecoveryAction> {
    let mut actions = Vec::new();
    for result in report.failing() {
        let action = match (result.check, result.status) {
            (CheckName::Memory, Severity::Critical) => RecoveryAction::DropCaches,
            (CheckName::Memory, Severity::Warning) => RecoveryAction::ClearAppCache,
            (CheckName::ProcessLiveness | CheckName::Display, _) => RecoveryAction::RestartDisplay,
            (CheckName::AppServer, _) => RecoveryAction::RestartApp,
            (CheckName::Disk, Severity::Critical) => RecoveryAction::PruneStorage,
            _ => continue,
        };
        actions.push(action);
    }
    actions.sort();
    actions.dedup();
    actions
}

// ─────────────────────────────────────────────────────────────────────────────
// Ledger
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub target_check: CheckName,
    pub action: RecoveryAction,
    pub last_executed_at: DateTime<Utc>,
}

/// Last execution time per action.
#[derive(Debug, Default)]
pub struct RecoveryLedger {
    entries: BTreeMap<RecoveryAction, LedgerEntry>,
}

impl RecoveryLedger {
    /// A missing or corrupt ledger starts empty.
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read recovery ledger");
                return Self::default();
            }
        };
        match serde_json::from_slice::<Vec<LedgerEntry>>(&raw) {
            Ok(list) => Self {
                entries: list.into_iter().map(|e| (e.action, e)).collect(),
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding corrupt recovery ledger");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
        }
        let list: Vec<&LedgerEntry> = self.entries.values().collect();
        let raw = serde_json::to_vec_pretty(&list)
            .map_err(|e| EngineError::General(format!("encoding recovery ledger: {e}")))?;
        fs::write(path, raw).io_context(|| format!("writing {}", path.display()))
    }

    pub fn last_executed(&self, action: RecoveryAction) -> Option<DateTime<Utc>> {
        self.entries.get(&action).map(|e| e.last_executed_at)
    }

    /// `true` while `action` ran less than `cooldown` before `now`.
    pub fn is_cooling_down(&self, action: RecoveryAction, cooldown: Duration, now: DateTime<Utc>) -> bool {
        match self.last_executed(action) {
            Some(last) => match (now - last).to_std() {
                Ok(elapsed) => elapsed < cooldown,
                Err(_) => true,
            },
            None => false,
        }
    }

    pub fn record(&mut self, action: RecoveryAction, now: DateTime<Utc>) {
        self.entries.insert(
            action,
            LedgerEntry {
                target_check: action.target_check(),
                action,
                last_executed_at: now,
            },
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Executed,
    Failed(String),
    CoolingDown,
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRecord {
    pub action: RecoveryAction,
    pub outcome: ActionOutcome,
}

pub struct RecoveryDispatcher<'a> {
    cfg: &'a HealthConfig,
    supervisor: &'a dyn ProcessSupervisor,
    content_root: PathBuf,
    log_dir: PathBuf,
    ledger: RecoveryLedger,
    dry_run: bool,
    cancel: CancelToken,
}

impl<'a> RecoveryDispatcher<'a> {
    pub fn new(
        cfg: &'a HealthConfig,
        supervisor: &'a dyn ProcessSupervisor,
        content_root: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
        ledger: RecoveryLedger,
        cancel: CancelToken,
    ) -> Self {
        Self {
            cfg,
            supervisor,
            content_root: content_root.into(),
            log_dir: log_dir.into(),
            ledger,
            dry_run: false,
            cancel,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn ledger(&self) -> &RecoveryLedger {
        &self.ledger
    }

    pub fn into_ledger(self) -> RecoveryLedger {
        self.ledger
    }

    /// Execute `actions` subject to their cool-downs.
    pub fn dispatch(
        &mut self,
        actions: &[RecoveryAction],
        now: DateTime<Utc>,
        logger: &mut SpamLimitedLogger,
    ) -> Result<Vec<RecoveryRecord>, EngineError> {
        let mut records = Vec::with_capacity(actions.len());
        for &action in actions {
            self.cancel.check()?;
            let cooldown = action.cooldown(&self.cfg.cooldowns);
            let outcome = if self.ledger.is_cooling_down(action, cooldown, now) {
                logger.info(&format!("recovery {action} skipped: inside {}s cool-down", cooldown.as_secs()));
                ActionOutcome::CoolingDown
            } else {
                self.execute(action, now, logger)?
            };
            records.push(RecoveryRecord { action, outcome });
        }
        Ok(records)
    }

    /// Restart both services, ignoring cool-downs.
    pub fn force_restart(
        &mut self,
        now: DateTime<Utc>,
        logger: &mut SpamLimitedLogger,
    ) -> Result<Vec<RecoveryRecord>, EngineError> {
        let mut records = Vec::with_capacity(2);
        for action in [RecoveryAction::RestartDisplay, RecoveryAction::RestartApp] {
            let outcome = self.execute(action, now, logger)?;
            records.push(RecoveryRecord { action, outcome });
        }
        Ok(records)
    }

    fn execute(
        &mut self,
        action: RecoveryAction,
        now: DateTime<Utc>,
        logger: &mut SpamLimitedLogger,
    ) -> Result<ActionOutcome, EngineError> {
        if self.dry_run {
            info!(action = %action, "dry run: would execute recovery");
            return Ok(ActionOutcome::DryRun);
        }
        info!(action = %action, "executing recovery");
        let result = match action {
            RecoveryAction::RestartDisplay => self.restart(&self.cfg.display_service),
            RecoveryAction::RestartApp => self.restart(&self.cfg.app_service),
            RecoveryAction::DropCaches => self.drop_caches(now),
            RecoveryAction::ClearAppCache => self.clear_app_cache(),
            RecoveryAction::PruneStorage => self.prune_storage(now),
        };
        // Failed attempts are stamped as well.
        self.ledger.record(action, now);
        match result {
            Ok(()) => Ok(ActionOutcome::Executed),
            Err(EngineError::Interrupted) => Err(EngineError::Interrupted),
            Err(e) => {
                logger.error(&format!("recovery {action} failed: {e}"));
                Ok(ActionOutcome::Failed(e.to_string()))
            }
        }
    }

    fn restart(&self, service: &str) -> Result<(), EngineError> {
        let settle = Duration::from_secs(self.cfg.restart_settle_secs);
        if self.supervisor.restart(service, settle, &self.cancel)? {
            Ok(())
        } else {
            Err(EngineError::General(format!("{service} not active after restart")))
        }
    }

    fn drop_caches(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        // SAFETY: sync(2) takes no arguments and cannot fail.
        unsafe { libc::sync() };
        let path = &self.cfg.drop_caches_path;
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .io_context(|| format!("opening {}", path.display()))?;
        file.write_all(b"1\n")
            .io_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "page cache dropped");

        let max_age = Duration::from_secs(self.cfg.temp_max_age_hours.saturating_mul(3600));
        let mut removed = 0;
        for dir in &self.cfg.temp_dirs {
            removed += remove_older_than(dir, max_age, now);
        }
        info!(removed, "stale temp files removed");
        Ok(())
    }

    fn clear_app_cache(&self) -> Result<(), EngineError> {
        for dir in &self.cfg.app_cache_dirs {
            let Ok(entries) = fs::read_dir(dir) else {
                debug!(dir = %dir.display(), "app cache directory absent");
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let removed = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                if let Err(e) = removed {
                    warn!(path = %path.display(), error = %e, "could not clear cache entry");
                }
            }
            info!(dir = %dir.display(), "app cache cleared");
        }
        Ok(())
    }

    fn prune_storage(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let layout = ContentLayout::new(&self.content_root);
        let pruned = layout.prune_backups(self.cfg.recovery_keep_backups)?;
        info!(pruned = pruned.len(), keep = self.cfg.recovery_keep_backups, "content backups pruned");

        let retention = Duration::from_secs(self.cfg.log_retention_days.saturating_mul(86_400));
        let expired = remove_older_than(&self.log_dir, retention, now);
        let rotated = rotate_large_logs(&self.log_dir, self.cfg.log_max_bytes);
        info!(expired, rotated, "log retention applied");
        Ok(())
    }
}

/// Delete regular files under `dir` last modified more than `max_age` ago.
fn remove_older_than(dir: &Path, max_age: Duration, now: DateTime<Utc>) -> usize {
    let cutoff = SystemTime::from(now)
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = 0;
    for entry in WalkDir::new(dir).min_depth(1).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
            continue;
        };
        if modified < cutoff {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => debug!(path = %entry.path().display(), error = %e, "could not remove"),
            }
        }
    }
    removed
}

/// Move each `*.log` above `max_bytes` to `*.log.1`, replacing the old one.
fn rotate_large_logs(dir: &Path, max_bytes: u64) -> usize {
    let mut rotated = 0;
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).into_iter().flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_file() && meta.len() > max_bytes {
            let mut target = path.as_os_str().to_owned();
            target.push(".1");
            match fs::rename(path, &target) {
                Ok(()) => rotated += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "log rotation failed"),
            }
        }
    }
    rotated
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::time::Duration as StdDuration;

    use chrono::Duration as ChronoDuration;
    use kiosk_types::HealthCheckResult;

    use super::*;
    use crate::supervisor::ProcessState;

    #[derive(Default)]
    struct Recorder {
        restarts: RefCell<Vec<String>>,
    }

    impl ProcessSupervisor for Recorder {
        fn process_state(&self, _: &str) -> ProcessState {
            ProcessState::Running
        }
        fn is_active(&self, _: &str) -> bool {
            true
        }
        fn start(&self, service: &str) -> Result<(), EngineError> {
            self.restarts.borrow_mut().push(service.to_string());
            Ok(())
        }
        fn stop(&self, _: &str) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn config(dir: &Path) -> HealthConfig {
        let drop_caches = dir.join("drop_caches");
        fs::write(&drop_caches, "").unwrap();
        HealthConfig {
            drop_caches_path: drop_caches,
            temp_dirs: vec![dir.join("tmp")],
            app_cache_dirs: vec![dir.join("app-cache")],
            restart_settle_secs: 0,
            ..HealthConfig::default()
        }
    }

    fn logger() -> SpamLimitedLogger {
        SpamLimitedLogger::in_memory(StdDuration::from_secs(300))
    }

    #[test]
    fn plan_maps_checks_to_actions() {
        let report: HealthReport = [
            HealthCheckResult::critical(CheckName::Memory, "92%"),
            HealthCheckResult::critical(CheckName::ProcessLiveness, "gone"),
            HealthCheckResult::warning(CheckName::Display, "no window"),
            HealthCheckResult::warning(CheckName::Disk, "85%"),
            HealthCheckResult::warning(CheckName::Network, "dns"),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            plan(&report),
            vec![RecoveryAction::RestartDisplay, RecoveryAction::DropCaches]
        );
    }

    #[test]
    fn memory_warning_only_clears_app_cache() {
        let report: HealthReport = [HealthCheckResult::warning(CheckName::Memory, "85%")]
            .into_iter()
            .collect();
        assert_eq!(plan(&report), vec![RecoveryAction::ClearAppCache]);
    }

    #[test]
    fn ledger_round_trips_and_expires() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("state").join(LEDGER_FILE);
        let t0 = Utc::now();
        let mut ledger = RecoveryLedger::default();
        ledger.record(RecoveryAction::RestartApp, t0);
        ledger.save(&path).unwrap();

        let loaded = RecoveryLedger::load(&path);
        let window = StdDuration::from_secs(900);
        assert!(loaded.is_cooling_down(RecoveryAction::RestartApp, window, t0 + ChronoDuration::seconds(60)));
        assert!(!loaded.is_cooling_down(RecoveryAction::RestartApp, window, t0 + ChronoDuration::seconds(900)));
        assert!(!loaded.is_cooling_down(RecoveryAction::DropCaches, window, t0));
    }

    #[test]
    fn corrupt_ledger_starts_empty() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join(LEDGER_FILE);
        fs::write(&path, "[{").unwrap();
        assert!(RecoveryLedger::load(&path).last_executed(RecoveryAction::RestartApp).is_none());
    }

    #[test]
    fn second_dispatch_inside_window_is_skipped() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cfg = config(dir.path());
        let sup = Recorder::default();
        let mut log = logger();
        let mut dispatcher = RecoveryDispatcher::new(
            &cfg,
            &sup,
            dir.path().join("content"),
            dir.path().join("logs"),
            RecoveryLedger::default(),
            CancelToken::new(),
        );
        let t0 = Utc::now();
        let first = dispatcher.dispatch(&[RecoveryAction::RestartApp], t0, &mut log).unwrap();
        let second = dispatcher
            .dispatch(&[RecoveryAction::RestartApp], t0 + ChronoDuration::seconds(60), &mut log)
            .unwrap();
        assert_eq!(first[0].outcome, ActionOutcome::Executed);
        assert_eq!(second[0].outcome, ActionOutcome::CoolingDown);
        assert_eq!(*sup.restarts.borrow(), ["kiosk-app.service"]);
    }

    #[test]
    fn drop_caches_writes_and_sweeps_old_temp_files() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cfg = config(dir.path());
        let tmp = dir.path().join("tmp");
        fs::create_dir_all(&tmp).unwrap();
        fs::write(tmp.join("fresh.bin"), b"x").unwrap();
        let sup = Recorder::default();
        let mut dispatcher = RecoveryDispatcher::new(
            &cfg,
            &sup,
            dir.path().join("content"),
            dir.path().join("logs"),
            RecoveryLedger::default(),
            CancelToken::new(),
        );
        // Two days from now, the fresh file is older than a day.
        let later = Utc::now() + ChronoDuration::days(2);
        let records = dispatcher
            .dispatch(&[RecoveryAction::DropCaches], later, &mut logger())
            .unwrap();
        assert_eq!(records[0].outcome, ActionOutcome::Executed);
        assert_eq!(fs::read_to_string(&cfg.drop_caches_path).unwrap(), "1\n");
        assert!(!tmp.join("fresh.bin").exists());
        assert!(sup.restarts.borrow().is_empty());
    }

    #[test]
    fn dry_run_neither_acts_nor_records() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cfg = config(dir.path());
        let sup = Recorder::default();
        let mut dispatcher = RecoveryDispatcher::new(
            &cfg,
            &sup,
            dir.path().join("content"),
            dir.path().join("logs"),
            RecoveryLedger::default(),
            CancelToken::new(),
        )
        .dry_run(true);
        let records = dispatcher.force_restart(Utc::now(), &mut logger()).unwrap();
        assert!(records.iter().all(|r| r.outcome == ActionOutcome::DryRun));
        assert!(sup.restarts.borrow().is_empty());
        assert!(dispatcher.ledger().last_executed(RecoveryAction::RestartApp).is_none());
    }

    #[test]
    fn prune_storage_keeps_three_backups_and_rotates_logs() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cfg = HealthConfig {
            log_max_bytes: 4,
            ..config(dir.path())
        };
        let content = dir.path().join("content");
        for day in 1..=5 {
            fs::create_dir_all(content.join(format!("backup-2026100{day}-000000"))).unwrap();
        }
        let logs = dir.path().join("logs");
        fs::create_dir_all(&logs).unwrap();
        fs::write(logs.join("kiosk-health.log"), b"0123456789").unwrap();

        let sup = Recorder::default();
        let mut dispatcher = RecoveryDispatcher::new(
            &cfg,
            &sup,
            &content,
            &logs,
            RecoveryLedger::default(),
            CancelToken::new(),
        );
        let records = dispatcher
            .dispatch(&[RecoveryAction::PruneStorage], Utc::now(), &mut logger())
            .unwrap();
        assert_eq!(records[0].outcome, ActionOutcome::Executed);
        assert_eq!(ContentLayout::new(&content).list_backups().unwrap().len(), 3);
        assert!(logs.join("kiosk-health.log.1").exists());
        assert!(!logs.join("kiosk-health.log").exists());
    }

    #[test]
    fn huge_retention_values_keep_everything() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cfg = HealthConfig {
            temp_max_age_hours: u64::MAX,
            log_retention_days: u64::MAX,
            ..config(dir.path())
        };
        let tmp = dir.path().join("tmp");
        fs::create_dir_all(&tmp).unwrap();
        fs::write(tmp.join("scratch.bin"), b"x").unwrap();
        let logs = dir.path().join("logs");
        fs::create_dir_all(&logs).unwrap();
        fs::write(logs.join("old.log"), b"x").unwrap();

        let sup = Recorder::default();
        let mut dispatcher = RecoveryDispatcher::new(
            &cfg,
            &sup,
            dir.path().join("content"),
            &logs,
            RecoveryLedger::default(),
            CancelToken::new(),
        );
        let records = dispatcher
            .dispatch(
                &[RecoveryAction::DropCaches, RecoveryAction::PruneStorage],
                Utc::now(),
                &mut logger(),
            )
            .unwrap();
        assert!(records.iter().all(|r| r.outcome == ActionOutcome::Executed));
        assert!(tmp.join("scratch.bin").exists());
        assert!(logs.join("old.log").exists());
    }

    #[test]
    fn failed_action_is_recorded_and_reported() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cfg = HealthConfig {
            drop_caches_path: dir.path().join("missing/drop_caches"),
            ..config(dir.path())
        };
        let sup = Recorder::default();
        let mut dispatcher = RecoveryDispatcher::new(
            &cfg,
            &sup,
            dir.path().join("content"),
            dir.path().join("logs"),
            RecoveryLedger::default(),
            CancelToken::new(),
        );
        let now = Utc::now();
        let records = dispatcher.dispatch(&[RecoveryAction::DropCaches], now, &mut logger()).unwrap();
        assert!(matches!(records[0].outcome, ActionOutcome::Failed(_)));
        assert_eq!(dispatcher.ledger().last_executed(RecoveryAction::DropCaches), Some(now));
    }
}
