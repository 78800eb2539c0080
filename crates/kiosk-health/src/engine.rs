//! [`HealthEngine`] – one health invocation: probe, recover, feed, report.

use std::path::PathBuf;

use chrono::Utc;
use kiosk_core::{CancelToken, EngineConfig, PidLock, SpamLimitedLogger};
use kiosk_types::{EngineError, Severity};
use tracing::{info, warn};

use crate::checks::{Probe, standard_probes};
use crate::metrics::SystemMetrics;
use crate::prober::{HealthProber, HealthReport};
use crate::recovery::{LEDGER_FILE, RecoveryDispatcher, RecoveryLedger, RecoveryRecord, plan};
use crate::supervisor::ProcessSupervisor;
use crate::watchdog::{FeedStatus, WatchdogFeeder};

pub const LOCK_FILE: &str = "health-engine.lock";

#[derive(Debug, Clone, Copy, Default)]
pub struct HealthOptions {
    pub dry_run: bool,
    pub force_restart: bool,
    pub skip_watchdog: bool,
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct HealthRun {
    pub report: HealthReport,
    pub recoveries: Vec<RecoveryRecord>,
    pub watchdog: FeedStatus,
}

impl HealthRun {
    /// 0 healthy, 1 warning, 2 critical.
    pub fn exit_code(&self) -> u8 {
        match self.report.overall() {
            Severity::Ok => 0,
            Severity::Warning => 1,
            Severity::Critical => 2,
        }
    }
}

pub struct HealthEngine<'a> {
    cfg: &'a EngineConfig,
    supervisor: &'a dyn ProcessSupervisor,
    probes: Vec<Box<dyn Probe + 'a>>,
    options: HealthOptions,
    cancel: CancelToken,
}

impl<'a> HealthEngine<'a> {
    /// Engine running the standard six-probe battery.
    pub fn new(
        cfg: &'a EngineConfig,
        metrics: &'a dyn SystemMetrics,
        supervisor: &'a dyn ProcessSupervisor,
        options: HealthOptions,
        cancel: CancelToken,
    ) -> Self {
        let probes = standard_probes(&cfg.health, &cfg.paths.content_root, metrics, supervisor);
        Self::with_probes(cfg, supervisor, probes, options, cancel)
    }

    pub fn with_probes(
        cfg: &'a EngineConfig,
        supervisor: &'a dyn ProcessSupervisor,
        probes: Vec<Box<dyn Probe + 'a>>,
        options: HealthOptions,
        cancel: CancelToken,
    ) -> Self {
        Self {
            cfg,
            supervisor,
            probes,
            options,
            cancel,
        }
    }

    fn ledger_path(&self) -> PathBuf {
        self.cfg.paths.state_dir.join(LEDGER_FILE)
    }

    pub fn run(self, logger: &mut SpamLimitedLogger) -> Result<HealthRun, EngineError> {
        let _lock = PidLock::acquire(self.cfg.paths.runtime_dir.join(LOCK_FILE))?;
        let now = Utc::now();
        let ledger_path = self.ledger_path();

        let mut dispatcher = RecoveryDispatcher::new(
            &self.cfg.health,
            self.supervisor,
            &self.cfg.paths.content_root,
            &self.cfg.paths.log_dir,
            RecoveryLedger::load(&ledger_path),
            self.cancel.clone(),
        )
        .dry_run(self.options.dry_run);

        let dispatched = if self.options.force_restart {
            info!("forced restart requested, skipping probes");
            dispatcher
                .force_restart(now, logger)
                .map(|records| (HealthReport::new(), records))
        } else {
            let report = HealthProber::new(self.probes).run();
            for result in report.results() {
                let line = format!("{} {}: {}", result.check, result.status, result.detail);
                match result.status {
                    Severity::Ok => info!(check = %result.check, "{}", result.detail),
                    Severity::Warning => {
                        logger.warn(&line);
                    }
                    Severity::Critical => {
                        logger.error(&line);
                    }
                }
            }
            let actions = plan(&report);
            self.cancel
                .check()
                .and_then(|()| dispatcher.dispatch(&actions, now, logger))
                .map(|records| (report, records))
        };

        // Persisted and fed even when dispatch was interrupted: an action
        // that already ran must keep its cool-down.
        if !self.options.dry_run
            && let Err(e) = dispatcher.ledger().save(&ledger_path)
        {
            warn!(error = %e, "recovery ledger not saved");
        }

        let feeder = WatchdogFeeder::new(&self.cfg.health.watchdog_device, &self.cfg.paths.state_dir);
        let watchdog = feeder.feed(self.options.skip_watchdog, Utc::now());

        let (report, recoveries) = dispatched?;

        info!(
            overall = %report.overall(),
            failing = report.failing().count(),
            recoveries = recoveries.len(),
            "health run complete"
        );
        Ok(HealthRun {
            report,
            recoveries,
            watchdog,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    use kiosk_types::{CheckName, HealthCheckResult};

    use super::*;
    use crate::recovery::{ActionOutcome, RecoveryAction};
    use crate::supervisor::ProcessState;
    use crate::watchdog::HEARTBEAT_FILE;

    struct Canned(CheckName, Severity);

    impl Probe for Canned {
        fn name(&self) -> CheckName {
            self.0
        }
        fn run(&self) -> HealthCheckResult {
            HealthCheckResult::new(self.0, self.1, "canned")
        }
    }

    #[derive(Default)]
    struct Services {
        started: RefCell<Vec<String>>,
    }

    impl ProcessSupervisor for Services {
        fn process_state(&self, _: &str) -> ProcessState {
            ProcessState::Running
        }
        fn is_active(&self, _: &str) -> bool {
            true
        }
        fn start(&self, service: &str) -> Result<(), EngineError> {
            self.started.borrow_mut().push(service.to_string());
            Ok(())
        }
        fn stop(&self, _: &str) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn config(root: &Path) -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.paths.content_root = root.join("content");
        cfg.paths.runtime_dir = root.join("run");
        cfg.paths.state_dir = root.join("state");
        cfg.paths.log_dir = root.join("logs");
        cfg.health.watchdog_device = root.join("watchdog");
        cfg.health.restart_settle_secs = 0;
        cfg
    }

    fn logger() -> SpamLimitedLogger {
        SpamLimitedLogger::in_memory(Duration::from_secs(300))
    }

    #[test]
    fn app_failure_restarts_app_once_per_window() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cfg = config(dir.path());
        let sup = Services::default();

        for _ in 0..3 {
            let probes: Vec<Box<dyn Probe>> = vec![Box::new(Canned(CheckName::AppServer, Severity::Critical))];
            let run = HealthEngine::with_probes(&cfg, &sup, probes, HealthOptions::default(), CancelToken::new())
                .run(&mut logger())
                .unwrap();
            assert_eq!(run.exit_code(), 2);
        }
        assert_eq!(*sup.started.borrow(), ["kiosk-app.service"]);
        assert!(cfg.paths.state_dir.join(LEDGER_FILE).exists());
    }

    #[test]
    fn force_restart_skips_probes() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cfg = config(dir.path());
        let sup = Services::default();
        let options = HealthOptions {
            force_restart: true,
            ..HealthOptions::default()
        };
        let probes: Vec<Box<dyn Probe>> = vec![Box::new(Canned(CheckName::Memory, Severity::Critical))];
        let run = HealthEngine::with_probes(&cfg, &sup, probes, options, CancelToken::new())
            .run(&mut logger())
            .unwrap();
        assert!(run.report.results().is_empty());
        assert_eq!(run.exit_code(), 0);
        assert_eq!(
            *sup.started.borrow(),
            ["kiosk-display.service", "kiosk-app.service"]
        );
        assert!(run.recoveries.iter().all(|r| r.outcome == ActionOutcome::Executed));
    }

    #[test]
    fn dry_run_reports_but_does_not_act() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cfg = config(dir.path());
        let sup = Services::default();
        let options = HealthOptions {
            dry_run: true,
            ..HealthOptions::default()
        };
        let probes: Vec<Box<dyn Probe>> = vec![Box::new(Canned(CheckName::ProcessLiveness, Severity::Critical))];
        let run = HealthEngine::with_probes(&cfg, &sup, probes, options, CancelToken::new())
            .run(&mut logger())
            .unwrap();
        assert_eq!(run.exit_code(), 2);
        assert_eq!(run.recoveries[0].action, RecoveryAction::RestartDisplay);
        assert_eq!(run.recoveries[0].outcome, ActionOutcome::DryRun);
        assert!(sup.started.borrow().is_empty());
        assert!(!cfg.paths.state_dir.join(LEDGER_FILE).exists());
        assert_eq!(run.watchdog, FeedStatus::NoDevice);
    }

    #[test]
    fn watchdog_is_fed_and_lock_released() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cfg = config(dir.path());
        fs::write(&cfg.health.watchdog_device, b"").unwrap();
        let sup = Services::default();
        let probes: Vec<Box<dyn Probe>> = vec![Box::new(Canned(CheckName::Network, Severity::Ok))];
        let run = HealthEngine::with_probes(&cfg, &sup, probes, HealthOptions::default(), CancelToken::new())
            .run(&mut logger())
            .unwrap();
        assert_eq!(run.exit_code(), 0);
        assert_eq!(run.watchdog, FeedStatus::Fed);
        assert!(!cfg.paths.runtime_dir.join(LOCK_FILE).exists());
    }

    struct SignalDuringStop {
        cancel: CancelToken,
        started: RefCell<Vec<String>>,
    }

    impl ProcessSupervisor for SignalDuringStop {
        fn process_state(&self, _: &str) -> ProcessState {
            ProcessState::Running
        }
        fn is_active(&self, _: &str) -> bool {
            true
        }
        fn start(&self, service: &str) -> Result<(), EngineError> {
            self.started.borrow_mut().push(service.to_string());
            Ok(())
        }
        fn stop(&self, _: &str) -> Result<(), EngineError> {
            self.cancel.cancel();
            Ok(())
        }
    }

    #[test]
    fn interrupted_restart_still_records_cooldown_and_feeds() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let mut cfg = config(dir.path());
        cfg.health.restart_settle_secs = 1;
        let cancel = CancelToken::new();
        let sup = SignalDuringStop {
            cancel: cancel.clone(),
            started: RefCell::default(),
        };
        let probes: Vec<Box<dyn Probe>> = vec![Box::new(Canned(CheckName::AppServer, Severity::Critical))];
        let err = HealthEngine::with_probes(&cfg, &sup, probes, HealthOptions::default(), cancel)
            .run(&mut logger())
            .unwrap_err();
        assert!(matches!(err, EngineError::Interrupted));

        let ledger = RecoveryLedger::load(&cfg.paths.state_dir.join(LEDGER_FILE));
        assert!(ledger.last_executed(RecoveryAction::RestartApp).is_some());
        assert!(cfg.paths.state_dir.join(HEARTBEAT_FILE).exists());
        assert_eq!(*sup.started.borrow(), ["kiosk-app.service"]);
        assert!(!cfg.paths.runtime_dir.join(LOCK_FILE).exists());
    }

    #[test]
    fn live_lock_aborts_run() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cfg = config(dir.path());
        fs::create_dir_all(&cfg.paths.runtime_dir).unwrap();
        fs::write(cfg.paths.runtime_dir.join(LOCK_FILE), "1").unwrap();
        let sup = Services::default();
        let err = HealthEngine::with_probes(&cfg, &sup, Vec::new(), HealthOptions::default(), CancelToken::new())
            .run(&mut logger())
            .unwrap_err();
        assert!(matches!(err, EngineError::Lock { pid: 1, .. }));
    }
}
