//! `kiosk-health` – probe the kiosk, remediate what failed, feed the watchdog.
//!
//! Exit codes: 0 healthy, 1 warning, 2 critical, 3 the engine itself failed.

mod common;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use kiosk_core::{Verbosity, init_tracing};
use kiosk_health::{
    ActionOutcome, FeedStatus, HealthEngine, HealthOptions, HealthRun, ProcMetrics, SystemdSupervisor,
};
use kiosk_types::Severity;
use tracing::{error, info_span};

const SERVICE: &str = "kiosk-health";
const ENGINE_FAILURE: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = SERVICE, version, about = "Kiosk health checks, self-healing and watchdog feeding")]
struct Args {
    #[arg(short, long)]
    verbose: bool,

    /// Probe and report; take no recovery action and leave the ledger alone.
    #[arg(long)]
    dry_run: bool,

    /// Skip probes and restart display then app, ignoring cool-downs.
    #[arg(long)]
    force_restart: bool,

    /// Do not write the watchdog device or the heartbeat.
    #[arg(long)]
    skip_watchdog: bool,

    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

impl Args {
    fn options(&self) -> HealthOptions {
        HealthOptions {
            dry_run: self.dry_run,
            force_restart: self.force_restart,
            skip_watchdog: self.skip_watchdog,
        }
    }
}

fn print_summary(run: &HealthRun) {
    for result in run.report.results() {
        let status = match result.status {
            Severity::Ok => result.status.to_string().green(),
            Severity::Warning => result.status.to_string().yellow(),
            Severity::Critical => result.status.to_string().red().bold(),
        };
        println!("  {:<18} {:<10} {}", result.check.to_string().bold(), status, result.detail);
    }
    for record in &run.recoveries {
        let outcome = match &record.outcome {
            ActionOutcome::Executed => "executed".green(),
            ActionOutcome::Failed(reason) => format!("failed: {reason}").red(),
            ActionOutcome::CoolingDown => "cooling down".dimmed(),
            ActionOutcome::DryRun => "dry run".cyan(),
        };
        println!("  {} {:<18} {}", "↻".cyan(), record.action.to_string(), outcome);
    }
    if let FeedStatus::Failed(reason) = &run.watchdog {
        println!("  {} watchdog: {}", "!".yellow(), reason);
    }
    let overall = match run.report.overall() {
        Severity::Ok => "OK".green().bold(),
        Severity::Warning => "WARNING".yellow().bold(),
        Severity::Critical => "CRITICAL".red().bold(),
    };
    println!("{} {}", "overall:".bold(), overall);
}

fn main() -> ExitCode {
    let args = Args::parse();
    let verbosity = Verbosity::from_flags(args.verbose, false);

    let cfg = match common::load_config(args.config.as_deref(), |_| Ok(())) {
        Ok(cfg) => cfg,
        Err(e) => {
            let _guard = init_tracing(SERVICE, verbosity, None);
            error!(error = %e, "configuration rejected");
            return ExitCode::from(ENGINE_FAILURE);
        }
    };
    let _guard = init_tracing(SERVICE, verbosity, Some(&cfg.paths.log_dir));
    let cancel = common::cancel_on_signal();
    let mut logger = common::spam_logger(&cfg);

    let run_id = uuid::Uuid::new_v4();
    let span = info_span!("health", %run_id);
    let _entered = span.enter();

    let metrics = ProcMetrics::new();
    let supervisor = SystemdSupervisor::new(Duration::from_secs(cfg.health.command_timeout_secs));
    let result = HealthEngine::new(&cfg, &metrics, &supervisor, args.options(), cancel).run(&mut logger);

    let code = match result {
        Ok(run) => {
            print_summary(&run);
            ExitCode::from(run.exit_code())
        }
        Err(e) => {
            logger.error(&format!("health run failed: {e}"));
            ExitCode::from(ENGINE_FAILURE)
        }
    };
    common::flush_logger(&mut logger);
    code
}
