//! `kiosk-content-sync` – fetch, validate and publish the content bundle.
//!
//! Exit codes: 0 success (or already up to date), 1 general, 2 network,
//! 3 validation, 4 lock, 5 config.

mod common;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use kiosk_content::{ContentSync, SyncOutcome, SyncSettings};
use kiosk_core::config::parse_bandwidth;
use kiosk_core::{EngineConfig, Verbosity, init_tracing};
use kiosk_types::EngineError;
use tracing::{error, info, info_span};

const SERVICE: &str = "kiosk-content-sync";

#[derive(Parser, Debug)]
#[command(name = SERVICE, version, about = "Fetch, validate and atomically publish kiosk content")]
struct Args {
    /// Manifest location (overrides config and KIOSK_MANIFEST_URL).
    #[arg(long, value_name = "URL")]
    manifest_url: Option<String>,

    /// Media bandwidth ceiling per second, e.g. `500K` or `2MB`.
    #[arg(long, value_name = "RATE")]
    bandwidth: Option<String>,

    #[arg(long, value_name = "N")]
    max_retries: Option<u32>,

    /// Overall time limit per download attempt, in seconds.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Report what would be downloaded; stage and publish nothing.
    #[arg(long)]
    dry_run: bool,

    /// Ignore cached files and the up-to-date check.
    #[arg(long)]
    force: bool,

    #[arg(short, long)]
    verbose: bool,

    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

impl Args {
    fn apply(&self, cfg: &mut EngineConfig) -> Result<(), EngineError> {
        if let Some(url) = &self.manifest_url {
            cfg.content.manifest_url = Some(url.clone());
        }
        if let Some(rate) = &self.bandwidth {
            // Validate now so a typo is a CONFIG error, not a silent no-limit.
            parse_bandwidth(rate)?;
            cfg.content.bandwidth_limit = Some(rate.clone());
        }
        if let Some(n) = self.max_retries {
            cfg.content.max_retries = n;
        }
        if let Some(secs) = self.timeout {
            cfg.content.max_time_secs = secs;
        }
        Ok(())
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let verbosity = Verbosity::from_flags(args.verbose, args.quiet);

    let cfg = match common::load_config(args.config.as_deref(), |cfg| args.apply(cfg)) {
        Ok(cfg) => cfg,
        Err(e) => {
            let _guard = init_tracing(SERVICE, verbosity, None);
            error!(error = %e, "configuration rejected");
            return ExitCode::from(e.exit_code());
        }
    };
    let _guard = init_tracing(SERVICE, verbosity, Some(&cfg.paths.log_dir));
    let cancel = common::cancel_on_signal();
    let mut logger = common::spam_logger(&cfg);

    let run_id = uuid::Uuid::new_v4();
    let span = info_span!("content_sync", %run_id);
    let _entered = span.enter();

    let result = SyncSettings::from_config(&cfg).and_then(|mut settings| {
        settings.dry_run = args.dry_run;
        settings.force = args.force;
        ContentSync::new(settings, cancel)?.run()
    });

    let code = match result {
        Ok(SyncOutcome::Published(report)) => {
            info!(version = %report.version, downloaded = report.downloaded, "published");
            ExitCode::SUCCESS
        }
        Ok(SyncOutcome::UpToDate { version }) => {
            info!(version = %version, "up to date");
            ExitCode::SUCCESS
        }
        Ok(SyncOutcome::DryRun { version }) => {
            info!(version = %version, "dry run finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            logger.error(&format!("content sync failed: {e}"));
            ExitCode::from(e.exit_code())
        }
    };
    common::flush_logger(&mut logger);
    code
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn flags_override_config() {
        let args = Args::try_parse_from([
            SERVICE,
            "--manifest-url",
            "https://cdn/m.json",
            "--bandwidth",
            "2MB",
            "--max-retries",
            "5",
            "--timeout",
            "60",
            "--force",
        ])
        .unwrap();
        let mut cfg = EngineConfig::default();
        args.apply(&mut cfg).unwrap();
        assert_eq!(cfg.content.manifest_url.as_deref(), Some("https://cdn/m.json"));
        assert_eq!(cfg.content.max_retries, 5);
        assert_eq!(cfg.content.max_time_secs, 60);
        assert_eq!(cfg.content.bandwidth_bytes_per_sec().unwrap(), Some(2_000_000));
        assert!(args.force);
    }

    #[test]
    fn bad_bandwidth_is_config_error() {
        let args = Args::try_parse_from([SERVICE, "--bandwidth", "fast"]).unwrap();
        let err = args.apply(&mut EngineConfig::default()).unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Args::try_parse_from([SERVICE, "--verbose", "--quiet"]).is_err());
    }

    #[test]
    fn missing_explicit_config_is_rejected() {
        let err = common::load_config(Some(std::path::Path::new("/nonexistent/engine.toml")), |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }
}
