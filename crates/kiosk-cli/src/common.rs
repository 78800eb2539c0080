//! Start-up plumbing shared by both binaries.

use std::path::Path;
use std::time::Duration;

use colored::Colorize;
use kiosk_core::{CancelToken, EngineConfig, SpamLimitedLogger, config};
use kiosk_types::EngineError;
use tracing::warn;

pub const SPAM_GUARD_FILE: &str = "spam_guard.json";

/// Load config, let `overrides` apply CLI flags, then validate the result.
pub fn load_config(
    explicit: Option<&Path>,
    overrides: impl FnOnce(&mut EngineConfig) -> Result<(), EngineError>,
) -> Result<EngineConfig, EngineError> {
    let mut cfg = config::load(explicit)?;
    overrides(&mut cfg)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Token tripped by SIGINT/SIGTERM.
pub fn cancel_on_signal() -> CancelToken {
    let token = CancelToken::new();
    let handler = token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("{}", "termination requested, unwinding current run".yellow().bold());
        handler.cancel();
    }) {
        warn!(error = %e, "failed to install signal handler; interruption will not release resources");
    }
    token
}

pub fn spam_logger(cfg: &EngineConfig) -> SpamLimitedLogger {
    SpamLimitedLogger::persistent(
        cfg.paths.state_dir.join(SPAM_GUARD_FILE),
        Duration::from_secs(cfg.logging.spam_window_secs),
    )
}

/// Persist the spam-guard map; failure only costs suppression history.
pub fn flush_logger(logger: &mut SpamLimitedLogger) {
    if let Err(e) = logger.flush() {
        warn!(error = %e, "spam-guard state not saved");
    }
}
