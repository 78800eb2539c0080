//! `kiosk-health` – health supervision with rate-limited recovery.
//!
//! # Modules
//!
//! - [`metrics`] – [`SystemMetrics`][metrics::SystemMetrics]: memory and disk usage.
//! - [`supervisor`] – [`ProcessSupervisor`][supervisor::ProcessSupervisor]:
//!   process lookup and service restart.
//! - [`checks`] – the [`Probe`][checks::Probe] battery.
//! - [`prober`] – [`HealthProber`][prober::HealthProber] and the
//!   escalate-only [`HealthReport`][prober::HealthReport].
//! - [`recovery`] – [`RecoveryDispatcher`][recovery::RecoveryDispatcher] and
//!   its persisted cool-down ledger.
//! - [`watchdog`] – [`WatchdogFeeder`][watchdog::WatchdogFeeder].
//! - [`engine`] – [`HealthEngine`][engine::HealthEngine]: the whole run.

pub mod checks;
pub mod command;
pub mod engine;
pub mod metrics;
pub mod prober;
pub mod recovery;
pub mod supervisor;
pub mod watchdog;

pub use checks::Probe;
pub use engine::{HealthEngine, HealthOptions, HealthRun};
pub use metrics::{ProcMetrics, SystemMetrics};
pub use prober::{HealthProber, HealthReport};
pub use recovery::{ActionOutcome, RecoveryAction, RecoveryDispatcher, RecoveryLedger, RecoveryRecord};
pub use supervisor::{ProcessState, ProcessSupervisor, SystemdSupervisor};
pub use watchdog::{FeedStatus, WatchdogFeeder};
