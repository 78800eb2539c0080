//! `kiosk-core` – infrastructure shared by the content and health engines.
//!
//! Neither subsystem calls the other at runtime; they share only the
//! patterns collected here.
//!
//! # Modules
//!
//! - [`config`] – [`EngineConfig`][config::EngineConfig]: the immutable
//!   per-invocation configuration loaded from TOML plus `KIOSK_*` overrides.
//! - [`layout`] – [`ContentLayout`][layout::ContentLayout]: the content root
//!   (`current/`, `staging/`, `cache/`, `temp/`, `backup-*`) and backup rotation.
//! - [`lock`] – [`PidLock`][lock::PidLock]: one live run per subsystem, with
//!   stale locks from dead owners reclaimed.
//! - [`spam_guard`] – [`SpamLimitedLogger`][spam_guard::SpamLimitedLogger]:
//!   suppresses repeated identical log lines inside a time window.
//! - [`retry`] – [`RetryPolicy`][retry::RetryPolicy]: bounded attempts with
//!   exponential backoff.
//! - [`cancel`] – [`CancelToken`][cancel::CancelToken]: cooperative shutdown
//!   after SIGINT/SIGTERM.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing].

pub mod cancel;
pub mod config;
pub mod layout;
pub mod lock;
pub mod retry;
pub mod spam_guard;
pub mod telemetry;

pub use cancel::CancelToken;
pub use config::EngineConfig;
pub use layout::{ContentLayout, MANIFEST_FILE};
pub use lock::PidLock;
pub use retry::{Attempt, RetryError, RetryPolicy};
pub use spam_guard::{SpamGuard, SpamLimitedLogger};
pub use telemetry::{TracerProviderGuard, Verbosity, init_tracing};
