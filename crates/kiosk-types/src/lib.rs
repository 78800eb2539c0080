use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy shared by the content-sync and health subsystems.
///
/// Every variant maps onto one of the process exit codes consumed by the
/// external scheduler (see [`EngineError::exit_code`]).
#[derive(Error, Debug)]
pub enum EngineError {
    /// Missing or invalid settings. Fatal, never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A download exhausted its retry budget.
    #[error("Network error: {0}")]
    Network(String),

    /// Checksum mismatch, malformed manifest or incomplete staging tree.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Another live invocation of the same subsystem holds the lock.
    #[error("Lock held by running process {pid} ({})", path.display())]
    Lock { pid: u32, path: PathBuf },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected swap or filesystem failure.
    #[error("General failure: {0}")]
    General(String),

    /// A termination signal arrived mid-run.
    #[error("Run interrupted by signal")]
    Interrupted,
}

impl EngineError {
    /// Process exit code reported to the scheduler.
    ///
    /// | code | meaning    |
    /// |------|------------|
    /// | 1    | general    |
    /// | 2    | network    |
    /// | 3    | validation |
    /// | 4    | lock       |
    /// | 5    | config     |
    pub fn exit_code(&self) -> u8 {
        match self {
            EngineError::Network(_) => 2,
            EngineError::Validation(_) => 3,
            EngineError::Lock { .. } => 4,
            EngineError::Config(_) => 5,
            EngineError::Io { .. } | EngineError::General(_) | EngineError::Interrupted => 1,
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        EngineError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Attach a human-readable context to an I/O failure.
pub trait IoResultExt<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T, EngineError>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T, EngineError> {
        self.map_err(|e| EngineError::io(context(), e))
    }
}

/// Severity of a single probe result, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Ok,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Ok => write!(f, "OK"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Identity of each probe in the fixed health battery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckName {
    ProcessLiveness,
    Display,
    Memory,
    Disk,
    Network,
    AppServer,
}

impl fmt::Display for CheckName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckName::ProcessLiveness => "process_liveness",
            CheckName::Display => "display",
            CheckName::Memory => "memory",
            CheckName::Disk => "disk",
            CheckName::Network => "network",
            CheckName::AppServer => "app_server",
        };
        f.write_str(name)
    }
}

/// Outcome of one probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub check: CheckName,
    pub status: Severity,
    pub detail: String,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn new(check: CheckName, status: Severity, detail: impl Into<String>) -> Self {
        Self {
            check,
            status,
            detail: detail.into(),
            checked_at: Utc::now(),
        }
    }

    pub fn ok(check: CheckName, detail: impl Into<String>) -> Self {
        Self::new(check, Severity::Ok, detail)
    }

    pub fn warning(check: CheckName, detail: impl Into<String>) -> Self {
        Self::new(check, Severity::Warning, detail)
    }

    pub fn critical(check: CheckName, detail: impl Into<String>) -> Self {
        Self::new(check, Severity::Critical, detail)
    }

    pub fn is_failing(&self) -> bool {
        self.status != Severity::Ok
    }
}
