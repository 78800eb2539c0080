//! [`ProcessSupervisor`] – process lookup and service control.
//!
//! [`SystemdSupervisor`] scans `/proc/<pid>/stat` for processes and drives
//! services through `systemctl`, each call bounded by the command timeout.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use kiosk_core::CancelToken;
use kiosk_types::EngineError;
use tracing::{error, info, warn};

use crate::command::run_with_timeout;

/// Kernel truncates `comm` to 15 bytes.
const COMM_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Only defunct instances exist.
    Zombie,
    Absent,
}

pub trait ProcessSupervisor {
    fn process_state(&self, name: &str) -> ProcessState;
    fn is_active(&self, service: &str) -> bool;
    fn start(&self, service: &str) -> Result<(), EngineError>;
    fn stop(&self, service: &str) -> Result<(), EngineError>;

    fn is_running(&self, name: &str) -> bool {
        self.process_state(name) == ProcessState::Running
    }

    /// Stop, settle, start, settle, verify.
    ///
    /// Returns whether the service is active afterwards. A failed stop or
    /// start is logged, not propagated; only cancellation is an error, so a
    /// failed restart waits for the next scheduled run.
    fn restart(&self, service: &str, settle: Duration, cancel: &CancelToken) -> Result<bool, EngineError> {
        if let Err(e) = self.stop(service) {
            warn!(service, error = %e, "graceful stop failed, continuing");
        }
        if let Err(e) = cancel.sleep(settle) {
            // Never leave the service stopped on the way out.
            if let Err(start) = self.start(service) {
                error!(service, error = %start, "start after interruption failed");
            }
            return Err(e);
        }
        if let Err(e) = self.start(service) {
            error!(service, error = %e, "start failed");
            return Ok(false);
        }
        cancel.sleep(settle)?;
        let active = self.is_active(service);
        if active {
            info!(service, "service restarted");
        } else {
            error!(service, "service not active after restart");
        }
        Ok(active)
    }
}

#[derive(Debug, Clone)]
pub struct SystemdSupervisor {
    proc_dir: PathBuf,
    timeout: Duration,
}

impl SystemdSupervisor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            proc_dir: PathBuf::from("/proc"),
            timeout,
        }
    }

    pub fn with_proc_dir(proc_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            proc_dir: proc_dir.into(),
            timeout,
        }
    }

    fn systemctl(&self, verb: &str, service: &str) -> Result<bool, EngineError> {
        let argv = ["systemctl", verb, service].map(String::from);
        Ok(run_with_timeout(&argv, self.timeout)?.success)
    }
}

impl ProcessSupervisor for SystemdSupervisor {
    fn process_state(&self, name: &str) -> ProcessState {
        let Ok(entries) = fs::read_dir(&self.proc_dir) else {
            return ProcessState::Absent;
        };
        let wanted = truncate_comm(name);
        let mut zombie = false;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            if !file_name.to_string_lossy().bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            match parse_stat(&stat) {
                Some((comm, state)) if comm == wanted => {
                    if state == 'Z' {
                        zombie = true;
                    } else {
                        return ProcessState::Running;
                    }
                }
                _ => {}
            }
        }
        if zombie { ProcessState::Zombie } else { ProcessState::Absent }
    }

    fn is_active(&self, service: &str) -> bool {
        self.systemctl("is-active", service).unwrap_or(false)
    }

    fn start(&self, service: &str) -> Result<(), EngineError> {
        if self.systemctl("start", service)? {
            Ok(())
        } else {
            Err(EngineError::General(format!("systemctl start {service} failed")))
        }
    }

    fn stop(&self, service: &str) -> Result<(), EngineError> {
        if self.systemctl("stop", service)? {
            Ok(())
        } else {
            Err(EngineError::General(format!("systemctl stop {service} failed")))
        }
    }
}

fn truncate_comm(name: &str) -> &str {
    match name.char_indices().nth(COMM_LEN) {
        Some((idx, _)) => &name[..idx],
        None => name,
    }
}

/// `"<pid> (<comm>) <state> ..."` → `(comm, state)`. `comm` may itself
/// contain parentheses, hence the search for the last `)`.
fn parse_stat(stat: &str) -> Option<(&str, char)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let comm = stat.get(open + 1..close)?;
    let state = stat.get(close + 1..)?.trim_start().chars().next()?;
    Some((comm, state))
}
