//! The six probes run by every health invocation.
//!
//! Each probe turns its own failures into a [`HealthCheckResult`]; none of
//! them returns an error, so one broken collaborator cannot hide the others.

use std::fs;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use kiosk_core::config::HealthConfig;
use kiosk_types::{CheckName, HealthCheckResult, Severity};

use crate::command::run_with_timeout;
use crate::metrics::SystemMetrics;
use crate::supervisor::{ProcessState, ProcessSupervisor};

/// One independent health check.
pub trait Probe {
    fn name(&self) -> CheckName;
    fn run(&self) -> HealthCheckResult;
}

/// `>= critical` is CRITICAL, `>= warning` is WARNING.
pub fn classify(percent: f64, warning: f64, critical: f64) -> Severity {
    if percent >= critical {
        Severity::Critical
    } else if percent >= warning {
        Severity::Warning
    } else {
        Severity::Ok
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Process liveness
// ─────────────────────────────────────────────────────────────────────────────

pub struct ProcessLivenessProbe<'a> {
    pub supervisor: &'a dyn ProcessSupervisor,
    pub process: String,
}

impl Probe for ProcessLivenessProbe<'_> {
    fn name(&self) -> CheckName {
        CheckName::ProcessLiveness
    }

    fn run(&self) -> HealthCheckResult {
        let name = self.name();
        match self.supervisor.process_state(&self.process) {
            ProcessState::Running => HealthCheckResult::ok(name, format!("{} running", self.process)),
            ProcessState::Zombie => HealthCheckResult::critical(name, format!("{} is a zombie", self.process)),
            ProcessState::Absent => HealthCheckResult::critical(name, format!("{} not running", self.process)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Display
// ─────────────────────────────────────────────────────────────────────────────

/// Windowing surface answers, and the expected window exists.
pub struct DisplayProbe {
    pub surface_command: Vec<String>,
    /// Must print a non-empty window id; empty skips the window check.
    pub window_command: Vec<String>,
    pub timeout: Duration,
}

impl Probe for DisplayProbe {
    fn name(&self) -> CheckName {
        CheckName::Display
    }

    fn run(&self) -> HealthCheckResult {
        let name = self.name();
        if !self.surface_command.is_empty() {
            match run_with_timeout(&self.surface_command, self.timeout) {
                Ok(out) if out.success => {}
                Ok(_) => return HealthCheckResult::critical(name, "display surface not responding"),
                Err(e) => return HealthCheckResult::critical(name, format!("display probe failed: {e}")),
            }
        }
        if self.window_command.is_empty() {
            return HealthCheckResult::ok(name, "display surface responding");
        }
        match run_with_timeout(&self.window_command, self.timeout) {
            Ok(out) if out.success && !out.stdout.trim().is_empty() => {
                HealthCheckResult::ok(name, format!("window {} present", out.stdout.trim()))
            }
            Ok(_) => HealthCheckResult::critical(name, "expected window not found"),
            Err(e) => HealthCheckResult::critical(name, format!("window probe failed: {e}")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory / disk
// ─────────────────────────────────────────────────────────────────────────────

pub struct MemoryProbe<'a> {
    pub metrics: &'a dyn SystemMetrics,
    pub warning: f64,
    pub critical: f64,
}

impl Probe for MemoryProbe<'_> {
    fn name(&self) -> CheckName {
        CheckName::Memory
    }

    fn run(&self) -> HealthCheckResult {
        match self.metrics.memory() {
            Ok(usage) => {
                let pct = usage.used_percent();
                let status = classify(pct, self.warning, self.critical);
                HealthCheckResult::new(self.name(), status, format!("memory {pct:.1}% used"))
            }
            Err(e) => HealthCheckResult::warning(self.name(), format!("memory unreadable: {e}")),
        }
    }
}

pub struct DiskProbe<'a> {
    pub metrics: &'a dyn SystemMetrics,
    pub paths: Vec<PathBuf>,
    pub warning: f64,
    pub critical: f64,
}

impl Probe for DiskProbe<'_> {
    fn name(&self) -> CheckName {
        CheckName::Disk
    }

    /// Worst partition wins; the detail lists every partition.
    fn run(&self) -> HealthCheckResult {
        let mut worst = Severity::Ok;
        let mut details = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            match self.metrics.disk(path) {
                Ok(usage) => {
                    let pct = usage.used_percent();
                    worst = worst.max(classify(pct, self.warning, self.critical));
                    details.push(format!("{} {pct:.1}%", path.display()));
                }
                Err(e) => {
                    worst = worst.max(Severity::Warning);
                    details.push(format!("{} unreadable ({e})", path.display()));
                }
            }
        }
        HealthCheckResult::new(self.name(), worst, details.join(", "))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Network
// ─────────────────────────────────────────────────────────────────────────────

/// Interface up → DNS → TCP reachability. No interface is CRITICAL; the
/// later steps only WARN.
pub struct NetworkProbe {
    pub sysfs_net_dir: PathBuf,
    pub dns_host: String,
    pub reachability_target: String,
    pub timeout: Duration,
}

impl Probe for NetworkProbe {
    fn name(&self) -> CheckName {
        CheckName::Network
    }

    fn run(&self) -> HealthCheckResult {
        let name = self.name();
        let up = interfaces_up(&self.sysfs_net_dir);
        if up.is_empty() {
            return HealthCheckResult::critical(name, "no non-loopback interface is up");
        }
        if let Err(e) = resolve(&self.dns_host, self.timeout) {
            return HealthCheckResult::warning(name, format!("DNS lookup of {} failed: {e}", self.dns_host));
        }
        if let Err(e) = reach(&self.reachability_target, self.timeout) {
            return HealthCheckResult::warning(
                name,
                format!("{} unreachable: {e}", self.reachability_target),
            );
        }
        HealthCheckResult::ok(name, format!("up: {}", up.join(",")))
    }
}

/// Non-loopback interfaces whose `operstate` is `up`.
pub fn interfaces_up(sysfs_net_dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(sysfs_net_dir) else {
        return Vec::new();
    };
    let mut up: Vec<String> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "lo" {
                return None;
            }
            let state = fs::read_to_string(entry.path().join("operstate")).ok()?;
            (state.trim() == "up").then_some(name)
        })
        .collect();
    up.sort();
    up
}

/// `getaddrinfo` has no timeout of its own, so the lookup runs on a helper
/// thread that is abandoned when the deadline passes.
fn resolve(host: &str, timeout: Duration) -> Result<Vec<SocketAddr>, String> {
    let (tx, rx) = mpsc::channel();
    let target = if host.contains(':') { host.to_string() } else { format!("{host}:80") };
    thread::spawn(move || {
        let result = target
            .to_socket_addrs()
            .map(|addrs| addrs.collect::<Vec<_>>())
            .map_err(|e| e.to_string());
        let _ = tx.send(result);
    });
    match rx.recv_timeout(timeout) {
        Ok(Ok(addrs)) if !addrs.is_empty() => Ok(addrs),
        Ok(Ok(_)) => Err("no addresses".into()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(format!("timed out after {}s", timeout.as_secs())),
    }
}

fn reach(target: &str, timeout: Duration) -> Result<(), String> {
    let addrs = match target.parse::<SocketAddr>() {
        Ok(addr) => vec![addr],
        Err(_) => resolve(target, timeout)?,
    };
    let mut last = String::from("no address");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => return Ok(()),
            Err(e) => last = e.to_string(),
        }
    }
    Err(last)
}

// ─────────────────────────────────────────────────────────────────────────────
// Application server
// ─────────────────────────────────────────────────────────────────────────────

/// Service active, process present, health endpoint answers 200 with the
/// expected payload.
pub struct AppServerProbe<'a> {
    pub supervisor: &'a dyn ProcessSupervisor,
    pub service: String,
    pub process: String,
    pub url: String,
    pub expected_payload: String,
    pub timeout: Duration,
}

impl AppServerProbe<'_> {
    fn endpoint(&self) -> Result<(), String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| e.to_string())?;
        let response = client.get(&self.url).send().map_err(|e| e.to_string())?;
        let status = response.status();
        if status.as_u16() != 200 {
            return Err(format!("HTTP {}", status.as_u16()));
        }
        let body = response.text().map_err(|e| e.to_string())?;
        if !self.expected_payload.is_empty() && !body.contains(&self.expected_payload) {
            return Err(format!("payload lacks '{}'", self.expected_payload));
        }
        Ok(())
    }
}

impl Probe for AppServerProbe<'_> {
    fn name(&self) -> CheckName {
        CheckName::AppServer
    }

    fn run(&self) -> HealthCheckResult {
        let name = self.name();
        if !self.supervisor.is_active(&self.service) {
            return HealthCheckResult::critical(name, format!("{} is not active", self.service));
        }
        if !self.supervisor.is_running(&self.process) {
            return HealthCheckResult::critical(name, format!("{} process missing", self.process));
        }
        match self.endpoint() {
            Ok(()) => HealthCheckResult::ok(name, format!("{} healthy", self.url)),
            Err(e) => HealthCheckResult::critical(name, format!("{}: {e}", self.url)),
        }
    }
}

/// The full battery in report order.
pub fn standard_probes<'a>(
    cfg: &HealthConfig,
    content_root: &Path,
    metrics: &'a dyn SystemMetrics,
    supervisor: &'a dyn ProcessSupervisor,
) -> Vec<Box<dyn Probe + 'a>> {
    let disk_paths = if cfg.disk_paths.is_empty() {
        vec![content_root.to_path_buf(), PathBuf::from("/")]
    } else {
        cfg.disk_paths.clone()
    };
    vec![
        Box::new(ProcessLivenessProbe {
            supervisor,
            process: cfg.foreground_process.clone(),
        }),
        Box::new(DisplayProbe {
            surface_command: cfg.surface_command.clone(),
            window_command: cfg.window_command.clone(),
            timeout: Duration::from_secs(cfg.command_timeout_secs),
        }),
        Box::new(MemoryProbe {
            metrics,
            warning: cfg.memory_warning_percent,
            critical: cfg.memory_critical_percent,
        }),
        Box::new(DiskProbe {
            metrics,
            paths: disk_paths,
            warning: cfg.disk_warning_percent,
            critical: cfg.disk_critical_percent,
        }),
        Box::new(NetworkProbe {
            sysfs_net_dir: cfg.sysfs_net_dir.clone(),
            dns_host: cfg.dns_probe_host.clone(),
            reachability_target: cfg.reachability_target.clone(),
            timeout: Duration::from_secs(cfg.network_timeout_secs),
        }),
        Box::new(AppServerProbe {
            supervisor,
            service: cfg.app_service.clone(),
            process: cfg.app_process.clone(),
            url: cfg.health_url.clone(),
            expected_payload: cfg.expected_payload.clone(),
            timeout: Duration::from_secs(cfg.http_timeout_secs),
        }),
    ]
}
