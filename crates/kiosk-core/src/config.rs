//! Engine configuration – reads `/etc/kiosk/engine.toml`.
//!
//! A single immutable [`EngineConfig`] is built once per invocation from
//! defaults, the TOML file and `KIOSK_*` environment overrides, then handed
//! to every component. CLI flags are applied on top by the binaries.

use std::fs;
use std::path::{Path, PathBuf};

use byte_unit::Byte;
use kiosk_types::EngineError;
use serde::{Deserialize, Serialize};

/// Location probed when no `--config` flag is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/kiosk/engine.toml";

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Filesystem roots shared by both subsystems.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Holds `current/`, `staging/`, `cache/`, `temp/` and the backups.
    #[serde(default = "default_content_root")]
    pub content_root: PathBuf,

    /// PID lock files.
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Spam-guard map, recovery ledger and heartbeat file.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_content_root() -> PathBuf {
    PathBuf::from("/var/lib/kiosk/content")
}
fn default_runtime_dir() -> PathBuf {
    PathBuf::from("/run/kiosk")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/kiosk")
}
fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/kiosk/state")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            content_root: default_content_root(),
            runtime_dir: default_runtime_dir(),
            log_dir: default_log_dir(),
            state_dir: default_state_dir(),
        }
    }
}

/// Content-sync tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    pub manifest_url: Option<String>,
    pub max_retries: u32,
    /// Backoff after failed attempt `n` is `backoff_base_secs * 2^n`.
    pub backoff_base_secs: u64,
    pub connect_timeout_secs: u64,
    /// Overall wall-clock cap for a single download attempt.
    pub max_time_secs: u64,
    /// Human byte size per second (e.g. `"2MB"`), media downloads only.
    pub bandwidth_limit: Option<String>,
    pub min_video_bytes: u64,
    pub keep_backups: usize,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            manifest_url: None,
            max_retries: 3,
            backoff_base_secs: 1,
            connect_timeout_secs: 30,
            max_time_secs: 300,
            bandwidth_limit: None,
            min_video_bytes: 1024 * 1024,
            keep_backups: 5,
        }
    }
}

impl ContentConfig {
    /// Bandwidth ceiling in bytes per second, `None` when unlimited.
    pub fn bandwidth_bytes_per_sec(&self) -> Result<Option<u64>, EngineError> {
        match self.bandwidth_limit.as_deref() {
            None => Ok(None),
            Some(raw) => parse_bandwidth(raw),
        }
    }
}

/// Parse a human byte size such as `500K`, `2MB` or `1048576`.
///
/// `0` and the empty string mean "unlimited".
pub fn parse_bandwidth(raw: &str) -> Result<Option<u64>, EngineError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let bytes = Byte::parse_str(trimmed, true)
        .map_err(|e| EngineError::Config(format!("invalid bandwidth '{raw}': {e}")))?
        .as_u64();
    Ok(if bytes == 0 { None } else { Some(bytes) })
}

/// Minimum quiet period between two executions of the same remediation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    pub restart_display_secs: u64,
    pub restart_app_secs: u64,
    pub drop_caches_secs: u64,
    pub clear_app_cache_secs: u64,
    pub prune_storage_secs: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            restart_display_secs: 900,
            restart_app_secs: 900,
            drop_caches_secs: 3600,
            clear_app_cache_secs: 3600,
            prune_storage_secs: 3600,
        }
    }
}

/// Health probe thresholds, collaborator names and remediation targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Foreground process that must be alive (matched against `comm`).
    pub foreground_process: String,
    pub display_service: String,
    pub app_service: String,
    pub app_process: String,
    pub health_url: String,
    pub expected_payload: String,
    pub http_timeout_secs: u64,

    pub memory_warning_percent: f64,
    pub memory_critical_percent: f64,
    pub disk_warning_percent: f64,
    pub disk_critical_percent: f64,
    /// Partitions checked for usage; empty means content root and `/`.
    pub disk_paths: Vec<PathBuf>,

    pub dns_probe_host: String,
    /// `host:port` reached over TCP to prove external connectivity.
    pub reachability_target: String,
    pub network_timeout_secs: u64,
    pub sysfs_net_dir: PathBuf,

    /// Command proving the windowing surface answers (exit 0).
    pub surface_command: Vec<String>,
    /// Command printing the expected window id; empty skips the window check.
    pub window_command: Vec<String>,
    pub command_timeout_secs: u64,
    pub restart_settle_secs: u64,

    pub watchdog_device: PathBuf,

    pub app_cache_dirs: Vec<PathBuf>,
    pub temp_dirs: Vec<PathBuf>,
    pub temp_max_age_hours: u64,
    pub drop_caches_path: PathBuf,
    pub log_retention_days: u64,
    pub log_max_bytes: u64,
    pub recovery_keep_backups: usize,

    pub cooldowns: CooldownConfig,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            foreground_process: "chromium".to_string(),
            display_service: "kiosk-display.service".to_string(),
            app_service: "kiosk-app.service".to_string(),
            app_process: "kiosk-app".to_string(),
            health_url: "http://127.0.0.1:8080/health".to_string(),
            expected_payload: "ok".to_string(),
            http_timeout_secs: 10,
            memory_warning_percent: 80.0,
            memory_critical_percent: 90.0,
            disk_warning_percent: 80.0,
            disk_critical_percent: 90.0,
            disk_paths: Vec::new(),
            dns_probe_host: "example.com".to_string(),
            reachability_target: "1.1.1.1:53".to_string(),
            network_timeout_secs: 5,
            sysfs_net_dir: PathBuf::from("/sys/class/net"),
            surface_command: vec!["xset".into(), "-display".into(), ":0".into(), "q".into()],
            window_command: Vec::new(),
            command_timeout_secs: 30,
            restart_settle_secs: 5,
            watchdog_device: PathBuf::from("/dev/watchdog"),
            app_cache_dirs: Vec::new(),
            temp_dirs: vec![PathBuf::from("/tmp")],
            temp_max_age_hours: 24,
            drop_caches_path: PathBuf::from("/proc/sys/vm/drop_caches"),
            log_retention_days: 14,
            log_max_bytes: 10 * 1024 * 1024,
            recovery_keep_backups: 3,
            cooldowns: CooldownConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Identical messages inside this window are suppressed.
    pub spam_window_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            spam_window_secs: 300,
        }
    }
}

impl EngineConfig {
    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<(), EngineError> {
        let h = &self.health;
        check_thresholds("memory", h.memory_warning_percent, h.memory_critical_percent)?;
        check_thresholds("disk", h.disk_warning_percent, h.disk_critical_percent)?;
        if self.content.keep_backups == 0 {
            return Err(EngineError::Config("content.keep_backups must be at least 1".into()));
        }
        if self.content.max_time_secs == 0 || self.content.connect_timeout_secs == 0 {
            return Err(EngineError::Config("download timeouts must be non-zero".into()));
        }
        if let Some(url) = &self.content.manifest_url
            && url.trim().is_empty()
        {
            return Err(EngineError::Config("content.manifest_url is empty".into()));
        }
        self.content.bandwidth_bytes_per_sec()?;
        Ok(())
    }
}

fn check_thresholds(name: &str, warning: f64, critical: f64) -> Result<(), EngineError> {
    if warning > 0.0 && warning < critical && critical <= 100.0 {
        Ok(())
    } else {
        Err(EngineError::Config(format!(
            "{name} thresholds must satisfy 0 < warning ({warning}) < critical ({critical}) <= 100"
        )))
    }
}

/// Load configuration for this invocation.
///
/// An explicit path must exist; otherwise [`DEFAULT_CONFIG_PATH`] is used
/// when present and built-in defaults when it is not.
pub fn load(explicit: Option<&Path>) -> Result<EngineConfig, EngineError> {
    let mut cfg = match explicit {
        Some(path) => {
            if !path.exists() {
                return Err(EngineError::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            load_from(path)?
        }
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                load_from(default_path)?
            } else {
                EngineConfig::default()
            }
        }
    };
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Load and parse a specific TOML file without env overrides.
pub fn load_from(path: &Path) -> Result<EngineConfig, EngineError> {
    let raw = fs::read_to_string(path).map_err(|e| {
        EngineError::Config(format!("failed to read config at {}: {}", path.display(), e))
    })?;
    from_toml_str(&raw)
}

pub fn from_toml_str(raw: &str) -> Result<EngineConfig, EngineError> {
    toml::from_str(raw).map_err(|e| EngineError::Config(format!("failed to parse config: {e}")))
}

/// Apply `KIOSK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `KIOSK_MANIFEST_URL` | `content.manifest_url` |
/// | `KIOSK_CONTENT_ROOT` | `paths.content_root` |
/// | `KIOSK_STATE_DIR` | `paths.state_dir` |
/// | `KIOSK_LOG_DIR` | `paths.log_dir` |
/// | `KIOSK_RUNTIME_DIR` | `paths.runtime_dir` |
/// | `KIOSK_HEALTH_URL` | `health.health_url` |
pub fn apply_env_overrides(cfg: &mut EngineConfig) {
    if let Ok(v) = std::env::var("KIOSK_MANIFEST_URL") {
        cfg.content.manifest_url = Some(v);
    }
    if let Ok(v) = std::env::var("KIOSK_CONTENT_ROOT") {
        cfg.paths.content_root = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("KIOSK_STATE_DIR") {
        cfg.paths.state_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("KIOSK_LOG_DIR") {
        cfg.paths.log_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("KIOSK_RUNTIME_DIR") {
        cfg.paths.runtime_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("KIOSK_HEALTH_URL") {
        cfg.health.health_url = v;
    }
}
