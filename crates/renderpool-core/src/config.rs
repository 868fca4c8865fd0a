//! Configuration resolution for renderpool.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`$XDG_CONFIG_HOME/renderpool/settings.json`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`RENDERPOOL_*`)
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files may be partial; a key present in a later layer replaces the same key
//! from an earlier one and everything else is inherited.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete renderpool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// First port of the worker port range (inclusive).
    pub port_range_start: u16,
    /// Last port of the worker port range (inclusive).
    pub port_range_end: u16,
    /// Maximum number of workers running at once.
    pub max_concurrent: u32,
    /// Workers bound to no job newer than this are reclaimed by the sweeper.
    pub inactivity_threshold_hours: f64,
    /// Seconds between background inactivity sweeps.
    pub sweep_interval_secs: u64,
    /// Worker executable, resolved through `PATH` unless absolute.
    pub worker_binary: PathBuf,
    /// Extra arguments placed before the port flag.
    pub worker_args: Vec<String>,
    /// Flag that tells the worker which port to listen on.
    pub port_flag: String,
    /// Host name handed to clients in connection strings.
    pub host: String,
    /// Delay before checking that a freshly spawned worker is still alive.
    pub liveness_check_delay_ms: u64,
    /// How long to wait for exit after SIGTERM.
    pub graceful_timeout_secs: u64,
    /// How long to wait for exit after SIGKILL.
    pub forceful_timeout_secs: u64,
    /// Directory holding one stderr log per worker port. Defaults to a
    /// `logs` directory next to the database.
    pub worker_log_dir: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            port_range_start: 11111,
            port_range_end: 11116,
            max_concurrent: 3,
            inactivity_threshold_hours: 4.0,
            sweep_interval_secs: 15 * 60,
            worker_binary: PathBuf::from("pvserver"),
            worker_args: Vec::new(),
            port_flag: "--server-port".to_string(),
            host: "localhost".to_string(),
            liveness_check_delay_ms: 1000,
            graceful_timeout_secs: 5,
            forceful_timeout_secs: 5,
            worker_log_dir: None,
        }
    }
}

impl PoolConfig {
    pub const fn liveness_check_delay(&self) -> Duration {
        Duration::from_millis(self.liveness_check_delay_ms)
    }

    pub const fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_secs)
    }

    pub const fn forceful_timeout(&self) -> Duration {
        Duration::from_secs(self.forceful_timeout_secs)
    }

    /// Worker log directory, falling back to the system temp directory when
    /// nothing resolved one.
    pub fn worker_log_dir(&self) -> PathBuf {
        self.worker_log_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("renderpool-workers"))
    }

    /// Number of ports in the configured range.
    pub fn port_count(&self) -> usize {
        if self.port_range_end < self.port_range_start {
            return 0;
        }
        usize::from(self.port_range_end - self.port_range_start) + 1
    }
}

/// Daemon-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    pub database_path: Option<PathBuf>,
    /// Unix socket `serve` listens on. Defaults to `renderpool.sock` next to
    /// the database.
    pub control_socket: Option<PathBuf>,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            control_socket: None,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl Config {
    /// Reject settings the pool cannot operate with.
    pub fn validate(&self) -> Result<()> {
        let pool = &self.pool;
        if pool.port_range_start == 0 {
            return Err(Error::Config("port_range_start must be non-zero".to_string()));
        }
        if pool.port_range_end < pool.port_range_start {
            return Err(Error::Config(format!(
                "port range is inverted: {}-{}",
                pool.port_range_start, pool.port_range_end
            )));
        }
        if pool.max_concurrent == 0 {
            return Err(Error::Config("max_concurrent must be at least 1".to_string()));
        }
        if !(pool.inactivity_threshold_hours.is_finite() && pool.inactivity_threshold_hours > 0.0)
        {
            return Err(Error::Config(
                "inactivity_threshold_hours must be a positive number".to_string(),
            ));
        }
        if pool.sweep_interval_secs == 0 {
            return Err(Error::Config("sweep_interval_secs must be at least 1".to_string()));
        }
        if pool.worker_binary.as_os_str().is_empty() {
            return Err(Error::Config("worker_binary must not be empty".to_string()));
        }
        if pool.port_flag.is_empty() {
            return Err(Error::Config("port_flag must not be empty".to_string()));
        }
        Ok(())
    }

    /// Resolved database location: explicit setting or the per-user default.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.daemon.database_path.clone().or_else(database_path)
    }

    /// Fill in every location derived from the database path that was not
    /// set explicitly.
    pub fn resolve_paths(&mut self, database: &Path) {
        let dir = database.parent().unwrap_or_else(|| Path::new("."));
        if self.daemon.control_socket.is_none() {
            self.daemon.control_socket = Some(dir.join("renderpool.sock"));
        }
        if self.pool.worker_log_dir.is_none() {
            self.pool.worker_log_dir = Some(dir.join("logs"));
        }
    }
}

/// Lock file that serialises pool mutations across processes sharing
/// `database`.
pub fn lock_path(database: &Path) -> PathBuf {
    let mut name = database.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit_path: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            merge_values(&mut merged, load_config_value(&global_path)?);
        }
    }

    if let Some(path) = explicit_path {
        merge_values(&mut merged, load_config_value(path)?);
    }

    let mut config: Config = serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("renderpool").join("settings.json"))
}

/// Get the default database path for the daemon.
pub fn database_path() -> Option<PathBuf> {
    config_dir()
        .map(|p| p.join("renderpool").join("workers.db"))
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".renderpool").join("workers.db"))
        })
}

fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
    }
}

fn load_config_value(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        key: &str,
    ) -> Option<T> {
        lookup(key).and_then(|v| v.trim().parse().ok())
    }

    if let Some(n) = parsed(&lookup, "RENDERPOOL_PORT_RANGE_START") {
        config.pool.port_range_start = n;
    }
    if let Some(n) = parsed(&lookup, "RENDERPOOL_PORT_RANGE_END") {
        config.pool.port_range_end = n;
    }
    if let Some(n) = parsed(&lookup, "RENDERPOOL_MAX_CONCURRENT") {
        config.pool.max_concurrent = n;
    }
    if let Some(n) = parsed(&lookup, "RENDERPOOL_INACTIVITY_THRESHOLD_HOURS") {
        config.pool.inactivity_threshold_hours = n;
    }
    if let Some(n) = parsed(&lookup, "RENDERPOOL_SWEEP_INTERVAL_SECS") {
        config.pool.sweep_interval_secs = n;
    }
    if let Some(val) = lookup("RENDERPOOL_WORKER_BINARY") {
        config.pool.worker_binary = PathBuf::from(val);
    }
    if let Some(val) = lookup("RENDERPOOL_HOST") {
        config.pool.host = val;
    }
    if let Some(n) = parsed(&lookup, "RENDERPOOL_LIVENESS_CHECK_DELAY_MS") {
        config.pool.liveness_check_delay_ms = n;
    }
    if let Some(n) = parsed(&lookup, "RENDERPOOL_GRACEFUL_TIMEOUT_SECS") {
        config.pool.graceful_timeout_secs = n;
    }
    if let Some(n) = parsed(&lookup, "RENDERPOOL_FORCEFUL_TIMEOUT_SECS") {
        config.pool.forceful_timeout_secs = n;
    }
    if let Some(val) = lookup("RENDERPOOL_WORKER_LOG_DIR") {
        config.pool.worker_log_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("RENDERPOOL_SOCKET") {
        config.daemon.control_socket = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("RENDERPOOL_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
}
