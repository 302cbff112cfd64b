use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

// Scheduler defaults — one run window is ten minutes, polled every second
pub const DEFAULT_WINDOW_SECS: u64 = 600;
pub const DEFAULT_TICK_SECS: u64 = 1;
pub const DEFAULT_CONNECT_RETRY_SECS: u64 = 5;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 30;
pub const DEFAULT_LOCK_POLL_MS: u64 = 100;
pub const DEFAULT_MAINTENANCE_SCHEDULE: &str = "30 3 * * *";
pub const DEFAULT_FAILED_RETENTION_DAYS: u64 = 30;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// The scheduler refuses to start when the database is disabled.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// SQLite busy timeout applied to every connection.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    /// Create the directory that will hold the database file.
    pub fn ensure_parent_dir(&self) -> Result<()> {
        match std::path::Path::new(&self.path).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                std::fs::create_dir_all(parent)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            enabled: true,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// Scheduler loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Wall-clock length of one run before the process exits for relaunch.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Sleep between two dispatch attempts.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Fixed delay between store connectivity probes at startup.
    #[serde(default = "default_connect_retry_secs")]
    pub connect_retry_secs: u64,
    /// Run one task discovery pass before dispatching.
    #[serde(default = "bool_true")]
    pub discover_on_start: bool,
    /// When set, `processing` jobs untouched for this long are marked failed
    /// at startup. Leave unset when handlers may legitimately run that long.
    #[serde(default)]
    pub stale_processing_secs: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_WINDOW_SECS,
            tick_secs: DEFAULT_TICK_SECS,
            connect_retry_secs: DEFAULT_CONNECT_RETRY_SECS,
            discover_on_start: true,
            stale_processing_secs: None,
        }
    }
}

impl SchedulerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_secs(self.connect_retry_secs)
    }

    pub fn stale_processing(&self) -> Option<Duration> {
        self.stale_processing_secs.map(Duration::from_secs)
    }
}

/// Distributed lock lease settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease length. A holder that dies loses the lock after this long.
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_lock_poll_ms")]
    pub poll_interval_ms: u64,
    /// Give up acquiring after this long. Unset means wait until acquired.
    #[serde(default)]
    pub acquire_timeout_secs: Option<u64>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_LOCK_TTL_SECS,
            poll_interval_ms: DEFAULT_LOCK_POLL_MS,
            acquire_timeout_secs: None,
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_secs.map(Duration::from_secs)
    }
}

/// Built-in housekeeping handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Cron expression for the daily purge.
    #[serde(default = "default_maintenance_schedule")]
    pub schedule: String,
    #[serde(default = "default_failed_retention_days")]
    pub failed_retention_days: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: default_maintenance_schedule(),
            failed_retention_days: DEFAULT_FAILED_RETENTION_DAYS,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_window_secs() -> u64 {
    DEFAULT_WINDOW_SECS
}
fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_connect_retry_secs() -> u64 {
    DEFAULT_CONNECT_RETRY_SECS
}
fn default_lock_ttl_secs() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}
fn default_lock_poll_ms() -> u64 {
    DEFAULT_LOCK_POLL_MS
}
fn default_maintenance_schedule() -> String {
    DEFAULT_MAINTENANCE_SCHEDULE.to_string()
}
fn default_failed_retention_days() -> u64 {
    DEFAULT_FAILED_RETENTION_DAYS
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. CADENCE_CONFIG env var
    ///   3. ~/.cadence/cadence.toml
    ///
    /// A missing file is not an error: every key has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("CADENCE_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        // nested keys use a double underscore: CADENCE_SCHEDULER__WINDOW_SECS
        Self::from_figment(
            Figment::from(Serialized::defaults(CadenceConfig::default()))
                .merge(Toml::file(&path))
                .merge(Env::prefixed("CADENCE_").split("__")),
        )
    }

    /// Extract and validate a config from an already assembled figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: CadenceConfig = figment
            .extract()
            .map_err(|e| CadenceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the scheduler spin or never run.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.window_secs == 0 {
            return Err(CadenceError::Config(
                "scheduler.window_secs must be greater than zero".into(),
            ));
        }
        if self.lock.ttl_secs == 0 {
            return Err(CadenceError::Config(
                "lock.ttl_secs must be greater than zero".into(),
            ));
        }
        if self.lock.poll_interval_ms == 0 {
            return Err(CadenceError::Config(
                "lock.poll_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// The scheduler persists everything; it cannot run without a database.
    pub fn require_database(&self) -> Result<&DatabaseConfig> {
        if !self.database.enabled {
            return Err(CadenceError::Config(
                "the scheduler requires database.enabled = true".into(),
            ));
        }
        if self.database.path.trim().is_empty() {
            return Err(CadenceError::Config("database.path is empty".into()));
        }
        Ok(&self.database)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
