//! Configuration types for gpubal
//!
//! Settings are read once at startup from an optional TOML file and the
//! process environment (environment wins), validated, and never mutated
//! afterwards. Keys are the lowercase form of the environment names, so
//! `BALANCE_INTERVAL=30` and `balance_interval = 30` in the file are
//! equivalent.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::{BalanceError, BalanceResult, DeviceId};

/// Rebalancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStrategy {
    /// Only steer future admission decisions
    #[default]
    NoMigration,
    /// Also request migration of running work (requires `ENABLE_MIGRATION`)
    ProcessMigration,
}

impl std::fmt::Display for BalanceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BalanceStrategy::NoMigration => write!(f, "no_migration"),
            BalanceStrategy::ProcessMigration => write!(f, "process_migration"),
        }
    }
}

impl std::str::FromStr for BalanceStrategy {
    type Err = BalanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_migration" => Ok(BalanceStrategy::NoMigration),
            "process_migration" => Ok(BalanceStrategy::ProcessMigration),
            other => Err(BalanceError::ConfigInvalid(format!(
                "unknown balance strategy '{}' (expected no_migration or process_migration)",
                other
            ))),
        }
    }
}

/// Capacity ceilings and load thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Minimum free memory for a device to accept work
    pub min_free_mem_mb: u64,
    /// Hard utilization ceiling for allocation
    pub max_util_pct: f64,
    /// Hard temperature ceiling
    pub max_temp_c: u32,
    /// Below this a device counts as underloaded
    pub util_low: f64,
    /// Above this a device counts as overloaded
    pub util_high: f64,
    /// Derive per-device low/high from utilization history
    pub adaptive: bool,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            min_free_mem_mb: 2000,
            max_util_pct: 90.0,
            max_temp_c: 85,
            util_low: 50.0,
            util_high: 85.0,
            adaptive: false,
        }
    }
}

impl ThresholdConfig {
    /// Reject contradictory threshold combinations
    pub fn validate(&self) -> BalanceResult<()> {
        for (name, value) in [
            ("MAX_GPU_UTIL", self.max_util_pct),
            ("UTIL_LOW", self.util_low),
            ("UTIL_HIGH", self.util_high),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(BalanceError::ConfigInvalid(format!(
                    "{} must be within 0-100, got {}",
                    name, value
                )));
            }
        }
        if self.util_low >= self.util_high {
            return Err(BalanceError::ConfigInvalid(format!(
                "UTIL_LOW ({}) must be below UTIL_HIGH ({})",
                self.util_low, self.util_high
            )));
        }
        if self.util_high > self.max_util_pct {
            return Err(BalanceError::ConfigInvalid(format!(
                "UTIL_HIGH ({}) must not exceed MAX_GPU_UTIL ({})",
                self.util_high, self.max_util_pct
            )));
        }
        Ok(())
    }
}

/// Shared state store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    pub url: String,
    /// Timeout applied to every store round trip
    pub timeout: Duration,
    /// Attempts per operation before reporting `StoreUnavailable`
    pub retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            timeout: Duration::from_secs(2),
            retries: 3,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Process-wide configuration, immutable after load
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceConfig {
    /// Admission logic on/off; off means "all detected devices"
    pub enabled: bool,
    /// Collector poll interval
    pub poll_interval: Duration,
    /// Expiry of published snapshots
    pub metrics_ttl: Duration,
    /// Balance daemon cycle interval
    pub balance_interval: Duration,
    pub strategy: BalanceStrategy,
    pub enable_migration: bool,
    pub thresholds: ThresholdConfig,
    /// Utilization samples kept per device for adaptive thresholds
    pub history_len: usize,
    /// Static device list used when balancing is off or the store is down
    pub static_devices: Vec<DeviceId>,
    /// Per-device telemetry query timeout
    pub telemetry_timeout: Duration,
    /// Registered processes silent for longer than this are considered dead
    pub heartbeat_timeout: Duration,
    /// Grace period for a daemon to drain on stop
    pub shutdown_grace: Duration,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: Duration::from_secs(5),
            metrics_ttl: Duration::from_secs(15),
            balance_interval: Duration::from_secs(60),
            strategy: BalanceStrategy::NoMigration,
            enable_migration: false,
            thresholds: ThresholdConfig::default(),
            history_len: 60,
            static_devices: Vec::new(),
            telemetry_timeout: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl BalanceConfig {
    /// Load from an optional TOML file overlaid with the process environment
    pub fn load(path: Option<&Path>) -> BalanceResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let settings: Settings = builder
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        Self::from_settings(settings)
    }

    /// Load from an explicit set of environment-style variables
    pub fn from_vars(vars: HashMap<String, String>) -> BalanceResult<Self> {
        let source: config::Map<String, String> = vars.into_iter().collect();
        let settings: Settings = config::Config::builder()
            .add_source(environment().source(Some(source)))
            .build()?
            .try_deserialize()?;
        Self::from_settings(settings)
    }

    /// Migration is requested only when both the strategy and the switch agree
    pub fn migration_enabled(&self) -> bool {
        self.strategy == BalanceStrategy::ProcessMigration && self.enable_migration
    }

    /// Validate cross-field invariants
    pub fn validate(&self) -> BalanceResult<()> {
        self.thresholds.validate()?;
        if self.metrics_ttl < self.poll_interval * 2 {
            return Err(BalanceError::ConfigInvalid(format!(
                "GPU_METRICS_TTL ({:?}) must be at least twice GPU_MONITOR_INTERVAL ({:?})",
                self.metrics_ttl, self.poll_interval
            )));
        }
        if self.history_len < 2 {
            return Err(BalanceError::ConfigInvalid(
                "GPU_HISTORY_LEN must be at least 2".to_string(),
            ));
        }
        if self.store.retries == 0 {
            return Err(BalanceError::ConfigInvalid(
                "STORE_RETRIES must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn from_settings(s: Settings) -> BalanceResult<Self> {
        let poll_interval = seconds("GPU_MONITOR_INTERVAL", s.gpu_monitor_interval)?;
        let metrics_ttl = match s.gpu_metrics_ttl {
            Some(ttl) => seconds("GPU_METRICS_TTL", ttl)?,
            None => poll_interval * 3,
        };

        let config = Self {
            enabled: s.gpu_balancing_enabled,
            poll_interval,
            metrics_ttl,
            balance_interval: seconds("BALANCE_INTERVAL", s.balance_interval)?,
            strategy: s.balance_strategy,
            enable_migration: s.enable_migration,
            thresholds: ThresholdConfig {
                min_free_mem_mb: s.min_gpu_memory,
                max_util_pct: s.max_gpu_util,
                max_temp_c: s.max_gpu_temp,
                util_low: s.util_low,
                util_high: s.util_high,
                adaptive: s.adaptive_thresholds,
            },
            history_len: s.gpu_history_len,
            static_devices: parse_device_list(s.gpu_devices.as_deref().unwrap_or(""))?,
            telemetry_timeout: seconds("TELEMETRY_TIMEOUT", s.telemetry_timeout)?,
            heartbeat_timeout: seconds("HEARTBEAT_TIMEOUT", s.heartbeat_timeout)?,
            shutdown_grace: seconds("SHUTDOWN_TIMEOUT", s.shutdown_timeout)?,
            store: StoreConfig {
                url: s.redis_url,
                timeout: seconds("STORE_TIMEOUT", s.store_timeout)?,
                retries: s.store_retries,
            },
            logging: LoggingConfig {
                level: s.log_level,
                format: s.log_format,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

/// Parse a comma separated device list such as `0,1,3`
pub fn parse_device_list(raw: &str) -> BalanceResult<Vec<DeviceId>> {
    let mut devices = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let id = part.parse().map_err(|_| {
            BalanceError::ConfigInvalid(format!("invalid device id '{}' in GPU_DEVICES", part))
        })?;
        if !devices.contains(&id) {
            devices.push(id);
        }
    }
    Ok(devices)
}

fn environment() -> config::Environment {
    config::Environment::default()
        .try_parsing(true)
        .ignore_empty(true)
}

fn seconds(name: &str, value: f64) -> BalanceResult<Duration> {
    if !(value > 0.0) {
        return Err(BalanceError::ConfigInvalid(format!(
            "{} must be a positive number of seconds, got {}",
            name, value
        )));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|e| BalanceError::ConfigInvalid(format!("{}: {}", name, e)))
}

/// Flat raw settings as they appear in the environment / TOML file
#[derive(Debug, Deserialize)]
struct Settings {
    #[serde(default)]
    gpu_balancing_enabled: bool,
    #[serde(default = "default_monitor_interval")]
    gpu_monitor_interval: f64,
    #[serde(default)]
    gpu_metrics_ttl: Option<f64>,
    #[serde(default = "default_balance_interval")]
    balance_interval: f64,
    #[serde(default)]
    balance_strategy: BalanceStrategy,
    #[serde(default)]
    enable_migration: bool,
    #[serde(default = "default_min_gpu_memory")]
    min_gpu_memory: u64,
    #[serde(default = "default_max_gpu_util")]
    max_gpu_util: f64,
    #[serde(default = "default_util_low")]
    util_low: f64,
    #[serde(default = "default_util_high")]
    util_high: f64,
    #[serde(default = "default_max_gpu_temp")]
    max_gpu_temp: u32,
    #[serde(default)]
    adaptive_thresholds: bool,
    #[serde(default = "default_history_len")]
    gpu_history_len: usize,
    #[serde(default)]
    gpu_devices: Option<String>,
    #[serde(default = "default_timeout")]
    telemetry_timeout: f64,
    #[serde(default = "default_heartbeat_timeout")]
    heartbeat_timeout: f64,
    #[serde(default = "default_timeout")]
    store_timeout: f64,
    #[serde(default = "default_store_retries")]
    store_retries: u32,
    #[serde(default = "default_shutdown_timeout")]
    shutdown_timeout: f64,
    #[serde(default = "default_redis_url")]
    redis_url: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_log_format")]
    log_format: String,
}

fn default_monitor_interval() -> f64 {
    5.0
}

fn default_balance_interval() -> f64 {
    60.0
}

fn default_min_gpu_memory() -> u64 {
    2000
}

fn default_max_gpu_util() -> f64 {
    90.0
}

fn default_util_low() -> f64 {
    50.0
}

fn default_util_high() -> f64 {
    85.0
}

fn default_max_gpu_temp() -> u32 {
    85
}

fn default_history_len() -> usize {
    60
}

fn default_timeout() -> f64 {
    2.0
}

fn default_heartbeat_timeout() -> f64 {
    30.0
}

fn default_store_retries() -> u32 {
    3
}

fn default_shutdown_timeout() -> f64 {
    30.0
}

fn default_redis_url() -> String {
    StoreConfig::default().url
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = BalanceConfig::from_vars(HashMap::new()).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.balance_interval, Duration::from_secs(60));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.metrics_ttl, Duration::from_secs(15));
        assert_eq!(config.strategy, BalanceStrategy::NoMigration);
        assert!(!config.enable_migration);
        assert_eq!(config.thresholds, ThresholdConfig::default());
        assert!(config.static_devices.is_empty());
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_environment_overrides() {
        let config = BalanceConfig::from_vars(vars(&[
            ("GPU_BALANCING_ENABLED", "true"),
            ("BALANCE_INTERVAL", "30"),
            ("BALANCE_STRATEGY", "process_migration"),
            ("ENABLE_MIGRATION", "true"),
            ("MIN_GPU_MEMORY", "4000"),
            ("UTIL_LOW", "40"),
            ("ADAPTIVE_THRESHOLDS", "true"),
            ("GPU_DEVICES", "0,2,3"),
            ("HEARTBEAT_TIMEOUT", "45"),
        ]))
        .unwrap();

        assert!(config.enabled);
        assert_eq!(config.balance_interval, Duration::from_secs(30));
        assert!(config.migration_enabled());
        assert_eq!(config.thresholds.min_free_mem_mb, 4000);
        assert_eq!(config.thresholds.util_low, 40.0);
        assert!(config.thresholds.adaptive);
        assert_eq!(config.static_devices, vec![0, 2, 3]);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(45));
    }

    #[test]
    fn test_migration_requires_both_switches() {
        let config =
            BalanceConfig::from_vars(vars(&[("BALANCE_STRATEGY", "process_migration")])).unwrap();
        assert!(!config.migration_enabled());

        let config = BalanceConfig::from_vars(vars(&[("ENABLE_MIGRATION", "true")])).unwrap();
        assert!(!config.migration_enabled());
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let result = BalanceConfig::from_vars(vars(&[("BALANCE_STRATEGY", "round_robin")]));
        assert!(matches!(result, Err(BalanceError::ConfigInvalid(_))));
    }

    #[test]
    fn test_contradictory_thresholds_rejected() {
        let result = BalanceConfig::from_vars(vars(&[("UTIL_LOW", "90"), ("UTIL_HIGH", "60")]));
        assert!(matches!(result, Err(BalanceError::ConfigInvalid(_))));

        let result = BalanceConfig::from_vars(vars(&[("UTIL_HIGH", "95")]));
        assert!(matches!(result, Err(BalanceError::ConfigInvalid(_))));
    }

    #[test]
    fn test_ttl_must_cover_a_missed_poll() {
        let result = BalanceConfig::from_vars(vars(&[
            ("GPU_MONITOR_INTERVAL", "10"),
            ("GPU_METRICS_TTL", "12"),
        ]));
        assert!(matches!(result, Err(BalanceError::ConfigInvalid(_))));

        let config = BalanceConfig::from_vars(vars(&[("GPU_MONITOR_INTERVAL", "10")])).unwrap();
        assert_eq!(config.metrics_ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = BalanceConfig::from_vars(vars(&[("BALANCE_INTERVAL", "0")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_device_list() {
        assert_eq!(parse_device_list("").unwrap(), Vec::<DeviceId>::new());
        assert_eq!(parse_device_list(" 1, 0 ,1").unwrap(), vec![1, 0]);
        assert!(parse_device_list("0,gpu1").is_err());
    }

    #[test]
    fn test_strategy_display_roundtrip() {
        for strategy in [BalanceStrategy::NoMigration, BalanceStrategy::ProcessMigration] {
            assert_eq!(strategy.to_string().parse::<BalanceStrategy>().unwrap(), strategy);
        }
    }

    #[test]
    fn test_toml_file_layer() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gpubal.toml");
        std::fs::write(
            &path,
            "balance_interval = 15\nutil_low = 30\nbalance_strategy = \"process_migration\"\n",
        )
        .unwrap();

        let config = BalanceConfig::load(Some(&path)).unwrap();
        assert_eq!(config.balance_interval, Duration::from_secs(15));
        assert_eq!(config.thresholds.util_low, 30.0);
        assert_eq!(config.strategy, BalanceStrategy::ProcessMigration);

        assert!(BalanceConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
