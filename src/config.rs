use crate::alerts::{AlertEngine, AlertRule, RuleError};
use crate::collectors::process::ProcessSortMode;
use crate::poller::{RetentionPolicy, TickSettings, MIN_INTERVAL_MS};
use crate::rates::CounterWidth;
use crate::sensors::matchers::{MatchRule, SensorMatchers};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub sensors: SensorsConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_top_processes")]
    pub top_processes: usize,
    #[serde(default)]
    pub process_sort: ProcessSortMode,
    #[serde(default = "default_stale_after_ticks")]
    pub stale_after_ticks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendChoice {
    /// LibreHardwareMonitor first where it exists, then the native reader.
    #[default]
    Auto,
    Lhm,
    Native,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SensorsConfig {
    #[serde(default)]
    pub backend: BackendChoice,
    /// Replaces the built-in label table when non-empty.
    #[serde(default)]
    pub matchers: Vec<MatchRule>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    #[serde(default = "default_counter_width")]
    pub counter_width: u8,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertsConfig {
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub rules: Vec<AlertRule>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_enabled")]
    pub enabled: bool,
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LayoutConfig {
    #[serde(default = "default_layout_path")]
    pub path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            polling: PollingConfig::default(),
            sensors: SensorsConfig::default(),
            network: NetworkConfig::default(),
            alerts: AlertsConfig::default(),
            storage: StorageConfig::default(),
            layout: LayoutConfig::default(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            top_processes: default_top_processes(),
            process_sort: ProcessSortMode::default(),
            stale_after_ticks: default_stale_after_ticks(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            counter_width: default_counter_width(),
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            rules: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: default_storage_enabled(),
            path: default_storage_path(),
            retention_days: default_retention_days(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            path: default_layout_path(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl From<RuleError> for ConfigError {
    fn from(err: RuleError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Like `load_from_file`, but a file that does not exist yields the
    /// defaults. `bool` tells whether the file was found.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<(Self, bool), ConfigError> {
        match Self::load_from_file(path) {
            Ok(cfg) => Ok((cfg, true)),
            Err(ConfigError::Read { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                Ok((Self::default(), false))
            }
            Err(err) => Err(err),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.polling.interval_ms < MIN_INTERVAL_MS {
            return Err(ConfigError::Validation(format!(
                "polling.interval_ms must be >= {MIN_INTERVAL_MS}"
            )));
        }
        if self.polling.stale_after_ticks == 0 {
            return Err(ConfigError::Validation(
                "polling.stale_after_ticks must be >= 1".to_string(),
            ));
        }
        if CounterWidth::from_bits(self.network.counter_width).is_none() {
            return Err(ConfigError::Validation(
                "network.counter_width must be 32 or 64".to_string(),
            ));
        }
        if self.storage.enabled {
            if self.storage.path.as_os_str().is_empty() {
                return Err(ConfigError::Validation("storage.path is required".to_string()));
            }
            if self.storage.retention_days == 0 {
                return Err(ConfigError::Validation(
                    "storage.retention_days must be >= 1".to_string(),
                ));
            }
            if self.storage.cleanup_interval_secs == 0 {
                return Err(ConfigError::Validation(
                    "storage.cleanup_interval_secs must be >= 1".to_string(),
                ));
            }
        }

        self.alert_engine()?;
        Ok(())
    }

    pub fn tick_settings(&self) -> TickSettings {
        TickSettings {
            interval: Duration::from_millis(self.polling.interval_ms),
            top_processes: self.polling.top_processes,
            process_sort: self.polling.process_sort,
        }
    }

    pub fn counter_width(&self) -> CounterWidth {
        CounterWidth::from_bits(self.network.counter_width).unwrap_or_default()
    }

    pub fn matchers(&self) -> SensorMatchers {
        if self.sensors.matchers.is_empty() {
            SensorMatchers::default()
        } else {
            SensorMatchers::new(self.sensors.matchers.clone())
        }
    }

    /// Builds the engine with every configured rule, rejecting the first
    /// out-of-range threshold.
    pub fn alert_engine(&self) -> Result<AlertEngine, RuleError> {
        let mut engine = AlertEngine::new(Duration::from_secs(self.alerts.cooldown_secs));
        for rule in &self.alerts.rules {
            engine.add_rule(*rule)?;
        }
        Ok(engine)
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            retention_days: self.storage.retention_days,
            every: Duration::from_secs(self.storage.cleanup_interval_secs),
        }
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn default_listen() -> String {
    "127.0.0.1:9184".to_string()
}

const fn default_interval_ms() -> u64 {
    1000
}

const fn default_top_processes() -> usize {
    10
}

const fn default_stale_after_ticks() -> u64 {
    60
}

const fn default_counter_width() -> u8 {
    32
}

const fn default_cooldown_secs() -> u64 {
    60
}

const fn default_storage_enabled() -> bool {
    true
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data/hwmonitor.db")
}

const fn default_retention_days() -> u32 {
    30
}

const fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_layout_path() -> PathBuf {
    PathBuf::from("data/layout.json")
}
