//! Configuration vault – reads/writes `~/.weighgate/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use weighgate_kernel::StateMachineConfig;
use weighgate_memory::RecordStoreConfig;
use weighgate_memory::sqlite::validate_table_name;
use weighgate_middleware::{ScaleProcessorConfig, SignalBusConfig};
use weighgate_runtime::StationConfig;
use weighgate_types::StationError;

/// Which panel driver the station uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Hardware {
    /// In-process panel and scale simulators.
    #[default]
    Sim,
    /// Indicator panel on a real serial port.
    Serial,
}

impl std::fmt::Display for Hardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Hardware::Sim => write!(f, "sim"),
            Hardware::Serial => write!(f, "serial"),
        }
    }
}

impl std::str::FromStr for Hardware {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sim" => Ok(Hardware::Sim),
            "serial" => Ok(Hardware::Serial),
            other => Err(format!("unknown hardware mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleSection {
    pub port: String,
    pub polling_interval_ms: u64,
    pub stable_threshold: u32,
    pub unstable_threshold: u32,
}

impl Default for ScaleSection {
    fn default() -> Self {
        Self {
            port: "sim-scale".to_string(),
            polling_interval_ms: 200,
            stable_threshold: 3,
            unstable_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelSection {
    pub port: String,
    pub baud_rate: u32,
    pub reconnect_interval_ms: u64,
    pub send_timeout_ms: u64,
}

impl Default for PanelSection {
    fn default() -> Self {
        Self {
            port: default_panel_port(),
            baud_rate: 9600,
            reconnect_interval_ms: 1000,
            send_timeout_ms: 500,
        }
    }
}

fn default_panel_port() -> String {
    if cfg!(windows) {
        "COM3".to_string()
    } else {
        "/dev/ttyUSB0".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// SQLite file; relative paths resolve against the working directory.
    pub path: String,
    pub table: String,
    pub max_retry_queue_size: usize,
    pub alarm_size: usize,
    pub retry_interval_ms: u64,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: "weighgate.db".to_string(),
            table: "Weighings".to_string(),
            max_retry_queue_size: 100,
            alarm_size: 50,
            retry_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSection {
    pub min_weight: f64,
    pub hyst_weight: f64,
    pub zero_band: f64,
    pub semaphore_time_ms: u64,
    pub block_recording_on_db_failure: bool,
    pub hardware: Hardware,
}

impl Default for SystemSection {
    fn default() -> Self {
        Self {
            min_weight: 5.0,
            hyst_weight: 0.1,
            zero_band: 0.1,
            semaphore_time_ms: 4000,
            block_recording_on_db_failure: false,
            hardware: Hardware::Sim,
        }
    }
}

/// Persisted station configuration.  Missing keys take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scale: ScaleSection,
    pub panel: PanelSection,
    pub database: DatabaseSection,
    pub system: SystemSection,
}

impl Config {
    /// Reject values the components cannot work with.
    pub fn validate(&self) -> Result<(), StationError> {
        let invalid = |msg: String| Err(StationError::InvalidConfig(msg));
        if self.scale.stable_threshold == 0 || self.scale.unstable_threshold == 0 {
            return invalid("stability thresholds must be at least 1".to_string());
        }
        if self.scale.polling_interval_ms == 0 {
            return invalid("scale.polling_interval_ms must be positive".to_string());
        }
        if self.panel.reconnect_interval_ms == 0 {
            return invalid("panel.reconnect_interval_ms must be positive".to_string());
        }
        let sys = &self.system;
        if !(sys.min_weight.is_finite() && sys.min_weight > 0.0) {
            return invalid(format!("system.min_weight {} must be positive", sys.min_weight));
        }
        if !(sys.hyst_weight.is_finite() && sys.hyst_weight >= 0.0) {
            return invalid(format!("system.hyst_weight {} must not be negative", sys.hyst_weight));
        }
        if sys.hyst_weight >= sys.min_weight {
            return invalid(format!(
                "system.hyst_weight {} must be below min_weight {}",
                sys.hyst_weight, sys.min_weight
            ));
        }
        if !(sys.zero_band.is_finite() && sys.zero_band >= 0.0 && sys.zero_band < sys.min_weight) {
            return invalid(format!("system.zero_band {} out of range", sys.zero_band));
        }
        let db = &self.database;
        if db.max_retry_queue_size == 0 {
            return invalid("database.max_retry_queue_size must be at least 1".to_string());
        }
        // The queue never grows past its capacity, so the alarm must trip below it.
        if db.alarm_size >= db.max_retry_queue_size {
            return invalid(format!(
                "database.alarm_size {} must be below max_retry_queue_size {}",
                db.alarm_size, db.max_retry_queue_size
            ));
        }
        validate_table_name(&db.table)
            .map_err(|e| StationError::InvalidConfig(e.to_string()))?;
        Ok(())
    }

    /// Component settings derived from this file.
    pub fn station_config(&self) -> StationConfig {
        StationConfig {
            scale: ScaleProcessorConfig {
                polling_interval: Duration::from_millis(self.scale.polling_interval_ms),
                stable_threshold: self.scale.stable_threshold,
                unstable_threshold: self.scale.unstable_threshold,
                ..ScaleProcessorConfig::default()
            },
            panel: SignalBusConfig {
                reconnect_interval: Duration::from_millis(self.panel.reconnect_interval_ms),
                send_timeout: Duration::from_millis(self.panel.send_timeout_ms),
                ..SignalBusConfig::default()
            },
            machine: StateMachineConfig {
                min_weight: self.system.min_weight,
                hyst_weight: self.system.hyst_weight,
                zero_band: self.system.zero_band,
                semaphore_time: Duration::from_millis(self.system.semaphore_time_ms),
                block_recording_on_db_failure: self.system.block_recording_on_db_failure,
            },
            store: RecordStoreConfig {
                max_retry_queue_size: self.database.max_retry_queue_size,
                alarm_size: self.database.alarm_size,
                retry_interval: Duration::from_millis(self.database.retry_interval_ms),
                ..RecordStoreConfig::default()
            },
            ..StationConfig::default()
        }
    }
}

/// `$WEIGHGATE_CONFIG`, or `~/.weighgate/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("WEIGHGATE_CONFIG") {
        return PathBuf::from(p);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".weighgate").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `WEIGHGATE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `WEIGHGATE_DB_PATH` | `database.path` |
/// | `WEIGHGATE_PANEL_PORT` | `panel.port` |
/// | `WEIGHGATE_MIN_WEIGHT` | `system.min_weight` |
/// | `WEIGHGATE_HARDWARE` | `system.hardware` (`sim` or `serial`) |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("WEIGHGATE_DB_PATH") {
        cfg.database.path = v;
    }
    if let Ok(v) = std::env::var("WEIGHGATE_PANEL_PORT") {
        cfg.panel.port = v;
    }
    if let Ok(v) = std::env::var("WEIGHGATE_MIN_WEIGHT")
        && let Ok(w) = v.parse::<f64>()
    {
        cfg.system.min_weight = w;
    }
    if let Ok(v) = std::env::var("WEIGHGATE_HARDWARE")
        && let Ok(hw) = v.parse::<Hardware>()
    {
        cfg.system.hardware = hw;
    }
}

/// Save the config, creating the parent directory if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
