use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sml::obis::ObisCode;
use crate::storage::meter_store::StoreOptions;
use crate::utils::error::IngestError;

pub const DEFAULT_CONFIG_PATH: &str = "config/meters.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    // One table per meter, keyed by its device identity
    #[serde(default)]
    pub meters: BTreeMap<String, MeterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_liveness_poll_ms")]
    pub liveness_poll_ms: u64,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub enable_wal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    pub database: PathBuf,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub filter: Vec<ObisCode>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub verify_checksum: bool,
    pub serial: SerialConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: ParityConfig,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParityConfig {
    #[default]
    None,
    Even,
    Odd,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_liveness_poll_ms() -> u64 {
    100
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            liveness_poll_ms: default_liveness_poll_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            enable_wal: true,
        }
    }
}

impl GeneralConfig {
    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms)
    }
}

impl MeterConfig {
    pub fn filter_set(&self) -> HashSet<ObisCode> {
        self.filter.iter().copied().collect()
    }

    pub fn store_options(&self, general: &GeneralConfig) -> StoreOptions {
        StoreOptions {
            path: self.database.clone(),
            busy_timeout: Duration::from_millis(general.busy_timeout_ms),
            enable_wal: general.enable_wal,
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn data_bits(&self) -> Result<serialport::DataBits, IngestError> {
        match self.data_bits {
            5 => Ok(serialport::DataBits::Five),
            6 => Ok(serialport::DataBits::Six),
            7 => Ok(serialport::DataBits::Seven),
            8 => Ok(serialport::DataBits::Eight),
            other => Err(IngestError::ConfigError(format!("Unsupported data bits: {}", other))),
        }
    }

    pub fn stop_bits(&self) -> Result<serialport::StopBits, IngestError> {
        match self.stop_bits {
            1 => Ok(serialport::StopBits::One),
            2 => Ok(serialport::StopBits::Two),
            other => Err(IngestError::ConfigError(format!("Unsupported stop bits: {}", other))),
        }
    }

    pub fn parity(&self) -> serialport::Parity {
        match self.parity {
            ParityConfig::None => serialport::Parity::None,
            ParityConfig::Even => serialport::Parity::Even,
            ParityConfig::Odd => serialport::Parity::Odd,
        }
    }
}

impl Config {
    /// Configuration with a single example meter on the first USB serial adapter.
    pub fn example() -> Self {
        let mut meters = BTreeMap::new();
        meters.insert(
            "house".to_string(),
            MeterConfig {
                database: PathBuf::from("data/meters.db"),
                note: "Main electricity meter".to_string(),
                filter: vec![ObisCode::from_groups([1, 0, 96, 50, 1, 1])],
                enabled: true,
                verify_checksum: false,
                serial: SerialConfig {
                    port: "/dev/ttyUSB0".to_string(),
                    baud_rate: default_baud_rate(),
                    data_bits: default_data_bits(),
                    stop_bits: default_stop_bits(),
                    parity: ParityConfig::None,
                    timeout_ms: default_timeout_ms(),
                },
            },
        );

        Self {
            general: GeneralConfig::default(),
            meters,
        }
    }

    pub fn parse(content: &str) -> Result<Self, IngestError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, IngestError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            IngestError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&content)?;
        info!("📋 Loaded configuration from {} ({} meter(s))", path.display(), config.meters.len());
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), IngestError> {
        let path = path.as_ref();
        // Create directory if it doesn't exist
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        debug!("Configuration written to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.meters.is_empty() {
            return Err(IngestError::ConfigError("No meters configured".to_string()));
        }

        for (id, meter) in &self.meters {
            if id.trim().is_empty() {
                return Err(IngestError::ConfigError("Meter id must not be empty".to_string()));
            }
            if meter.serial.port.trim().is_empty() {
                return Err(IngestError::ConfigError(format!("Meter '{}' has no serial port", id)));
            }
            if meter.database.as_os_str().is_empty() {
                return Err(IngestError::ConfigError(format!("Meter '{}' has no database path", id)));
            }
            if meter.serial.timeout_ms == 0 {
                return Err(IngestError::ConfigError(format!(
                    "Meter '{}' needs a non-zero read timeout",
                    id
                )));
            }
            meter.serial.data_bits().map_err(|e| prefix(id, e))?;
            meter.serial.stop_bits().map_err(|e| prefix(id, e))?;
        }

        Ok(())
    }

    // Enabled meters in id order
    pub fn enabled_meters(&self) -> impl Iterator<Item = (&String, &MeterConfig)> {
        self.meters.iter().filter(|(_, meter)| meter.enabled)
    }
}

fn prefix(id: &str, err: IngestError) -> IngestError {
    IngestError::ConfigError(format!("Meter '{}': {}", id, err))
}
