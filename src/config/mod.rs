pub mod settings;

pub use settings::{Config, GeneralConfig, MeterConfig, ParityConfig, SerialConfig, DEFAULT_CONFIG_PATH};
