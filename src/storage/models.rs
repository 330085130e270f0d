use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;

use crate::sml::obis::{ObisCode, NO_UNIT};

/// Stored measurement value after scaler application.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementValue {
    Integer(i64),
    Decimal(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for MeasurementValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementValue::Integer(v) => write!(f, "{}", v),
            MeasurementValue::Decimal(v) => write!(f, "{}", v),
            MeasurementValue::Text(v) => write!(f, "{}", v),
            MeasurementValue::Bytes(v) => write!(f, "0x{}", hex::encode(v)),
        }
    }
}

/// One normalized reading on its way into a `MeterStore`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub device: String,
    pub code: ObisCode,
    pub unit: u8,
    pub value: MeasurementValue,
}

impl Reading {
    /// Marker recorded whenever a reader (re)starts for `device`.
    pub fn reset_marker(device: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            device: device.to_string(),
            code: ObisCode::RESET,
            unit: NO_UNIT,
            value: MeasurementValue::Text("RESET".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Stored,
    Duplicate,
}

/// Row of the per-device view.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewRow {
    pub timestamp: String,
    pub code: ObisCode,
    pub code_desc: Option<String>,
    pub unit: u8,
    pub unit_desc: Option<String>,
    pub value: MeasurementValue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub devices: i64,
    pub units: i64,
    pub codes: i64,
    pub timestamps: i64,
    pub points: i64,
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}
