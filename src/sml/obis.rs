use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::utils::error::IngestError;

/// DLMS unit code meaning "no unit"; also used when a list entry carries none.
pub const NO_UNIT: u8 = 0xFF;

/// OBIS object identifier (`A-B:C.D.E*F`), stored as its big-endian integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "ObisRepr", into = "String")]
pub struct ObisCode(u64);

impl ObisCode {
    /// Synthetic code recorded once per reader start.
    pub const RESET: ObisCode = ObisCode(0xFFFF_FFFF_FFFF);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn from_groups(groups: [u8; 6]) -> Self {
        let mut bytes = [0u8; 8];
        bytes[2..].copy_from_slice(&groups);
        Self(u64::from_be_bytes(bytes))
    }

    /// Big-endian interpretation of an object name octet string (at most 8 bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IngestError> {
        if bytes.len() > 8 {
            return Err(IngestError::DecodeError(format!(
                "object name too long: {} bytes",
                bytes.len()
            )));
        }
        Ok(Self(bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)))
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn groups(&self) -> [u8; 6] {
        let b = self.0.to_be_bytes();
        [b[2], b[3], b[4], b[5], b[6], b[7]]
    }
}

impl fmt::Display for ObisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 > 0xFFFF_FFFF_FFFF {
            return write!(f, "0x{:X}", self.0);
        }
        let [a, b, c, d, e, g] = self.groups();
        write!(f, "{}-{}:{}.{}.{}*{}", a, b, c, d, e, g)
    }
}

impl FromStr for ObisCode {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || IngestError::ConfigError(format!("invalid OBIS code '{}'", s));

        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return u64::from_str_radix(hex, 16).map(Self).map_err(|_| invalid());
        }

        let (a, rest) = s.split_once('-').ok_or_else(invalid)?;
        let (b, rest) = rest.split_once(':').ok_or_else(invalid)?;
        let (cde, f) = match rest.split_once('*') {
            Some((cde, f)) => (cde, f),
            None => (rest, "255"),
        };
        let mut cde = cde.split('.');
        let (c, d, e) = match (cde.next(), cde.next(), cde.next(), cde.next()) {
            (Some(c), Some(d), Some(e), None) => (c, d, e),
            _ => return Err(invalid()),
        };

        let mut groups = [0u8; 6];
        for (slot, part) in groups.iter_mut().zip([a, b, c, d, e, f]) {
            *slot = part.trim().parse().map_err(|_| invalid())?;
        }
        Ok(Self::from_groups(groups))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ObisRepr {
    Integer(u64),
    Text(String),
}

impl TryFrom<ObisRepr> for ObisCode {
    type Error = IngestError;

    fn try_from(repr: ObisRepr) -> Result<Self, Self::Error> {
        match repr {
            ObisRepr::Integer(value) => Ok(Self(value)),
            ObisRepr::Text(text) => text.parse(),
        }
    }
}

impl From<ObisCode> for String {
    fn from(code: ObisCode) -> Self {
        code.to_string()
    }
}

/// Human-readable names used when a dimension row is first created.
pub trait CodeCatalog: Send + Sync {
    fn unit_name(&self, unit: u8) -> String;
    fn code_description(&self, code: ObisCode) -> String;
}

/// Built-in table of DLMS units and common electricity meter OBIS codes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ObisCatalog;

impl CodeCatalog for ObisCatalog {
    fn unit_name(&self, unit: u8) -> String {
        let name = match unit {
            1 => "a",
            2 => "mo",
            3 => "wk",
            4 => "d",
            5 => "h",
            6 => "min",
            7 => "s",
            8 => "°",
            9 => "°C",
            10 => "currency",
            11 => "m",
            12 => "m/s",
            13 => "m³",
            14 => "m³ (corr.)",
            15 => "m³/h",
            16 => "m³/h (corr.)",
            17 => "m³/d",
            18 => "m³/d (corr.)",
            19 => "l",
            20 => "kg",
            21 => "N",
            22 => "Nm",
            23 => "Pa",
            24 => "bar",
            25 => "J",
            26 => "J/h",
            27 => "W",
            28 => "VA",
            29 => "var",
            30 => "Wh",
            31 => "VAh",
            32 => "varh",
            33 => "A",
            34 => "C",
            35 => "V",
            36 => "V/m",
            37 => "F",
            38 => "Ω",
            39 => "Ωm²/m",
            40 => "Wb",
            41 => "T",
            42 => "A/m",
            43 => "H",
            44 => "Hz",
            45 => "1/(Wh)",
            46 => "1/(varh)",
            47 => "1/(VAh)",
            48 => "V²h",
            49 => "A²h",
            50 => "kg/s",
            51 => "S",
            52 => "K",
            53 => "1/(V²h)",
            54 => "1/(A²h)",
            55 => "1/m³",
            56 => "%",
            57 => "Ah",
            60 => "Wh/m³",
            61 => "J/m³",
            62 => "Mol %",
            63 => "g/m³",
            64 => "Pa s",
            254 => "other",
            NO_UNIT => "count",
            _ => return format!("unit {}", unit),
        };
        name.to_string()
    }

    fn code_description(&self, code: ObisCode) -> String {
        if code == ObisCode::RESET {
            return "reader start marker".to_string();
        }
        let [a, b, c, d, e, _] = code.groups();
        let description = match (a, b, c, d, e) {
            (1, _, 0, 0, 0) => "Device identifier",
            (1, _, 0, 0, 9) => "Server identifier",
            (1, _, 0, 2, 0) => "Firmware version",
            (1, _, 96, 1, 0) => "Device identifier",
            (1, _, 96, 5, 0) => "Operating status",
            (1, _, 96, 50, 1) => "Manufacturer identifier",
            (129, 129, 199, 130, 3) => "Manufacturer identifier",
            (1, _, 1, 8, 0) => "Positive active energy, total",
            (1, _, 1, 8, 1) => "Positive active energy, tariff 1",
            (1, _, 1, 8, 2) => "Positive active energy, tariff 2",
            (1, _, 2, 8, 0) => "Negative active energy, total",
            (1, _, 2, 8, 1) => "Negative active energy, tariff 1",
            (1, _, 2, 8, 2) => "Negative active energy, tariff 2",
            (1, _, 16, 7, 0) => "Active power, sum",
            (1, _, 36, 7, 0) => "Active power, L1",
            (1, _, 56, 7, 0) => "Active power, L2",
            (1, _, 76, 7, 0) => "Active power, L3",
            (1, _, 31, 7, 0) => "Current, L1",
            (1, _, 51, 7, 0) => "Current, L2",
            (1, _, 71, 7, 0) => "Current, L3",
            (1, _, 32, 7, 0) => "Voltage, L1",
            (1, _, 52, 7, 0) => "Voltage, L2",
            (1, _, 72, 7, 0) => "Voltage, L3",
            (1, _, 14, 7, 0) => "Supply frequency",
            (1, _, 81, 7, 1) => "Phase angle U-L2 to U-L1",
            (1, _, 81, 7, 2) => "Phase angle U-L3 to U-L1",
            (1, _, 81, 7, 4) => "Phase angle I-L1 to U-L1",
            (1, _, 81, 7, 15) => "Phase angle I-L2 to U-L2",
            (1, _, 81, 7, 26) => "Phase angle I-L3 to U-L3",
            _ => return format!("OBIS {}", code),
        };
        description.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obis_display_and_parse() {
        let code = ObisCode::from_groups([1, 0, 1, 8, 0, 255]);
        assert_eq!(code.value(), 0x0100_0108_00FF);
        assert_eq!(code.to_string(), "1-0:1.8.0*255");
        assert_eq!("1-0:1.8.0*255".parse::<ObisCode>().unwrap(), code);
        assert_eq!("1-0:1.8.0".parse::<ObisCode>().unwrap(), code);
        assert_eq!("0x0100010800FF".parse::<ObisCode>().unwrap(), code);
    }

    #[test]
    fn test_obis_parse_rejects_garbage() {
        assert!("1-0:1.8*255".parse::<ObisCode>().is_err());
        assert!("1:0-1.8.0".parse::<ObisCode>().is_err());
        assert!("1-0:1.8.300".parse::<ObisCode>().is_err());
    }

    #[test]
    fn test_obis_from_bytes() {
        let code = ObisCode::from_bytes(&[0x01, 0x00, 0x10, 0x07, 0x00, 0xFF]).unwrap();
        assert_eq!(code.to_string(), "1-0:16.7.0*255");
        assert!(ObisCode::from_bytes(&[0u8; 9]).is_err());
    }

    #[test]
    fn test_catalog_lookups() {
        let catalog = ObisCatalog;
        assert_eq!(catalog.unit_name(30), "Wh");
        assert_eq!(catalog.unit_name(27), "W");
        assert_eq!(catalog.unit_name(200), "unit 200");
        assert_eq!(
            catalog.code_description(ObisCode::from_groups([1, 0, 1, 8, 0, 255])),
            "Positive active energy, total"
        );
        assert_eq!(catalog.code_description(ObisCode::RESET), "reader start marker");
        assert_eq!(
            catalog.code_description(ObisCode::from_groups([7, 0, 3, 0, 0, 255])),
            "OBIS 7-0:3.0.0*255"
        );
    }
}
