use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Checksum mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::DatabaseError(err.to_string())
    }
}

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        IngestError::CommunicationError(format!("IO error: {}", err))
    }
}

impl From<serialport::Error> for IngestError {
    fn from(err: serialport::Error) -> Self {
        IngestError::ConnectionError(format!("Serial port error: {}", err))
    }
}

impl From<toml::de::Error> for IngestError {
    fn from(err: toml::de::Error) -> Self {
        IngestError::ConfigError(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for IngestError {
    fn from(err: toml::ser::Error) -> Self {
        IngestError::ConfigError(format!("TOML write error: {}", err))
    }
}
