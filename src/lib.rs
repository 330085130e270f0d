//! Smart meter SML ingestion library
//!
//! Reads SML telegrams from serial-attached electricity meters, decodes their
//! list responses and stores the readings in a deduplicated SQLite store with
//! one reader thread per meter.

pub mod cli;
pub mod config;
pub mod devices;
pub mod services;
pub mod sml;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use devices::{FrameHandler, MeterReader, TelegramHandler};
pub use services::MeterFleet;
pub use sml::{FrameExtractor, ObisCode, SmlDecoder};
pub use storage::{MeterStore, Reading, StoreOptions};
pub use utils::error::IngestError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
