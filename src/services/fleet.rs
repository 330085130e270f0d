use log::{error, info, warn};
use serialport::SerialPort;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use crate::config::{Config, SerialConfig};
use crate::devices::{FrameHandler, MeterReader, TelegramHandler};
use crate::sml::decoder::SmlDecoder;
use crate::sml::obis::CodeCatalog;
use crate::utils::error::IngestError;

/// Supervises one reader thread per configured meter.
///
/// The fleet does no ingestion work itself. Each reader owns its handler and
/// store; the fleet only aggregates liveness and fans out stop requests.
#[derive(Default)]
pub struct MeterFleet {
    readers: Vec<MeterReader>,
}

impl MeterFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens every enabled meter. A meter whose port cannot be opened is
    /// logged and skipped.
    pub fn start(config: &Config, runtime: Handle, catalog: Arc<dyn CodeCatalog>) -> Self {
        let mut fleet = Self::new();

        for (id, meter) in config.enabled_meters() {
            let port = match open_port(&meter.serial) {
                Ok(port) => port,
                Err(e) => {
                    error!("❌ Meter '{}' skipped: {}", id, e);
                    continue;
                }
            };

            let handler = TelegramHandler::new(
                id,
                &meter.note,
                meter.filter_set(),
                meter.store_options(&config.general),
                runtime.clone(),
                Box::new(SmlDecoder::new(meter.verify_checksum)),
                catalog.clone(),
            );

            if let Err(e) = fleet.add_meter(id, port, handler) {
                error!("❌ Meter '{}' skipped: {}", id, e);
            }
        }

        info!("🚀 {} of {} meter(s) running", fleet.readers.len(), config.meters.len());
        fleet
    }

    pub fn add_meter<T, H>(&mut self, id: &str, transport: T, handler: H) -> Result<(), IngestError>
    where
        T: Read + Send + 'static,
        H: FrameHandler + 'static,
    {
        let reader = MeterReader::start(id, transport, handler)?;
        self.readers.push(reader);
        Ok(())
    }

    pub fn meter_ids(&self) -> Vec<&str> {
        self.readers.iter().map(|r| r.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    /// True while at least one reader is still running.
    pub fn is_alive(&self) -> bool {
        self.readers.iter().any(|r| r.is_alive())
    }

    pub fn stop(&self) {
        for reader in &self.readers {
            reader.close();
        }
    }

    /// Polls reader liveness until every reader has finished.
    pub async fn wait_stopped(&self, poll: Duration) {
        while self.is_alive() {
            tokio::time::sleep(poll).await;
        }
    }

    pub fn join(&mut self) {
        for reader in &mut self.readers {
            reader.join();
        }
        self.readers.clear();
    }
}

fn open_port(serial: &SerialConfig) -> Result<Box<dyn SerialPort>, IngestError> {
    info!(
        "🔌 Opening {} at {} baud ({:?} parity, {} data bits, {} stop bit(s))",
        serial.port, serial.baud_rate, serial.parity, serial.data_bits, serial.stop_bits
    );

    let port = serialport::new(&serial.port, serial.baud_rate)
        .data_bits(serial.data_bits()?)
        .stop_bits(serial.stop_bits()?)
        .parity(serial.parity())
        .timeout(serial.timeout())
        .open()
        .map_err(|e| IngestError::ConnectionError(format!("Failed to open {}: {}", serial.port, e)))?;

    if let Err(e) = port.clear(serialport::ClearBuffer::Input) {
        warn!("⚠️ Could not clear input buffer of {}: {}", serial.port, e);
    }

    Ok(port)
}
