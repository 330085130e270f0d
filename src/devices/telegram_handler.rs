use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use super::traits::FrameHandler;
use crate::sml::obis::{CodeCatalog, ObisCode, NO_UNIT};
use crate::sml::telegram::{RawValue, TelegramDecoder};
use crate::storage::meter_store::{MeterStore, StoreOptions};
use crate::storage::models::{InsertOutcome, MeasurementValue, Reading};
use crate::utils::error::IngestError;

const PROGRESS_EVERY: u64 = 10;
// a pending batch keeps other meters on the same file from writing
const MAX_PENDING_AGE: Duration = Duration::from_secs(1);

/// Applies an entry's scaler to its raw value.
///
/// A negative scaler divides by `10 * |scaler|`, matching the values recorded
/// by existing installations.
pub fn normalize_value(value: &RawValue, scaler: Option<i8>) -> MeasurementValue {
    let raw = match value {
        RawValue::Text(text) => return MeasurementValue::Text(format!("\"{}\"", text)),
        RawValue::Bytes(bytes) => return MeasurementValue::Bytes(bytes.clone()),
        RawValue::Boolean(flag) => *flag as i64,
        RawValue::Integer(raw) => *raw,
    };

    match scaler {
        None => MeasurementValue::Integer(raw),
        Some(s) if s < 0 => MeasurementValue::Decimal(raw as f64 / (10.0 * f64::from(s).abs())),
        Some(s) => 10i64
            .checked_pow(s as u32)
            .and_then(|factor| raw.checked_mul(factor))
            .map(MeasurementValue::Integer)
            .unwrap_or_else(|| MeasurementValue::Decimal(raw as f64 * 10f64.powi(i32::from(s)))),
    }
}

/// Turns decoded telegrams of one meter into stored readings.
pub struct TelegramHandler {
    meter_id: String,
    note: String,
    filter: HashSet<ObisCode>,
    options: StoreOptions,
    runtime: Handle,
    decoder: Box<dyn TelegramDecoder>,
    catalog: Arc<dyn CodeCatalog>,
    store: Option<MeterStore>,
    telegrams: u64,
    since_progress: u64,
    progress_lines: u64,
    anchor: Option<ObisCode>,
}

impl TelegramHandler {
    pub fn new(
        meter_id: &str,
        note: &str,
        filter: impl IntoIterator<Item = ObisCode>,
        options: StoreOptions,
        runtime: Handle,
        decoder: Box<dyn TelegramDecoder>,
        catalog: Arc<dyn CodeCatalog>,
    ) -> Self {
        Self {
            meter_id: meter_id.to_string(),
            note: note.to_string(),
            filter: filter.into_iter().collect(),
            options,
            runtime,
            decoder,
            catalog,
            store: None,
            telegrams: 0,
            since_progress: 0,
            progress_lines: 0,
            anchor: None,
        }
    }

    pub fn telegram_count(&self) -> u64 {
        self.telegrams
    }

    /// Progress lines logged so far.
    pub fn progress_lines(&self) -> u64 {
        self.progress_lines
    }

    /// First stored code; progress is logged when it comes round again.
    pub fn anchor(&self) -> Option<ObisCode> {
        self.anchor
    }

    fn store(&mut self) -> Result<&mut MeterStore, IngestError> {
        let meter_id = &self.meter_id;
        self.store
            .as_mut()
            .ok_or_else(|| IngestError::DatabaseError(format!("store for meter '{}' is not open", meter_id)))
    }

    /// Decodes one frame and stores its readings. Returns the number of rows stored.
    fn process_frame(&mut self, frame: &[u8]) -> Result<usize, IngestError> {
        let telegram = self.decoder.decode(frame)?;
        let mut stored = 0;

        for list in telegram.list_responses() {
            self.telegrams += 1;
            self.since_progress += 1;
            let timestamp = Utc::now();

            for entry in &list.entries {
                if self.filter.contains(&entry.code) {
                    continue;
                }
                self.track_progress(entry.code);

                let reading = Reading {
                    timestamp,
                    device: self.meter_id.clone(),
                    code: entry.code,
                    unit: entry.unit.unwrap_or(NO_UNIT),
                    value: normalize_value(&entry.value, entry.scaler),
                };
                let runtime = self.runtime.clone();
                let store = self.store()?;
                if runtime.block_on(store.insert(&reading))? == InsertOutcome::Stored {
                    stored += 1;
                }
            }
        }

        let runtime = self.runtime.clone();
        runtime.block_on(self.store()?.commit_if_stale(MAX_PENDING_AGE))?;
        Ok(stored)
    }

    fn track_progress(&mut self, code: ObisCode) {
        let anchor = *self.anchor.get_or_insert(code);
        if code == anchor && self.since_progress >= PROGRESS_EVERY {
            info!("📈 Meter '{}': {} telegrams processed", self.meter_id, self.telegrams);
            self.since_progress = 0;
            self.progress_lines += 1;
        }
    }

    fn close_store(&mut self) {
        if let Some(store) = self.store.take() {
            if let Err(e) = self.runtime.block_on(store.close()) {
                error!("❌ Failed to close store for meter '{}': {}", self.meter_id, e);
            }
        }
    }
}

impl FrameHandler for TelegramHandler {
    fn prepare(&mut self) -> Result<(), IngestError> {
        let mut store = self.runtime.block_on(MeterStore::open(
            &self.meter_id,
            &self.note,
            &self.options,
            self.catalog.clone(),
        ))?;
        self.runtime
            .block_on(store.insert(&Reading::reset_marker(&self.meter_id, Utc::now())))?;
        self.store = Some(store);
        Ok(())
    }

    fn connection_made(&mut self) -> Result<(), IngestError> {
        info!("🔗 Meter '{}' connected", self.meter_id);
        Ok(())
    }

    fn data_received(&mut self, frame: &[u8]) -> Result<(), IngestError> {
        match self.process_frame(frame) {
            Ok(stored) => debug!("Meter '{}': {} value(s) stored", self.meter_id, stored),
            Err(e) => error!(
                "❌ Meter '{}': dropping frame ({}): {}",
                self.meter_id,
                e,
                hex::encode(frame)
            ),
        }
        Ok(())
    }

    fn flush(&mut self) {
        let Some(store) = self.store.as_mut() else {
            return;
        };
        if store.pending() == 0 {
            return;
        }
        if let Err(e) = self.runtime.block_on(store.commit()) {
            warn!("⚠️ Meter '{}': commit while idle failed: {}", self.meter_id, e);
        }
    }

    fn connection_lost(&mut self, error: Option<&IngestError>) {
        if let Some(e) = error {
            warn!("⚠️ Meter '{}' connection lost: {}", self.meter_id, e);
        }
        self.close_store();
    }

    fn dispose(&mut self) {
        info!("🧹 Meter '{}' disposing after {} telegrams", self.meter_id, self.telegrams);
        self.close_store();
    }
}
