use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{Decode, Encode, Row, Sqlite, SqliteConnection, Transaction, Type};
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::models::{format_timestamp, InsertOutcome, MeasurementValue, Reading, StoreStats, ViewRow};
use super::schema::{quote_identifier, StoreSchema};
use super::timestamp_cache::TimestampCache;
use crate::sml::obis::{CodeCatalog, ObisCode};
use crate::utils::error::IngestError;

pub const TIMESTAMP_CACHE_CAPACITY: usize = 5;
pub const COMMIT_INTERVAL: u64 = 10;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub path: PathBuf,
    pub busy_timeout: Duration,
    pub enable_wal: bool,
}

impl StoreOptions {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout: Duration::from_millis(5000),
            enable_wal: true,
        }
    }
}

/// Result of an insert-or-ignore against a unique constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Upsert {
    Inserted(i64),
    Present,
}

impl Upsert {
    fn from_result(result: &sqlx::sqlite::SqliteQueryResult) -> Self {
        if result.rows_affected() == 0 {
            Upsert::Present
        } else {
            Upsert::Inserted(result.last_insert_rowid())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dimension {
    Devices,
    Units,
    Codes,
}

impl Dimension {
    fn table(self) -> &'static str {
        match self {
            Dimension::Devices => "b_DEVICES",
            Dimension::Units => "b_UNITS",
            Dimension::Codes => "b_CODES",
        }
    }

    fn insert_sql(self) -> &'static str {
        match self {
            Dimension::Devices => "INSERT OR IGNORE INTO b_DEVICES (value, description) VALUES (?, ?)",
            Dimension::Units => "INSERT OR IGNORE INTO b_UNITS (value, description) VALUES (?, ?)",
            Dimension::Codes => "INSERT OR IGNORE INTO b_CODES (value, description) VALUES (?, ?)",
        }
    }

    fn select_sql(self) -> &'static str {
        match self {
            Dimension::Devices => "SELECT pk, value FROM b_DEVICES",
            Dimension::Units => "SELECT pk, value FROM b_UNITS",
            Dimension::Codes => "SELECT pk, value FROM b_CODES",
        }
    }
}

/// In-memory identity -> row key mapping for one dimension table.
struct DimensionCache<K> {
    dimension: Dimension,
    keys: HashMap<K, i64>,
}

impl<K> DimensionCache<K>
where
    K: Eq + Hash + Clone + Display + Send + Unpin + 'static,
    K: for<'q> Encode<'q, Sqlite> + for<'r> Decode<'r, Sqlite> + Type<Sqlite>,
{
    fn new(dimension: Dimension) -> Self {
        Self {
            dimension,
            keys: HashMap::new(),
        }
    }

    fn get(&self, key: &K) -> Option<i64> {
        self.keys.get(key).copied()
    }

    async fn reload(&mut self, conn: &mut SqliteConnection) -> Result<(), IngestError> {
        let rows: Vec<(i64, K)> = sqlx::query_as(self.dimension.select_sql())
            .fetch_all(&mut *conn)
            .await?;
        self.keys = rows.into_iter().map(|(pk, value)| (value, pk)).collect();
        Ok(())
    }

    /// Returns the row key for `key` and whether the cache missed.
    async fn resolve(
        &mut self,
        conn: &mut SqliteConnection,
        key: &K,
        description: impl FnOnce() -> String,
    ) -> Result<(i64, bool), IngestError> {
        if let Some(pk) = self.get(key) {
            return Ok((pk, false));
        }

        let result = sqlx::query(self.dimension.insert_sql())
            .bind(key.clone())
            .bind(description())
            .execute(&mut *conn)
            .await?;

        match Upsert::from_result(&result) {
            Upsert::Inserted(pk) => {
                debug!("➕ {} row {} for '{}'", self.dimension.table(), pk, key);
                self.keys.insert(key.clone(), pk);
            }
            Upsert::Present => {
                warn!("🔄 '{}' already in {}, reloading cache", key, self.dimension.table());
                self.reload(conn).await?;
            }
        }

        let pk = self.get(key).ok_or_else(|| {
            IngestError::DatabaseError(format!("'{}' missing from {} after insert", key, self.dimension.table()))
        })?;
        Ok((pk, true))
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn clear(&mut self) {
        self.keys.clear();
    }
}

/// Begins a transaction on first use and hands out its connection.
async fn acquire<'a>(
    pool: &SqlitePool,
    tx: &'a mut Option<Transaction<'static, Sqlite>>,
) -> Result<&'a mut SqliteConnection, IngestError> {
    let active = match tx.take() {
        Some(active) => active,
        None => pool.begin().await?,
    };
    Ok(&mut **tx.insert(active))
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q MeasurementValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        MeasurementValue::Integer(v) => query.bind(*v),
        MeasurementValue::Decimal(v) => query.bind(*v),
        MeasurementValue::Text(v) => query.bind(v.as_str()),
        MeasurementValue::Bytes(v) => query.bind(v.as_slice()),
    }
}

#[derive(Debug, Clone, Copy)]
struct PointKeys {
    device: i64,
    code: i64,
    unit: i64,
}

async fn insert_point(
    conn: &mut SqliteConnection,
    pk_timestamp: Option<i64>,
    keys: PointKeys,
    value: &MeasurementValue,
) -> Result<Upsert, IngestError> {
    let query = sqlx::query(
        "INSERT OR IGNORE INTO m_POINTS (pk_timestamp, pk_device, pk_code, pk_unit, value) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(pk_timestamp)
    .bind(keys.device)
    .bind(keys.code)
    .bind(keys.unit);

    let result = bind_value(query, value).execute(&mut *conn).await?;
    Ok(Upsert::from_result(&result))
}

async fn resolve_timestamp(conn: &mut SqliteConnection, timestamp: &str) -> Result<i64, IngestError> {
    let result = sqlx::query("INSERT OR IGNORE INTO m_TIMESTAMPS (value) VALUES (?)")
        .bind(timestamp)
        .execute(&mut *conn)
        .await?;

    match Upsert::from_result(&result) {
        Upsert::Inserted(pk) => Ok(pk),
        Upsert::Present => {
            let pk: i64 = sqlx::query_scalar("SELECT pk FROM m_TIMESTAMPS WHERE value = ?")
                .bind(timestamp)
                .fetch_one(&mut *conn)
                .await?;
            Ok(pk)
        }
    }
}

fn code_key(code: ObisCode) -> i64 {
    code.value() as i64
}

/// Dimensional cache store bound to one meter and one SQLite connection.
///
/// Dimension rows (device, unit, code) are inserted on first sighting and
/// committed at once; measurement rows are committed in batches of
/// `COMMIT_INTERVAL` insert calls. A pending batch holds the database write
/// lock, so owners sharing a file should `commit` or `commit_if_stale` when
/// the meter goes quiet. `close` flushes whatever is pending.
pub struct MeterStore {
    device: String,
    note: String,
    pool: SqlitePool,
    tx: Option<Transaction<'static, Sqlite>>,
    catalog: Arc<dyn CodeCatalog>,
    devices: DimensionCache<String>,
    units: DimensionCache<i64>,
    codes: DimensionCache<i64>,
    timestamps: TimestampCache,
    inserts: u64,
    uncommitted: u64,
    pending_since: Option<Instant>,
    view_ready: bool,
}

impl MeterStore {
    pub async fn open(
        device: &str,
        note: &str,
        options: &StoreOptions,
        catalog: Arc<dyn CodeCatalog>,
    ) -> Result<Self, IngestError> {
        if let Some(parent) = options.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                IngestError::DatabaseError(format!("Failed to create database directory: {}", e))
            })?;
        }

        info!("🗄️  Opening store for meter '{}' at {}", device, options.path.display());

        let connect_options = SqliteConnectOptions::new()
            .filename(&options.path)
            .create_if_missing(true)
            .busy_timeout(options.busy_timeout)
            .journal_mode(if options.enable_wal {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            })
            .synchronous(SqliteSynchronous::Normal);

        // one connection per meter; the open transaction lives on it
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await?;

        let mut store = Self {
            device: device.to_string(),
            note: note.to_string(),
            pool,
            tx: None,
            catalog,
            devices: DimensionCache::new(Dimension::Devices),
            units: DimensionCache::new(Dimension::Units),
            codes: DimensionCache::new(Dimension::Codes),
            timestamps: TimestampCache::new(TIMESTAMP_CACHE_CAPACITY),
            inserts: 0,
            uncommitted: 0,
            pending_since: None,
            view_ready: false,
        };

        let conn = acquire(&store.pool, &mut store.tx).await?;
        StoreSchema::create(conn).await?;
        store.devices.reload(conn).await?;
        store.units.reload(conn).await?;
        store.codes.reload(conn).await?;

        let recent: Vec<(i64, String)> = sqlx::query_as(
            "SELECT pk, value FROM (SELECT pk, value FROM m_TIMESTAMPS ORDER BY value DESC LIMIT ?) ORDER BY value ASC",
        )
        .bind(TIMESTAMP_CACHE_CAPACITY as i64)
        .fetch_all(&mut *conn)
        .await?;
        for (pk, value) in recent {
            match DateTime::parse_from_rfc3339(&value) {
                Ok(ts) => {
                    store.timestamps.insert(ts.with_timezone(&Utc), pk);
                }
                Err(e) => debug!("Skipping unparsable timestamp '{}': {}", value, e),
            }
        }

        store.commit().await?;

        info!(
            "✅ Store for meter '{}' ready ({} units, {} codes cached)",
            store.device,
            store.units.len(),
            store.codes.len()
        );
        Ok(store)
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Insert calls since the last commit.
    pub fn pending(&self) -> u64 {
        self.uncommitted
    }

    /// Cached timestamps, oldest first.
    pub fn cached_timestamps(&self) -> Vec<DateTime<Utc>> {
        self.timestamps.timestamps()
    }

    pub async fn insert(&mut self, reading: &Reading) -> Result<InsertOutcome, IngestError> {
        if reading.device != self.device {
            return Err(IngestError::InvalidArgument(format!(
                "reading for meter '{}' passed to store of meter '{}'",
                reading.device, self.device
            )));
        }

        let result = self.write(reading).await;
        // a failed first write leaves a read snapshot that can never be upgraded
        if result.is_err() && self.uncommitted == 0 {
            self.discard().await;
        }
        result
    }

    async fn write(&mut self, reading: &Reading) -> Result<InsertOutcome, IngestError> {
        let conn = acquire(&self.pool, &mut self.tx).await?;
        let catalog = &self.catalog;
        let note = &self.note;

        let (pk_device, new_device) = self
            .devices
            .resolve(conn, &reading.device, || note.clone())
            .await?;
        let (pk_unit, new_unit) = self
            .units
            .resolve(conn, &(reading.unit as i64), || catalog.unit_name(reading.unit))
            .await?;
        let (pk_code, new_code) = self
            .codes
            .resolve(conn, &code_key(reading.code), || catalog.code_description(reading.code))
            .await?;
        let dirty = new_device || new_unit || new_code;

        let keys = PointKeys {
            device: pk_device,
            code: pk_code,
            unit: pk_unit,
        };

        let outcome = match self.timestamps.get(&reading.timestamp) {
            Some(pk_timestamp) => match insert_point(conn, Some(pk_timestamp), keys, &reading.value).await? {
                Upsert::Inserted(_) => InsertOutcome::Stored,
                Upsert::Present => InsertOutcome::Duplicate,
            },
            // reserve the unique slot first, timestamps only get stored for new points
            None => match insert_point(conn, None, keys, &reading.value).await? {
                Upsert::Present => InsertOutcome::Duplicate,
                Upsert::Inserted(pk_point) => {
                    let pk_timestamp = resolve_timestamp(conn, &format_timestamp(&reading.timestamp)).await?;
                    sqlx::query("UPDATE m_POINTS SET pk_timestamp = ? WHERE pk = ?")
                        .bind(pk_timestamp)
                        .bind(pk_point)
                        .execute(&mut *conn)
                        .await?;
                    self.timestamps.insert(reading.timestamp, pk_timestamp);
                    InsertOutcome::Stored
                }
            },
        };

        if outcome == InsertOutcome::Duplicate {
            debug!("Duplicate {} = {} for meter '{}' dropped", reading.code, reading.value, self.device);
        }

        self.inserts += 1;
        self.uncommitted += 1;
        self.pending_since.get_or_insert_with(Instant::now);
        if dirty || self.inserts % COMMIT_INTERVAL == 0 {
            self.commit().await?;
        }

        Ok(outcome)
    }

    /// Commits the open transaction, creating the device view first if it is
    /// still missing.
    pub async fn commit(&mut self) -> Result<(), IngestError> {
        self.ensure_view().await?;
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
            debug!("💾 Committed {} insert(s) for meter '{}'", self.uncommitted, self.device);
        }
        self.uncommitted = 0;
        self.pending_since = None;
        Ok(())
    }

    /// Commits if the oldest pending insert is at least `max_age` old.
    pub async fn commit_if_stale(&mut self, max_age: Duration) -> Result<bool, IngestError> {
        match self.pending_since {
            Some(since) if since.elapsed() >= max_age => {
                self.commit().await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Rolls back the open transaction and forgets every cached row key,
    /// since rows cached inside it may be gone.
    async fn discard(&mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                warn!("⚠️ Rollback for meter '{}' failed: {}", self.device, e);
            }
        }
        self.devices.clear();
        self.units.clear();
        self.codes.clear();
        self.timestamps.clear();
        self.view_ready = false;
    }

    async fn ensure_view(&mut self) -> Result<(), IngestError> {
        if self.view_ready {
            return Ok(());
        }
        let Some(pk_device) = self.devices.get(&self.device) else {
            return Ok(());
        };
        let conn = acquire(&self.pool, &mut self.tx).await?;
        self.view_ready = StoreSchema::create_view(conn, &self.device, pk_device).await;
        Ok(())
    }

    /// Rows of this meter's view, ordered by timestamp then code.
    pub async fn view_rows(&mut self) -> Result<Vec<ViewRow>, IngestError> {
        let sql = format!(
            "SELECT timestamp, code, code_desc, unit, unit_desc, value, typeof(value) AS kind FROM {}",
            quote_identifier(&StoreSchema::view_name(&self.device))
        );
        let conn = acquire(&self.pool, &mut self.tx).await?;
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;

        rows.iter()
            .map(|row| {
                let kind: String = row.try_get("kind")?;
                let value = match kind.as_str() {
                    "integer" => MeasurementValue::Integer(row.try_get("value")?),
                    "real" => MeasurementValue::Decimal(row.try_get("value")?),
                    "text" => MeasurementValue::Text(row.try_get("value")?),
                    _ => MeasurementValue::Bytes(row.try_get("value")?),
                };
                let code: i64 = row.try_get("code")?;
                let unit: i64 = row.try_get("unit")?;
                Ok(ViewRow {
                    timestamp: row.try_get("timestamp")?,
                    code: ObisCode::new(code as u64),
                    code_desc: row.try_get("code_desc")?,
                    unit: u8::try_from(unit).unwrap_or(crate::sml::obis::NO_UNIT),
                    unit_desc: row.try_get("unit_desc")?,
                    value,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(IngestError::from)
    }

    pub async fn stats(&mut self) -> Result<StoreStats, IngestError> {
        let conn = acquire(&self.pool, &mut self.tx).await?;
        let mut counts = [0i64; 5];
        let tables = ["b_DEVICES", "b_UNITS", "b_CODES", "m_TIMESTAMPS", "m_POINTS"];
        for (count, table) in counts.iter_mut().zip(tables) {
            *count = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&mut *conn)
                .await?;
        }
        let [devices, units, codes, timestamps, points] = counts;
        Ok(StoreStats {
            devices,
            units,
            codes,
            timestamps,
            points,
        })
    }

    /// Flushes pending rows and closes the connection.
    pub async fn close(mut self) -> Result<(), IngestError> {
        self.commit().await?;
        self.pool.close().await;
        info!("🔒 Store for meter '{}' closed after {} insert(s)", self.device, self.inserts);
        Ok(())
    }
}

impl Drop for MeterStore {
    fn drop(&mut self) {
        if self.tx.is_some() && self.uncommitted > 0 {
            warn!(
                "⚠️ Store for meter '{}' dropped with {} uncommitted insert(s)",
                self.device, self.uncommitted
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sml::obis::{ObisCatalog, NO_UNIT};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn energy() -> ObisCode {
        ObisCode::from_groups([1, 0, 1, 8, 0, 255])
    }

    fn reading(device: &str, secs: i64, code: ObisCode, unit: u8, value: MeasurementValue) -> Reading {
        Reading {
            timestamp: at(secs),
            device: device.to_string(),
            code,
            unit,
            value,
        }
    }

    async fn open(dir: &TempDir, device: &str) -> MeterStore {
        let options = StoreOptions::new(dir.path().join("meters.db"));
        MeterStore::open(device, "test meter", &options, Arc::new(ObisCatalog))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_scenario_duplicate_value_suppressed() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, "M1").await;

        let first = reading("M1", 0, ObisCode::new(0x0100), 30, MeasurementValue::Integer(1234));
        assert_eq!(store.insert(&first).await.unwrap(), InsertOutcome::Stored);

        let rows = store.view_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, MeasurementValue::Integer(1234));
        assert_eq!(rows[0].unit, 30);
        assert_eq!(rows[0].unit_desc.as_deref(), Some("Wh"));

        let again = reading("M1", 60, ObisCode::new(0x0100), 30, MeasurementValue::Integer(1234));
        assert_eq!(store.insert(&again).await.unwrap(), InsertOutcome::Duplicate);

        let rows = store.view_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, format_timestamp(&at(0)));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.points, 1);
        assert_eq!(stats.timestamps, 1);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_with_cached_timestamp() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, "M1").await;

        let value = reading("M1", 0, energy(), 30, MeasurementValue::Decimal(12.5));
        assert_eq!(store.insert(&value).await.unwrap(), InsertOutcome::Stored);
        assert_eq!(store.insert(&value).await.unwrap(), InsertOutcome::Duplicate);
        assert_eq!(store.stats().await.unwrap().points, 1);
    }

    #[tokio::test]
    async fn test_dimension_rows_reused() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, "M1").await;

        let codes = [energy(), ObisCode::from_groups([1, 0, 16, 7, 0, 255])];
        for i in 0..12 {
            let code = codes[i as usize % codes.len()];
            let r = reading("M1", i, code, 30, MeasurementValue::Integer(1000 + i));
            assert_eq!(store.insert(&r).await.unwrap(), InsertOutcome::Stored);
        }

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.codes, 2);
        assert_eq!(stats.units, 1);
        assert_eq!(stats.devices, 1);
        assert_eq!(stats.points, 12);
        assert_eq!(stats.timestamps, 12);
    }

    #[tokio::test]
    async fn test_timestamp_cache_holds_five_most_recent() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, "M1").await;

        for i in 0..8 {
            let r = reading("M1", i, energy(), 30, MeasurementValue::Integer(i));
            store.insert(&r).await.unwrap();
        }

        assert_eq!(store.cached_timestamps(), (3..8).map(at).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_timestamp_shared_by_points() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, "M1").await;

        store.insert(&reading("M1", 0, energy(), 30, MeasurementValue::Integer(1))).await.unwrap();
        store
            .insert(&reading("M1", 0, ObisCode::new(0x0100), 27, MeasurementValue::Integer(2)))
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.timestamps, 1);
        assert_eq!(stats.points, 2);
    }

    #[tokio::test]
    async fn test_device_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, "M1").await;

        let r = reading("M2", 0, energy(), 30, MeasurementValue::Integer(1));
        assert!(matches!(store.insert(&r).await, Err(IngestError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_batched_commit_and_close_flush() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, "M1").await;

        // first insert creates dimension rows and commits immediately
        store.insert(&reading("M1", 0, energy(), 30, MeasurementValue::Integer(0))).await.unwrap();
        assert_eq!(store.pending(), 0);

        for i in 1..4 {
            store.insert(&reading("M1", i, energy(), 30, MeasurementValue::Integer(i))).await.unwrap();
        }
        assert_eq!(store.pending(), 3);

        for i in 4..10 {
            store.insert(&reading("M1", i, energy(), 30, MeasurementValue::Integer(i))).await.unwrap();
        }
        assert_eq!(store.pending(), 0);

        store.insert(&reading("M1", 10, energy(), 30, MeasurementValue::Integer(10))).await.unwrap();
        assert_eq!(store.pending(), 1);
        store.close().await.unwrap();

        let mut reopened = open(&dir, "M1").await;
        assert_eq!(reopened.stats().await.unwrap().points, 11);
        assert_eq!(reopened.cached_timestamps(), (6..11).map(at).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_text_bytes_and_reset_values() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, "M1").await;

        store.insert(&Reading::reset_marker("M1", at(0))).await.unwrap();
        store
            .insert(&reading("M1", 1, ObisCode::new(0x0100_6032_0101), NO_UNIT, MeasurementValue::Text("\"EMH\"".into())))
            .await
            .unwrap();
        store
            .insert(&reading("M1", 1, ObisCode::new(0x0100_6001_00FF), NO_UNIT, MeasurementValue::Bytes(vec![0xFF, 0xFE])))
            .await
            .unwrap();

        let rows = store.view_rows().await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].code, ObisCode::RESET);
        assert!(rows.iter().any(|r| r.value == MeasurementValue::Text("RESET".into())));
        assert!(rows.iter().any(|r| r.value == MeasurementValue::Text("\"EMH\"".into())));
        assert!(rows.iter().any(|r| r.value == MeasurementValue::Bytes(vec![0xFF, 0xFE])));
        assert!(rows.iter().all(|r| r.unit == NO_UNIT && r.unit_desc.as_deref() == Some("count")));
    }

    #[tokio::test]
    async fn test_commit_if_stale() {
        let dir = TempDir::new().unwrap();
        let mut store = open(&dir, "M1").await;

        store.insert(&reading("M1", 0, energy(), 30, MeasurementValue::Integer(0))).await.unwrap();
        assert!(!store.commit_if_stale(Duration::ZERO).await.unwrap());

        store.insert(&reading("M1", 1, energy(), 30, MeasurementValue::Integer(1))).await.unwrap();
        assert_eq!(store.pending(), 1);
        assert!(!store.commit_if_stale(Duration::from_secs(3600)).await.unwrap());
        assert_eq!(store.pending(), 1);
        assert!(store.commit_if_stale(Duration::ZERO).await.unwrap());
        assert_eq!(store.pending(), 0);
    }

    #[tokio::test]
    async fn test_pending_batch_blocks_store_sharing_the_file() {
        let dir = TempDir::new().unwrap();
        let mut options = StoreOptions::new(dir.path().join("meters.db"));
        options.busy_timeout = Duration::from_millis(200);
        let mut first = MeterStore::open("M1", "", &options, Arc::new(ObisCatalog)).await.unwrap();
        let mut second = MeterStore::open("M2", "", &options, Arc::new(ObisCatalog)).await.unwrap();

        // new dimension rows commit at once
        first.insert(&reading("M1", 0, energy(), 30, MeasurementValue::Integer(0))).await.unwrap();
        second.insert(&reading("M2", 0, energy(), 30, MeasurementValue::Integer(0))).await.unwrap();
        assert_eq!((first.pending(), second.pending()), (0, 0));

        first.insert(&reading("M1", 1, energy(), 30, MeasurementValue::Integer(1))).await.unwrap();
        assert_eq!(first.pending(), 1);

        let waiting = reading("M2", 1, energy(), 30, MeasurementValue::Integer(1));
        assert!(matches!(second.insert(&waiting).await, Err(IngestError::DatabaseError(_))));
        assert_eq!(second.pending(), 0);

        first.commit().await.unwrap();
        assert_eq!(second.insert(&waiting).await.unwrap(), InsertOutcome::Stored);
        second.commit().await.unwrap();

        first.insert(&reading("M1", 2, energy(), 30, MeasurementValue::Integer(2))).await.unwrap();
        assert_eq!(first.stats().await.unwrap().points, 5);

        first.close().await.unwrap();
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dimension_conflict_reloads_cache() {
        let dir = TempDir::new().unwrap();
        let mut first = open(&dir, "M1").await;
        let mut second = open(&dir, "M2").await;

        // both caches were loaded empty; the second store loses the race on unit and code
        first.insert(&reading("M1", 0, energy(), 30, MeasurementValue::Integer(1))).await.unwrap();
        assert_eq!(
            second.insert(&reading("M2", 0, energy(), 30, MeasurementValue::Integer(1))).await.unwrap(),
            InsertOutcome::Stored
        );

        let stats = second.stats().await.unwrap();
        assert_eq!(stats.devices, 2);
        assert_eq!(stats.units, 1);
        assert_eq!(stats.codes, 1);
        assert_eq!(stats.points, 2);
        assert_eq!(stats.timestamps, 1);

        first.close().await.unwrap();
        second.close().await.unwrap();
    }
}
