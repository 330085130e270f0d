pub mod meter_store;
pub mod models;
pub mod schema;
pub mod timestamp_cache;

pub use meter_store::{MeterStore, StoreOptions, COMMIT_INTERVAL, TIMESTAMP_CACHE_CAPACITY};
pub use models::{format_timestamp, InsertOutcome, MeasurementValue, Reading, StoreStats, ViewRow};
pub use schema::StoreSchema;
pub use timestamp_cache::TimestampCache;
