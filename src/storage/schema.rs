use log::{debug, info};
use sqlx::SqliteConnection;

use crate::utils::error::IngestError;

const TABLES: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS b_DEVICES (
        pk INTEGER PRIMARY KEY AUTOINCREMENT,
        value TEXT NOT NULL,
        description TEXT,
        UNIQUE(value)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS b_UNITS (
        pk INTEGER PRIMARY KEY AUTOINCREMENT,
        value INTEGER NOT NULL,
        description TEXT,
        UNIQUE(value)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS b_CODES (
        pk INTEGER PRIMARY KEY AUTOINCREMENT,
        value INTEGER NOT NULL,
        description TEXT,
        UNIQUE(value)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS m_TIMESTAMPS (
        pk INTEGER PRIMARY KEY AUTOINCREMENT,
        value TEXT NOT NULL,
        UNIQUE(value)
    )
    "#,
    // value is untyped on purpose: integers, reals, text and blobs share it
    r#"
    CREATE TABLE IF NOT EXISTS m_POINTS (
        pk INTEGER PRIMARY KEY AUTOINCREMENT,
        pk_timestamp INTEGER,
        pk_device INTEGER NOT NULL,
        pk_code INTEGER NOT NULL,
        pk_unit INTEGER NOT NULL,
        value,
        UNIQUE(pk_device, pk_code, pk_unit, value)
    )
    "#,
];

const INDEXES: [&str; 1] = ["CREATE INDEX IF NOT EXISTS idx_points_timestamp ON m_POINTS(pk_timestamp)"];

pub struct StoreSchema;

impl StoreSchema {
    pub async fn create(conn: &mut SqliteConnection) -> Result<(), IngestError> {
        debug!("🔧 Ensuring store schema");

        for sql in TABLES.iter().chain(INDEXES.iter()) {
            sqlx::query(sql).execute(&mut *conn).await?;
        }

        Ok(())
    }

    pub fn view_name(device: &str) -> String {
        format!("v_{}", device)
    }

    /// `CREATE VIEW` statement for one device. The device identity ends up in
    /// an identifier, so it is quoted rather than bound.
    pub fn view_sql(device: &str, pk_device: i64) -> String {
        format!(
            r#"
            CREATE VIEW IF NOT EXISTS {} AS
            SELECT mt.value AS timestamp,
                   bc.value AS code,
                   bc.description AS code_desc,
                   bu.value AS unit,
                   bu.description AS unit_desc,
                   mp.value AS value
            FROM m_POINTS mp
                INNER JOIN m_TIMESTAMPS mt ON (mp.pk_timestamp = mt.pk)
                INNER JOIN b_CODES      bc ON (mp.pk_code      = bc.pk)
                INNER JOIN b_UNITS      bu ON (mp.pk_unit      = bu.pk)
            WHERE mp.pk_device = {}
            ORDER BY timestamp, code
            "#,
            quote_identifier(&Self::view_name(device)),
            pk_device
        )
    }

    pub async fn create_view(conn: &mut SqliteConnection, device: &str, pk_device: i64) -> bool {
        match sqlx::query(&Self::view_sql(device, pk_device)).execute(&mut *conn).await {
            Ok(_) => {
                info!("👁️  View {} ready", Self::view_name(device));
                true
            }
            Err(e) => {
                debug!("View {} not created: {}", Self::view_name(device), e);
                false
            }
        }
    }
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("v_M1"), "\"v_M1\"");
        assert_eq!(quote_identifier("v_a\"b"), "\"v_a\"\"b\"");
    }

    #[test]
    fn test_view_sql_filters_device() {
        let sql = StoreSchema::view_sql("M1", 7);
        assert!(sql.contains("CREATE VIEW IF NOT EXISTS \"v_M1\""));
        assert!(sql.contains("WHERE mp.pk_device = 7"));
        assert!(sql.contains("ORDER BY timestamp, code"));
    }
}
