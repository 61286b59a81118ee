use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::{PipelineRecord, Store, StoreError};

/// SQLite-backed store. A single connection behind a mutex is plenty for the
/// target usage pattern (one interactive user driving one job at a time);
/// statements are short so the lock is never held across an await point.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pipeline (
    pkey     TEXT PRIMARY KEY,
    app_name TEXT NOT NULL,
    data     TEXT NOT NULL,
    created  TEXT NOT NULL,
    updated  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS store (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(storage_err)?;
        Self::bootstrap(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PipelineRecord> {
        let data_json: String = row.get(2)?;
        let created: String = row.get(3)?;
        let updated: String = row.get(4)?;
        Ok(PipelineRecord {
            pkey: row.get(0)?,
            app_name: row.get(1)?,
            // A corrupt blob degrades to empty state rather than failing the
            // whole read; absence of keys is normal for every consumer.
            data: serde_json::from_str(&data_json).unwrap_or_default(),
            created: parse_ts(&created),
            updated: parse_ts(&updated),
        })
    }
}

fn storage_err(err: rusqlite::Error) -> StoreError {
    StoreError::Storage(err.to_string())
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_record(&self, pkey: &str) -> Option<PipelineRecord> {
        let conn = self.conn.lock().ok()?;
        conn.query_row(
            "SELECT pkey, app_name, data, created, updated FROM pipeline WHERE pkey = ?1",
            params![pkey],
            Self::map_row,
        )
        .optional()
        .ok()
        .flatten()
    }

    async fn insert_record(&self, record: PipelineRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        let data = serde_json::Value::Object(record.data.clone()).to_string();
        let result = conn.execute(
            "INSERT INTO pipeline (pkey, app_name, data, created, updated)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.pkey,
                record.app_name,
                data,
                record.created.to_rfc3339(),
                record.updated.to_rfc3339()
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::KeyInUse(record.pkey))
            }
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn upsert_record(&self, record: PipelineRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        let data = serde_json::Value::Object(record.data.clone()).to_string();
        conn.execute(
            "INSERT INTO pipeline (pkey, app_name, data, created, updated)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(pkey) DO UPDATE SET
                 app_name = excluded.app_name,
                 data = excluded.data,
                 updated = excluded.updated",
            params![
                record.pkey,
                record.app_name,
                data,
                record.created.to_rfc3339(),
                record.updated.to_rfc3339()
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    async fn list_records(&self, app_name: Option<&str>) -> Vec<PipelineRecord> {
        let Ok(conn) = self.conn.lock() else {
            return vec![];
        };
        let result = match app_name {
            Some(app) => conn
                .prepare(
                    "SELECT pkey, app_name, data, created, updated FROM pipeline
                     WHERE app_name = ?1 ORDER BY updated DESC",
                )
                .and_then(|mut stmt| {
                    stmt.query_map(params![app], Self::map_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()
                }),
            None => conn
                .prepare(
                    "SELECT pkey, app_name, data, created, updated FROM pipeline
                     ORDER BY updated DESC",
                )
                .and_then(|mut stmt| {
                    stmt.query_map([], Self::map_row)?
                        .collect::<rusqlite::Result<Vec<_>>>()
                }),
        };
        match result {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list pipeline records");
                vec![]
            }
        }
    }

    async fn delete_record(&self, pkey: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        let n = conn
            .execute("DELETE FROM pipeline WHERE pkey = ?1", params![pkey])
            .map_err(storage_err)?;
        Ok(n > 0)
    }

    async fn kv_get(&self, key: &str) -> Option<String> {
        let conn = self.conn.lock().ok()?;
        conn.query_row(
            "SELECT value FROM store WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .ok()
        .flatten()
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        conn.execute(
            "INSERT INTO store (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().map_err(|_| poisoned())?;
        let n = conn
            .execute("DELETE FROM store WHERE key = ?1", params![key])
            .map_err(storage_err)?;
        Ok(n > 0)
    }
}

fn poisoned() -> StoreError {
    StoreError::Storage("store mutex poisoned".to_string())
}
