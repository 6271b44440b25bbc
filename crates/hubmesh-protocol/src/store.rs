//! Persistent device metadata (tags and names).
//!
//! Keys follow `internal.device.<id>.<field>`. Values are JSON.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use serde_json::Value;

use crate::error::MeshError;
use crate::types::now_ms;

/// Key/value storage the registry persists metadata through.
pub trait MetadataStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, MeshError>;

    fn put(&self, key: &str, value: Value) -> Result<(), MeshError>;
}

/// Storage key of a device's persisted field.
pub fn device_key(id: &str, field: &str) -> String {
    format!("internal.device.{id}.{field}")
}

// ── In-memory ──────────────────────────────────────────────────────────

/// Process-local store; forgets everything on exit.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, MeshError> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| MeshError::Storage(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> Result<(), MeshError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| MeshError::Storage(e.to_string()))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }
}

// ── SQLite ─────────────────────────────────────────────────────────────

/// Store backed by a single SQLite table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MeshError> {
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, MeshError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, MeshError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS device_metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl MetadataStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Value>, MeshError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| MeshError::Storage(e.to_string()))?;
        let result = conn.query_row(
            "SELECT value FROM device_metadata WHERE key = ?1",
            rusqlite::params![key],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: Value) -> Result<(), MeshError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| MeshError::Storage(e.to_string()))?;
        let text = serde_json::to_string(&value)?;
        conn.execute(
            "INSERT INTO device_metadata (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            rusqlite::params![key, text, now_ms() as i64],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exercise(store: &dyn MetadataStore) {
        let key = device_key("light:kitchen", "tags");
        assert_eq!(store.get(&key).unwrap(), None);

        store.put(&key, json!(["downstairs"])).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(json!(["downstairs"])));

        store.put(&key, json!(["downstairs", "warm"])).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(json!(["downstairs", "warm"])));
    }

    #[test]
    fn memory_store_roundtrip() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn sqlite_in_memory_roundtrip() {
        exercise(&SqliteStore::in_memory().unwrap());
    }

    #[test]
    fn sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .put(&device_key("light:desk", "name"), json!("Desk lamp"))
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.get(&device_key("light:desk", "name")).unwrap(),
            Some(json!("Desk lamp"))
        );
    }

    #[test]
    fn device_key_format() {
        assert_eq!(device_key("a:b", "tags"), "internal.device.a:b.tags");
    }
}
