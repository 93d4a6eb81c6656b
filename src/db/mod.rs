//! Database module for Planner Sync
//!
//! Provides SQLite key/value storage used by the sync queue snapshot and the
//! scheduler configuration.

use rusqlite::params;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Create a new database connection pool backed by a file
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(4)
            .min_idle(Some(1))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;

        conn.execute_batch(r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#)?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        drop(conn);

        log::info!("Database opened at {}", db_path.display());

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every pooled `:memory:` connection is its own database, so the pool is
    /// pinned to a single connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder()
            .max_size(1)
            .build(manager)?;

        let conn = pool.get()?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        match self.get_setting_raw(key)? {
            Some(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let json = serde_json::to_string(value)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        self.set_setting_raw(key, &json)
    }

    /// Get a setting as the raw stored JSON text
    pub fn get_setting_raw(&self, key: &str) -> DbResult<Option<String>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => Ok(Some(json)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace a setting with already-serialized JSON text in one statement
    pub fn set_setting_raw(&self, key: &str, json: &str) -> DbResult<()> {
        let conn = self.get_conn()?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO settings (key, value, updated_at)
            VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            "#,
            params![key, json],
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_setting_roundtrip() {
        let db = Database::in_memory().unwrap();
        let sample = Sample { name: "queue".to_string(), count: 3 };

        db.set_setting("sample", &sample).unwrap();
        let loaded: Option<Sample> = db.get_setting("sample").unwrap();

        assert_eq!(loaded, Some(sample));
    }

    #[test]
    fn test_missing_setting() {
        let db = Database::in_memory().unwrap();
        let loaded: Option<Sample> = db.get_setting("absent").unwrap();
        assert!(loaded.is_none());
        assert!(db.get_setting_raw("absent").unwrap().is_none());
    }

    #[test]
    fn test_setting_overwrite() {
        let db = Database::in_memory().unwrap();

        db.set_setting_raw("key", "1").unwrap();
        db.set_setting_raw("key", "2").unwrap();
        assert_eq!(db.get_setting_raw("key").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.db");

        {
            let db = Database::new(path.clone()).unwrap();
            db.set_setting("sample", &Sample { name: "a".into(), count: 1 }).unwrap();
        }

        let reopened = Database::new(path).unwrap();
        let loaded: Option<Sample> = reopened.get_setting("sample").unwrap();
        assert_eq!(loaded.map(|s| s.count), Some(1));
    }
}
