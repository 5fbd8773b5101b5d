//! SQLite-backed durable store.
//!
//! Uses rusqlite with WAL mode for concurrent read performance. All database
//! operations are executed via `tokio::task::spawn_blocking` to avoid
//! blocking the async runtime. The single connection behind a mutex also
//! serializes writes, which the per-record concurrency contract relies on.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};

use crate::error::OrchestratorError;
use crate::store::KvStore;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, OrchestratorError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| OrchestratorError::Store(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| OrchestratorError::Store(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite store opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, OrchestratorError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| OrchestratorError::Store(format!("Failed to open in-memory db: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, OrchestratorError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| OrchestratorError::Store(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| OrchestratorError::Store(e.to_string()))
    }

    /// Execute a closure with access to the database connection
    /// (async-friendly, runs on the blocking pool).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, OrchestratorError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| OrchestratorError::Store(format!("Task join error: {}", e)))?
    }

    fn initialize_tables(&self) -> Result<(), OrchestratorError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS kv (
                    key     TEXT PRIMARY KEY,
                    value   TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS kv_hash (
                    key     TEXT NOT NULL,
                    field   TEXT NOT NULL,
                    value   TEXT NOT NULL,
                    PRIMARY KEY (key, field)
                );
                ",
            )
        })
    }
}

/// [`KvStore`] implementation over [`Database`].
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, OrchestratorError> {
        let key = key.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT value FROM kv WHERE key = ?1",
                    rusqlite::params![key],
                    |row| row.get(0),
                )
                .optional()
            })
            .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), OrchestratorError> {
        let key = key.to_string();
        let value = value.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    rusqlite::params![key, value],
                )?;
                Ok(())
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), OrchestratorError> {
        let key = key.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute("DELETE FROM kv WHERE key = ?1", rusqlite::params![key])?;
                Ok(())
            })
            .await
    }

    async fn list_keys(
        &self,
        prefix: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, OrchestratorError> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key FROM kv WHERE key LIKE ?1 ESCAPE '\\'
                     ORDER BY key LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![pattern, limit as i64, offset as i64],
                        |row| row.get(0),
                    )?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool, OrchestratorError> {
        let key = key.to_string();
        let expected = expected.map(|s| s.to_string());
        let new = new.to_string();
        self.db
            .with_conn_async(move |conn| {
                let affected = match expected {
                    Some(exp) => conn.execute(
                        "UPDATE kv SET value = ?1 WHERE key = ?2 AND value = ?3",
                        rusqlite::params![new, key, exp],
                    )?,
                    None => conn.execute(
                        "INSERT INTO kv (key, value) VALUES (?1, ?2)
                         ON CONFLICT(key) DO NOTHING",
                        rusqlite::params![key, new],
                    )?,
                };
                Ok(affected > 0)
            })
            .await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, OrchestratorError> {
        let key = key.to_string();
        let field = field.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT value FROM kv_hash WHERE key = ?1 AND field = ?2",
                    rusqlite::params![key, field],
                    |row| row.get(0),
                )
                .optional()
            })
            .await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), OrchestratorError> {
        let key = key.to_string();
        let field = field.to_string();
        let value = value.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO kv_hash (key, field, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
                    rusqlite::params![key, field, value],
                )?;
                Ok(())
            })
            .await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), OrchestratorError> {
        let key = key.to_string();
        let field = field.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "DELETE FROM kv_hash WHERE key = ?1 AND field = ?2",
                    rusqlite::params![key, field],
                )?;
                Ok(())
            })
            .await
    }

    async fn hfields(&self, key: &str) -> Result<Vec<(String, String)>, OrchestratorError> {
        let key = key.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT field, value FROM kv_hash WHERE key = ?1 ORDER BY field",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![key], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::new(Database::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let s = store();
        assert!(s.get("a").await.unwrap().is_none());
        s.set("a", "1").await.unwrap();
        assert_eq!(s.get("a").await.unwrap().as_deref(), Some("1"));
        s.set("a", "2").await.unwrap();
        assert_eq!(s.get("a").await.unwrap().as_deref(), Some("2"));
        s.delete("a").await.unwrap();
        assert!(s.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_keys_paged() {
        let s = store();
        for i in 0..5 {
            s.set(&format!("instance:{}", i), "x").await.unwrap();
        }
        s.set("run:0", "y").await.unwrap();

        let page1 = s.list_keys("instance:", 0, 3).await.unwrap();
        assert_eq!(page1, vec!["instance:0", "instance:1", "instance:2"]);
        let page2 = s.list_keys("instance:", 3, 3).await.unwrap();
        assert_eq!(page2, vec!["instance:3", "instance:4"]);
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let s = store();
        // Insert-if-absent
        assert!(s.compare_and_swap("k", None, "v1").await.unwrap());
        assert!(!s.compare_and_swap("k", None, "v2").await.unwrap());
        // Swap on match only
        assert!(s.compare_and_swap("k", Some("v1"), "v2").await.unwrap());
        assert!(!s.compare_and_swap("k", Some("v1"), "v3").await.unwrap());
        assert_eq!(s.get("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("maestro.db");
        let db_path = db_path.to_str().unwrap();

        {
            let s = SqliteStore::new(Database::open(db_path).unwrap());
            s.set("instance:alpha", r#"{"status":"active"}"#).await.unwrap();
            s.hset("run:1", "stage", "commit").await.unwrap();
        }

        // A fresh handle over the same file sees the earlier writes.
        let s = SqliteStore::new(Database::open(db_path).unwrap());
        assert_eq!(
            s.get("instance:alpha").await.unwrap().as_deref(),
            Some(r#"{"status":"active"}"#)
        );
        assert_eq!(
            s.hget("run:1", "stage").await.unwrap().as_deref(),
            Some("commit")
        );
    }

    #[tokio::test]
    async fn test_hash_fields() {
        let s = store();
        s.hset("h", "f1", "a").await.unwrap();
        s.hset("h", "f2", "b").await.unwrap();
        assert_eq!(s.hget("h", "f1").await.unwrap().as_deref(), Some("a"));
        assert_eq!(
            s.hfields("h").await.unwrap(),
            vec![
                ("f1".to_string(), "a".to_string()),
                ("f2".to_string(), "b".to_string())
            ]
        );
        s.hdel("h", "f1").await.unwrap();
        assert!(s.hget("h", "f1").await.unwrap().is_none());
    }
}
