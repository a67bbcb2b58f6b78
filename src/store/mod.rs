use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store unreachable: {0}")]
    Unreachable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The conditional read/write primitives the synchronization core consumes.
///
/// Paths address a document tree (`edges/like/{post}/{actor}`,
/// `counters/followers/{user}`, `threads/{key}`). Every call can fail with a
/// transport error distinct from "absent", and every call is a suspension
/// point the caller must treat as cancellable. Mutations are conditional so
/// that concurrent clients converge without application-level locking.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Read the value at `path`, `None` if absent.
    async fn read(&self, path: &str) -> StoreResult<Option<Value>>;

    /// Create the record at `path` only if no record exists there.
    /// Returns whether the write was applied.
    async fn write_if_absent(&self, path: &str, value: Value) -> StoreResult<bool>;

    /// Delete the record at `path` if one exists. Returns whether a record
    /// was actually removed.
    async fn remove_if_present(&self, path: &str) -> StoreResult<bool>;

    /// Unconditionally set the value at `path` (last writer wins). Used only
    /// for corrective counter writes.
    async fn set_field(&self, path: &str, value: Value) -> StoreResult<()>;

    /// Replace the value at `path` only if the stored value still equals
    /// `expected`. Returns whether the swap was applied.
    async fn set_if_matches(&self, path: &str, expected: &Value, value: Value)
        -> StoreResult<bool>;

    /// List all records directly or transitively under `prefix` (the prefix
    /// itself excluded).
    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>>;
}

/// SQLite-backed document store, thread-safe behind a single connection.
///
/// One `records` table keyed by path; the conditional semantics come from
/// SQL (`ON CONFLICT DO NOTHING`, affected-row counts), not from client-side
/// locking, so they hold across processes sharing the database file.
pub struct SqliteSync {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSync {
    /// Open (or create) a store at the given database path.
    pub fn new(db_path: &str) -> StoreResult<Self> {
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store for testing.
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                path TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

/// Escape LIKE wildcards so a prefix containing `%` or `_` matches literally.
fn escape_like(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[async_trait]
impl SyncStore for SqliteSync {
    async fn read(&self, path: &str) -> StoreResult<Option<Value>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = match conn.query_row(
            "SELECT value FROM records WHERE path = ?1",
            params![path],
            |row| row.get(0),
        ) {
            Ok(v) => Some(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(StoreError::Database(e)),
        };
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn write_if_absent(&self, path: &str, value: Value) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            r#"INSERT INTO records (path, value, updated_at) VALUES (?1, ?2, ?3)
               ON CONFLICT(path) DO NOTHING"#,
            params![path, serde_json::to_string(&value)?, Utc::now().to_rfc3339()],
        )?;
        Ok(rows == 1)
    }

    async fn remove_if_present(&self, path: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM records WHERE path = ?1", params![path])?;
        Ok(rows > 0)
    }

    async fn set_field(&self, path: &str, value: Value) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO records (path, value, updated_at) VALUES (?1, ?2, ?3)
               ON CONFLICT(path) DO UPDATE SET
                   value = excluded.value,
                   updated_at = excluded.updated_at"#,
            params![path, serde_json::to_string(&value)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn set_if_matches(
        &self,
        path: &str,
        expected: &Value,
        value: Value,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE records SET value = ?2, updated_at = ?3 WHERE path = ?1 AND value = ?4",
            params![
                path,
                serde_json::to_string(&value)?,
                Utc::now().to_rfc3339(),
                serde_json::to_string(expected)?,
            ],
        )?;
        Ok(rows == 1)
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
        let conn = self.conn.lock().unwrap();
        let pattern = format!("{}/%", escape_like(prefix));
        let mut stmt = conn.prepare(
            r#"SELECT path, value FROM records
               WHERE path LIKE ?1 ESCAPE '\' ORDER BY path"#,
        )?;
        let rows = stmt.query_map(params![pattern], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (path, raw) = row?;
            records.push((path, serde_json::from_str(&raw)?));
        }
        Ok(records)
    }
}
