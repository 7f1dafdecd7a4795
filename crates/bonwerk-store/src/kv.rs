// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Durable key-value store for small JSON documents.
//
// The role mapping table and the saved-device list each live under one key.
// Writers go through `update`, which runs the read-modify-write inside a
// single SQLite transaction so concurrent writers never lose each other's
// changes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde_json::Value;
use tracing::{debug, info, instrument};

use bonwerk_core::error::{BonwerkError, Result};

/// SQLite schema for the documents table.
const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS documents (
        key        TEXT PRIMARY KEY,
        value      TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
"#;

/// Convert a `rusqlite::Error` into a `BonwerkError::Database`.
fn db_err(e: rusqlite::Error) -> BonwerkError {
    BonwerkError::Database(e.to_string())
}

/// Storage for JSON documents keyed by name.
///
/// Implementations must make `update` atomic: no other writer may observe or
/// modify the document between the read and the write.
pub trait KeyValueStore: Send + Sync {
    /// Read the document stored under `key`.
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Replace the document stored under `key`.
    fn put(&self, key: &str, value: &Value) -> Result<()>;

    /// Remove the document. Idempotent.
    fn delete(&self, key: &str) -> Result<()>;

    /// Atomically read, transform and write back the document.
    ///
    /// If `f` fails, nothing is written and the error is returned.
    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<Value>) -> Result<Value>,
    ) -> Result<Value>;
}

/// Key-value store backed by a SQLite database.
///
/// `rusqlite::Connection` is `Send` but not `Sync`, so it sits behind a
/// mutex. Documents are tiny and operations are sub-millisecond.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;

        // WAL survives unclean shutdowns more gracefully.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db_err)?;
        conn.execute_batch(CREATE_TABLE_SQL).map_err(db_err)?;

        info!("key-value store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(CREATE_TABLE_SQL).map_err(db_err)?;

        debug!("in-memory key-value store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn read_document(conn: &Connection, key: &str) -> Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM documents WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;

    raw.map(|s| serde_json::from_str(&s).map_err(BonwerkError::from))
        .transpose()
}

fn write_document(conn: &Connection, key: &str, value: &Value) -> Result<()> {
    let json = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO documents (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, json, Utc::now().to_rfc3339()],
    )
    .map_err(db_err)?;
    Ok(())
}

impl KeyValueStore for SqliteStore {
    #[instrument(skip(self))]
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        read_document(&conn, key)
    }

    #[instrument(skip(self, value))]
    fn put(&self, key: &str, value: &Value) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        write_document(&conn, key, value)?;
        debug!(key, "document written");
        Ok(())
    }

    #[instrument(skip(self))]
    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute("DELETE FROM documents WHERE key = ?1", params![key])
            .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self, f))]
    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<Value>) -> Result<Value>,
    ) -> Result<Value> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let current = read_document(&tx, key)?;
        // Dropping `tx` on the error path rolls back.
        let next = f(current)?;
        write_document(&tx, key, &next)?;
        tx.commit().map_err(db_err)?;

        debug!(key, "document updated");
        Ok(next)
    }
}

/// Volatile store used by tests and as a fallback when the database cannot
/// be opened.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let docs = self.docs.lock().expect("store lock poisoned");
        Ok(docs.get(key).cloned())
    }

    fn put(&self, key: &str, value: &Value) -> Result<()> {
        let mut docs = self.docs.lock().expect("store lock poisoned");
        docs.insert(key.to_owned(), value.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut docs = self.docs.lock().expect("store lock poisoned");
        docs.remove(key);
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<Value>) -> Result<Value>,
    ) -> Result<Value> {
        let mut docs = self.docs.lock().expect("store lock poisoned");
        let next = f(docs.get(key).cloned())?;
        docs.insert(key.to_owned(), next.clone());
        Ok(next)
    }
}
