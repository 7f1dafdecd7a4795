// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job outcome log: append-only SQLite record of print job transitions.
//
// Schema:
//   job_log(
//     id             INTEGER PRIMARY KEY AUTOINCREMENT,
//     timestamp      TEXT    NOT NULL,   -- RFC 3339
//     job_id         TEXT    NOT NULL,
//     action         TEXT    NOT NULL,   -- "submitted", "started", "completed", ...
//     role           TEXT    NOT NULL,
//     device         TEXT    NOT NULL,
//     payload_digest TEXT    NOT NULL,   -- SHA-256 hex digest
//     success        INTEGER NOT NULL,
//     details        TEXT
//   )

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use bonwerk_core::error::{BonwerkError, Result};
use bonwerk_core::types::{JobId, PrintJob};

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS job_log (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp      TEXT    NOT NULL,
    job_id         TEXT    NOT NULL,
    action         TEXT    NOT NULL,
    role           TEXT    NOT NULL,
    device         TEXT    NOT NULL,
    payload_digest TEXT    NOT NULL,
    success        INTEGER NOT NULL,
    details        TEXT
);
CREATE INDEX IF NOT EXISTS job_log_job_id ON job_log (job_id);";

fn db_err(e: rusqlite::Error) -> BonwerkError {
    BonwerkError::Database(e.to_string())
}

/// Transition being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    Submitted,
    Started,
    Completed,
    /// Attempt failed, job re-queued.
    Retry,
    /// Retries exhausted.
    Failed,
    Cancelled,
}

impl JobAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Retry => "retry",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    fn is_success(&self) -> bool {
        !matches!(self, Self::Retry | Self::Failed)
    }
}

/// A single entry in the job log, used for queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub id: i64,
    pub timestamp: String,
    pub job_id: String,
    pub action: String,
    pub role: String,
    pub device: String,
    pub payload_digest: String,
    pub success: bool,
    pub details: Option<String>,
}

/// Append-only job log backed by a SQLite database.
pub struct JobLog {
    conn: Mutex<Connection>,
}

impl JobLog {
    /// Open (or create) the log database at `path`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(db_err)?;
        conn.execute_batch(CREATE_TABLE_SQL).map_err(db_err)?;

        debug!("job log opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory log (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(CREATE_TABLE_SQL).map_err(db_err)?;

        debug!("in-memory job log opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record a transition for `job`.
    #[instrument(skip(self, job, details), fields(job_id = %job.id, action = action.as_str()))]
    pub fn record(&self, job: &PrintJob, action: JobAction, details: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().expect("job log lock poisoned");
        conn.execute(
            "INSERT INTO job_log (timestamp, job_id, action, role, device, payload_digest, success, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                Utc::now().to_rfc3339(),
                job.id.to_string(),
                action.as_str(),
                job.role.to_string(),
                job.device_id.to_string(),
                job.payload.digest(),
                action.is_success() as i32,
                details,
            ],
        )
        .map_err(db_err)?;

        debug!("job log entry recorded");
        Ok(())
    }

    /// All entries for one job, oldest first.
    pub fn history(&self, job_id: &JobId) -> Result<Vec<JobLogEntry>> {
        self.query(
            "SELECT id, timestamp, job_id, action, role, device, payload_digest, success, details
             FROM job_log WHERE job_id = ?1 ORDER BY id ASC",
            params![job_id.to_string()],
        )
    }

    /// The most recent `limit` entries, newest first.
    pub fn recent(&self, limit: u32) -> Result<Vec<JobLogEntry>> {
        self.query(
            "SELECT id, timestamp, job_id, action, role, device, payload_digest, success, details
             FROM job_log ORDER BY id DESC LIMIT ?1",
            params![limit],
        )
    }

    /// Total number of entries.
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("job log lock poisoned");
        conn.query_row("SELECT COUNT(*) FROM job_log", [], |row| row.get(0))
            .map_err(db_err)
    }

    fn query(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<JobLogEntry>> {
        let conn = self.conn.lock().expect("job log lock poisoned");
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(args, |row| {
                Ok(JobLogEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    job_id: row.get(2)?,
                    action: row.get(3)?,
                    role: row.get(4)?,
                    device: row.get(5)?,
                    payload_digest: row.get(6)?,
                    success: row.get::<_, i32>(7)? != 0,
                    details: row.get(8)?,
                })
            })
            .map_err(db_err)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(db_err)?);
        }
        Ok(entries)
    }
}
