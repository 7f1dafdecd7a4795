// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Bonwerk Store: durable configuration documents and the job outcome log,
// both on SQLite.

pub mod job_log;
pub mod kv;

pub use job_log::{JobAction, JobLog, JobLogEntry};
pub use kv::{KeyValueStore, MemoryStore, SqliteStore};
