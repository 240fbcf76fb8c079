// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::error::Result;

/// Schema version bumped whenever `SCHEMA_SQL` changes shape. Stored in
/// SQLite's `user_version` pragma so a future migration path has somewhere
/// to read from; this crate does not yet ship migrations.
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS environments (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL UNIQUE,
    kind            TEXT NOT NULL,
    path            TEXT NOT NULL,
    template_path   TEXT,
    startup_script  TEXT
);

CREATE TABLE IF NOT EXISTS sessions (
    id                  TEXT PRIMARY KEY,
    provider            TEXT NOT NULL,
    model               TEXT NOT NULL,
    reasoning_effort    TEXT,
    parent_session_id   TEXT,
    working_dir         TEXT NOT NULL,
    environment_json    TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    head_entry_id       INTEGER NOT NULL DEFAULT 0,
    tail_entry_id       INTEGER NOT NULL DEFAULT 0,
    has_work            INTEGER NOT NULL DEFAULT 0
);

-- Append-only transcript. `parent_entry_id` must equal the session's
-- `tail_entry_id` at append time; the linear-chain ("no fork") invariant is
-- enforced at the application layer inside a single transaction since SQLite
-- cannot express "parent must equal the current max" as a constraint.
CREATE TABLE IF NOT EXISTS session_entries (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id          TEXT NOT NULL REFERENCES sessions(id),
    parent_entry_id     INTEGER,
    entry_type          TEXT NOT NULL,
    payload_json        TEXT NOT NULL,
    created_at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_session_entries_session
    ON session_entries(session_id, id);

-- At most one header entry per session.
CREATE UNIQUE INDEX IF NOT EXISTS idx_session_entries_single_header
    ON session_entries(session_id)
    WHERE entry_type = 'header';

-- No two entries in the same session may share a parent: the chain is
-- linear, never a tree.
CREATE UNIQUE INDEX IF NOT EXISTS idx_session_entries_no_fork
    ON session_entries(session_id, parent_entry_id)
    WHERE parent_entry_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS queue_items (
    item_id         TEXT NOT NULL,
    session_id      TEXT NOT NULL REFERENCES sessions(id),
    lane            TEXT NOT NULL,
    state           TEXT NOT NULL,
    payload_json    TEXT NOT NULL,
    enqueued_at     TEXT NOT NULL,
    PRIMARY KEY (session_id, lane, item_id)
);

CREATE INDEX IF NOT EXISTS idx_queue_items_pending
    ON queue_items(session_id, lane, state);

CREATE TABLE IF NOT EXISTS queue_journal (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id              TEXT NOT NULL REFERENCES sessions(id),
    lane                    TEXT NOT NULL,
    item_id                 TEXT NOT NULL,
    at                      TEXT NOT NULL,
    action                  TEXT NOT NULL,
    transcript_entry_id     INTEGER
);

CREATE INDEX IF NOT EXISTS idx_queue_journal_session
    ON queue_journal(session_id, id);
"#;

/// Thin wrapper around a single `rusqlite::Connection`, serialized behind a
/// tokio mutex and bridged into async callers via `spawn_blocking`. Matches
/// the teacher's `agtrace-index` store shape: one writer connection, blocking
/// calls confined to a dedicated thread-pool task.
#[derive(Clone)]
pub struct Store {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if necessary) a SQLite database at `path` and apply the
    /// schema. `path` of `:memory:` opens a private in-memory database.
    pub async fn open(path: &str) -> Result<Self> {
        let path = path.to_string();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)?;
            init_schema(&conn)?;
            Ok(conn)
        })
        .await??;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Open a private in-memory database, for tests and single-shot runs.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection> {
            let conn = Connection::open_in_memory()?;
            init_schema(&conn)?;
            Ok(conn)
        })
        .await??;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Run a blocking closure with exclusive access to the connection on the
    /// blocking thread-pool. Every store operation funnels through this.
    pub(crate) async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.blocking_lock();
            f(&guard)
        })
        .await?
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    conn.execute_batch(SCHEMA_SQL)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}
