// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::db::Store;
use crate::error::{Result, StoreError};
use crate::types::{EntryPayload, EnvironmentSnapshot, NewSession, Session, TranscriptEntry};

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let env_json: String = row.get(6)?;
    let environment: EnvironmentSnapshot = serde_json::from_str(&env_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e)))?;
    Ok(Session {
        id: row.get(0)?,
        provider: row.get(1)?,
        model: row.get(2)?,
        reasoning_effort: row.get(3)?,
        parent_session_id: row.get(4)?,
        working_dir: row.get(5)?,
        environment,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        head_entry_id: row.get(9)?,
        tail_entry_id: row.get(10)?,
        has_work: row.get::<_, i64>(11)? != 0,
    })
}

const SESSION_COLUMNS: &str = "id, provider, model, reasoning_effort, parent_session_id, working_dir, \
     environment_json, created_at, updated_at, head_entry_id, tail_entry_id, has_work";

impl Store {
    /// Creates a session and appends its immutable `Header` entry in one
    /// transaction, so a session is never observable without its header.
    pub async fn create_session(&self, new: NewSession) -> Result<Session> {
        self.with_conn(move |conn| {
            let now = Utc::now();
            let env_json = serde_json::to_string(&new.environment)
                .map_err(|e| StoreError::StoreIntegrity(e.to_string()))?;

            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO sessions (id, provider, model, reasoning_effort, parent_session_id, \
                 working_dir, environment_json, created_at, updated_at, head_entry_id, tail_entry_id, has_work)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 0, 0, 0)",
                params![
                    new.id,
                    new.provider,
                    new.model,
                    new.reasoning_effort,
                    new.parent_session_id,
                    new.working_dir,
                    env_json,
                    now.to_rfc3339(),
                ],
            )?;

            let header = EntryPayload::Header {
                version: 1,
                system_prompt: new.system_prompt.clone(),
                metadata: serde_json::Value::Null,
            };
            let payload_json = serde_json::to_string(&header)
                .map_err(|e| StoreError::StoreIntegrity(e.to_string()))?;
            tx.execute(
                "INSERT INTO session_entries (session_id, parent_entry_id, entry_type, payload_json, created_at)
                 VALUES (?1, NULL, 'header', ?2, ?3)",
                params![new.id, payload_json, now.to_rfc3339()],
            )?;
            let entry_id = tx.last_insert_rowid();

            tx.execute(
                "UPDATE sessions SET head_entry_id = ?2, tail_entry_id = ?2 WHERE id = ?1",
                params![new.id, entry_id],
            )?;
            tx.commit()?;

            let row = conn.query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![new.id],
                session_from_row,
            )?;
            Ok(row)
        })
        .await
    }

    pub async fn get_session(&self, id: &str) -> Result<Session> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id.clone()],
                session_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found(format!("session {id}")))
        })
        .await
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions ORDER BY created_at"))?;
            let rows = stmt.query_map([], session_from_row)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
    }

    /// Appends a new entry whose `parent_entry_id` must equal the session's
    /// current `tail_entry_id`. Enforced inside a transaction: SQLite's
    /// `no_fork` unique index catches concurrent writers, but a single
    /// connection serialized behind the store's mutex means this check is
    /// the only guard actually exercised in practice.
    pub async fn append_entry(&self, session_id: &str, payload: EntryPayload) -> Result<TranscriptEntry> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let tail: i64 = tx
                .query_row("SELECT tail_entry_id FROM sessions WHERE id = ?1", params![session_id], |r| r.get(0))
                .optional()?
                .ok_or_else(|| StoreError::not_found(format!("session {session_id}")))?;

            let now = Utc::now();
            let payload_json = serde_json::to_string(&payload)
                .map_err(|e| StoreError::StoreIntegrity(e.to_string()))?;
            let parent = if tail == 0 { None } else { Some(tail) };
            tx.execute(
                "INSERT INTO session_entries (session_id, parent_entry_id, entry_type, payload_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![session_id, parent, payload.kind_tag(), payload_json, now.to_rfc3339()],
            )?;
            let entry_id = tx.last_insert_rowid();

            tx.execute(
                "UPDATE sessions SET tail_entry_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![session_id, entry_id, now.to_rfc3339()],
            )?;
            tx.commit()?;

            Ok(TranscriptEntry {
                id: entry_id,
                session_id: session_id.clone(),
                parent_entry_id: parent,
                created_at: now,
                payload,
            })
        })
        .await
    }

    /// Returns entries in `(after_id, limit]` order, ascending by id.
    /// `after_id = None` starts from the beginning of the transcript.
    pub async fn get_entries(&self, session_id: &str, after_id: Option<i64>, limit: Option<i64>) -> Result<Vec<TranscriptEntry>> {
        self.get_entries_filtered(session_id, after_id, None, limit).await
    }

    /// Full form of [`Store::get_entries`], additionally supporting spec
    /// §4.1's `sinceTime` filter: entries created strictly after `since_time`
    /// (in addition to, not instead of, the `after_id` cursor, if both are
    /// given).
    pub async fn get_entries_filtered(
        &self,
        session_id: &str,
        after_id: Option<i64>,
        since_time: Option<chrono::DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Vec<TranscriptEntry>> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let after = after_id.unwrap_or(0);
            let limit = limit.unwrap_or(i64::MAX);
            let since_time = since_time.map(|t| t.to_rfc3339());
            let mut stmt = conn.prepare(
                "SELECT id, session_id, parent_entry_id, entry_type, payload_json, created_at
                 FROM session_entries
                 WHERE session_id = ?1 AND id > ?2 AND (?3 IS NULL OR created_at > ?3)
                 ORDER BY id LIMIT ?4",
            )?;
            let rows = stmt.query_map(params![session_id, after, since_time, limit], |row| {
                let payload_json: String = row.get(4)?;
                Ok((row.get(0)?, row.get(1)?, row.get::<_, Option<i64>>(2)?, payload_json, row.get(5)?))
            })?;
            let mut out = Vec::new();
            for r in rows {
                let (id, session_id, parent_entry_id, payload_json, created_at): (i64, String, Option<i64>, String, chrono::DateTime<Utc>) = r?;
                let payload: EntryPayload = serde_json::from_str(&payload_json)
                    .map_err(|e| StoreError::StoreIntegrity(e.to_string()))?;
                out.push(TranscriptEntry { id, session_id, parent_entry_id, created_at, payload });
            }
            Ok(out)
        })
        .await
    }

    /// Flips the persisted `has_work` flag, called by `wuhu-queue` whenever a
    /// lane transitions between empty and non-empty so session status can be
    /// derived without re-scanning queue tables on every read.
    pub async fn set_has_work(&self, session_id: &str, has_work: bool) -> Result<()> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE sessions SET has_work = ?2, updated_at = ?3 WHERE id = ?1",
                params![session_id, has_work as i64, Utc::now().to_rfc3339()],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found(format!("session {session_id}")));
            }
            Ok(())
        })
        .await
    }

    pub async fn set_model(&self, session_id: &str, provider: &str, model: &str, reasoning_effort: Option<&str>) -> Result<()> {
        let session_id = session_id.to_string();
        let provider = provider.to_string();
        let model = model.to_string();
        let reasoning_effort = reasoning_effort.map(|s| s.to_string());
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE sessions SET provider = ?2, model = ?3, reasoning_effort = ?4, updated_at = ?5 WHERE id = ?1",
                params![session_id, provider, model, reasoning_effort, Utc::now().to_rfc3339()],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found(format!("session {session_id}")));
            }
            Ok(())
        })
        .await
    }
}
