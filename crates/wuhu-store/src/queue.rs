// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::db::Store;
use crate::error::{Result, StoreError};
use crate::types::{Lane, QueueJournalAction, QueueJournalEntry, QueuePayload, QueuedItem};

/// These low-level primitives are the only thing `wuhu-store` knows about
/// queues: idempotent enqueue, cancel, drain, and materialize, each appending
/// an immutable `queue_journal` row. Lane semantics (which lane is
/// cancelable, drain ordering at interrupt checkpoints vs. turn boundaries)
/// live in `wuhu-queue`, one layer up.
impl Store {
    /// Enqueues `item_id` onto `lane` with `payload`. Idempotent: re-enqueuing
    /// the same `(session_id, lane, item_id)` while it is still pending is a
    /// no-op and returns the existing row rather than erroring.
    pub async fn enqueue(&self, session_id: &str, lane: Lane, item_id: &str, payload: QueuePayload) -> Result<QueuedItem> {
        let session_id = session_id.to_string();
        let item_id = item_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT state FROM queue_items WHERE session_id = ?1 AND lane = ?2 AND item_id = ?3",
                    params![session_id, lane.as_str(), item_id],
                    |r| r.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Err(StoreError::conflict(format!("item {item_id} already enqueued on {session_id}/{}", lane.as_str())));
            }

            let now = Utc::now();
            let payload_json = serde_json::to_string(&payload).map_err(|e| StoreError::StoreIntegrity(e.to_string()))?;
            tx.execute(
                "INSERT INTO queue_items (item_id, session_id, lane, state, payload_json, enqueued_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5)",
                params![item_id, session_id, lane.as_str(), payload_json, now.to_rfc3339()],
            )?;
            tx.execute(
                "INSERT INTO queue_journal (session_id, lane, item_id, at, action) VALUES (?1, ?2, ?3, ?4, 'enqueued')",
                params![session_id, lane.as_str(), item_id, now.to_rfc3339()],
            )?;
            tx.commit()?;

            Ok(QueuedItem { id: item_id, lane, enqueued_at: now, payload })
        })
        .await
    }

    /// Cancels a pending item. Lane cancelability is enforced by
    /// `wuhu-queue`; this primitive only checks the item is still pending.
    pub async fn cancel(&self, session_id: &str, lane: Lane, item_id: &str) -> Result<()> {
        let session_id = session_id.to_string();
        let item_id = item_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let changed = tx.execute(
                "UPDATE queue_items SET state = 'canceled' WHERE session_id = ?1 AND lane = ?2 AND item_id = ?3 AND state = 'pending'",
                params![session_id, lane.as_str(), item_id],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found(format!("pending item {item_id} on {session_id}/{}", lane.as_str())));
            }
            tx.execute(
                "INSERT INTO queue_journal (session_id, lane, item_id, at, action) VALUES (?1, ?2, ?3, ?4, 'canceled')",
                params![session_id, lane.as_str(), item_id, Utc::now().to_rfc3339()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Marks an item materialized, recording the transcript entry id it was
    /// turned into. Only valid from `pending`.
    pub async fn materialize(&self, session_id: &str, lane: Lane, item_id: &str, transcript_entry_id: i64) -> Result<()> {
        let session_id = session_id.to_string();
        let item_id = item_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let changed = tx.execute(
                "UPDATE queue_items SET state = 'materialized' WHERE session_id = ?1 AND lane = ?2 AND item_id = ?3 AND state = 'pending'",
                params![session_id, lane.as_str(), item_id],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found(format!("pending item {item_id} on {session_id}/{}", lane.as_str())));
            }
            tx.execute(
                "INSERT INTO queue_journal (session_id, lane, item_id, at, action, transcript_entry_id)
                 VALUES (?1, ?2, ?3, ?4, 'materialized', ?5)",
                params![session_id, lane.as_str(), item_id, Utc::now().to_rfc3339(), transcript_entry_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Pending items on `lane`, oldest first (FIFO drain order).
    pub async fn pending_items(&self, session_id: &str, lane: Lane) -> Result<Vec<QueuedItem>> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT item_id, payload_json, enqueued_at FROM queue_items
                 WHERE session_id = ?1 AND lane = ?2 AND state = 'pending' ORDER BY enqueued_at, item_id",
            )?;
            let rows = stmt.query_map(params![session_id, lane.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get(2)?))
            })?;
            let mut out = Vec::new();
            for r in rows {
                let (id, payload_json, enqueued_at): (String, String, chrono::DateTime<Utc>) = r?;
                let payload: QueuePayload =
                    serde_json::from_str(&payload_json).map_err(|e| StoreError::StoreIntegrity(e.to_string()))?;
                out.push(QueuedItem { id, lane, enqueued_at, payload });
            }
            Ok(out)
        })
        .await
    }

    /// Whether any lane for `session_id` has a pending item, used to derive
    /// the `has_work` flag without a full session-status recompute.
    pub async fn any_pending(&self, session_id: &str) -> Result<bool> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT count(*) FROM queue_items WHERE session_id = ?1 AND state = 'pending'",
                params![session_id],
                |r| r.get(0),
            )?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn queue_journal_since(&self, session_id: &str, after_id: Option<i64>) -> Result<Vec<QueueJournalEntry>> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let after = after_id.unwrap_or(0);
            let mut stmt = conn.prepare(
                "SELECT id, session_id, lane, item_id, at, action, transcript_entry_id
                 FROM queue_journal WHERE session_id = ?1 AND id > ?2 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![session_id, after], |row| {
                let lane_str: String = row.get(2)?;
                let action_str: String = row.get(5)?;
                let transcript_entry_id: Option<i64> = row.get(6)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    lane_str,
                    row.get::<_, String>(3)?,
                    row.get::<_, chrono::DateTime<Utc>>(4)?,
                    action_str,
                    transcript_entry_id,
                ))
            })?;
            let mut out = Vec::new();
            for r in rows {
                let (id, session_id, lane_str, item_id, at, action_str, transcript_entry_id) = r?;
                let lane = Lane::from_str_opt(&lane_str)
                    .ok_or_else(|| StoreError::StoreIntegrity(format!("unknown lane {lane_str}")))?;
                let action = match action_str.as_str() {
                    "enqueued" => QueueJournalAction::Enqueued,
                    "canceled" => QueueJournalAction::Canceled,
                    "materialized" => QueueJournalAction::Materialized {
                        transcript_entry_id: transcript_entry_id
                            .ok_or_else(|| StoreError::StoreIntegrity("materialized journal row missing entry id".into()))?,
                    },
                    other => return Err(StoreError::StoreIntegrity(format!("unknown journal action {other}"))),
                };
                out.push(QueueJournalEntry { id, session_id, lane, item_id, at, action });
            }
            Ok(out)
        })
        .await
    }
}
