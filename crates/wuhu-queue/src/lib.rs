// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Three-lane input queueing on top of `wuhu-store`: `system` (not
//! cancelable, machine-sourced), `steer` (cancelable, drained at interrupt
//! checkpoints), `followUp` (cancelable, drained at turn boundaries).
//!
//! This crate owns lane semantics — which lanes are cancelable, drain
//! ordering — while `wuhu-store` owns the durable representation (pending
//! item rows, append-only journal).

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;
use wuhu_store::{Lane, QueueJournalAction, QueuePayload, QueuedItem, Store, StoreError};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("cannot cancel non-cancelable lane {0:?}")]
    NotCancelable(Lane),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// A thin façade over `Store`'s queue primitives enforcing lane-level rules.
pub struct QueueManager<'a> {
    store: &'a Store,
}

impl<'a> QueueManager<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Enqueues `payload` on `lane`, allocating a fresh id if none is given.
    /// Re-enqueuing an existing id is idempotent: a `Conflict` from the store
    /// (meaning the id is already pending) is swallowed and the caller's id
    /// is returned unchanged.
    pub async fn enqueue(&self, session_id: &str, lane: Lane, id: Option<String>, payload: QueuePayload) -> Result<String> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        match self.store.enqueue(session_id, lane, &id, payload).await {
            Ok(_) => {}
            Err(StoreError::Conflict(_)) => {
                debug!(session_id, id = %id, ?lane, "enqueue is idempotent, id already pending");
            }
            Err(e) => return Err(e.into()),
        }
        self.store.set_has_work(session_id, true).await?;
        Ok(id)
    }

    /// Cancels a pending item. Only `steer` and `followUp` are cancelable;
    /// `system` items can never be canceled once enqueued.
    pub async fn cancel(&self, session_id: &str, lane: Lane, id: &str) -> Result<()> {
        if !lane.is_cancelable() {
            return Err(QueueError::NotCancelable(lane));
        }
        // "Fails silently if already terminal": swallow NotFound, which the
        // store returns for an id that is missing or no longer pending.
        match self.store.cancel(session_id, lane, id).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.refresh_has_work(session_id).await?;
        Ok(())
    }

    /// Returns pending items across `lanes`, oldest first across all lanes
    /// combined (by enqueue timestamp), matching `drainPending`'s contract.
    /// Does not modify state.
    pub async fn drain_pending(&self, session_id: &str, lanes: &[Lane]) -> Result<Vec<QueuedItem>> {
        let mut items = Vec::new();
        for &lane in lanes {
            items.extend(self.store.pending_items(session_id, lane).await?);
        }
        items.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        Ok(items)
    }

    /// Atomically links a materialized item to its transcript entry.
    pub async fn mark_materialized(&self, session_id: &str, lane: Lane, id: &str, transcript_entry_id: i64) -> Result<()> {
        self.store.materialize(session_id, lane, id, transcript_entry_id).await?;
        self.refresh_has_work(session_id).await?;
        Ok(())
    }

    /// Recomputes and persists `has_work` from the current pending-item
    /// count across every lane, called after any mutation that may have
    /// emptied or filled a lane.
    async fn refresh_has_work(&self, session_id: &str) -> Result<()> {
        let has_work = self.store.any_pending(session_id).await?;
        self.store.set_has_work(session_id, has_work).await?;
        Ok(())
    }

    /// Interrupt-checkpoint drain set: `system` + `steer`.
    pub fn interrupt_lanes() -> [Lane; 2] {
        [Lane::System, Lane::Steer]
    }

    /// Turn-boundary fallback drain set, used only when the interrupt lanes
    /// are empty.
    pub fn follow_up_lane() -> [Lane; 1] {
        [Lane::FollowUp]
    }
}

/// Collapses `Enqueued` + `Materialized` pairs for the same item within a
/// single journal window into one summary, per the subscription engine's
/// coalescing rule (spec §4.6): a journal record whose item was both
/// enqueued and materialized inside the window being backfilled appears
/// once, not twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoalescedJournalRecord {
    Enqueued { item_id: String },
    Canceled { item_id: String },
    /// The item both entered and left the pending state inside this window.
    Materialized { item_id: String, transcript_entry_id: i64 },
}

pub fn coalesce_journal(entries: &[wuhu_store::QueueJournalEntry]) -> Vec<CoalescedJournalRecord> {
    use std::collections::HashMap;

    let mut enqueued_at: HashMap<&str, usize> = HashMap::new();
    let mut out: Vec<Option<CoalescedJournalRecord>> = Vec::with_capacity(entries.len());

    for entry in entries {
        match &entry.action {
            QueueJournalAction::Enqueued => {
                enqueued_at.insert(&entry.item_id, out.len());
                out.push(Some(CoalescedJournalRecord::Enqueued { item_id: entry.item_id.clone() }));
            }
            QueueJournalAction::Canceled => {
                if let Some(&idx) = enqueued_at.get(entry.item_id.as_str()) {
                    out[idx] = None;
                }
                out.push(Some(CoalescedJournalRecord::Canceled { item_id: entry.item_id.clone() }));
            }
            QueueJournalAction::Materialized { transcript_entry_id } => {
                if let Some(&idx) = enqueued_at.get(entry.item_id.as_str()) {
                    out[idx] = Some(CoalescedJournalRecord::Materialized {
                        item_id: entry.item_id.clone(),
                        transcript_entry_id: *transcript_entry_id,
                    });
                    continue;
                }
                out.push(Some(CoalescedJournalRecord::Materialized {
                    item_id: entry.item_id.clone(),
                    transcript_entry_id: *transcript_entry_id,
                }));
            }
        }
    }

    out.into_iter().flatten().collect()
}

/// Applies the same collapsing rule as [`coalesce_journal`] but returns the
/// original [`wuhu_store::QueueJournalEntry`] rows rather than the summary
/// enum, dropping only the now-redundant `Enqueued` row when a terminal
/// record for the same item appears later in the same slice. Used by the
/// subscription engine to coalesce a `StablePatch`'s journal vectors without
/// changing their wire shape (spec §4.6).
pub fn coalesce_entries(entries: &[wuhu_store::QueueJournalEntry]) -> Vec<wuhu_store::QueueJournalEntry> {
    use std::collections::HashMap;

    let mut enqueued_at: HashMap<&str, usize> = HashMap::new();
    let mut out: Vec<Option<wuhu_store::QueueJournalEntry>> = Vec::with_capacity(entries.len());

    for entry in entries {
        match &entry.action {
            QueueJournalAction::Enqueued => {
                enqueued_at.insert(&entry.item_id, out.len());
                out.push(Some(entry.clone()));
            }
            QueueJournalAction::Canceled | QueueJournalAction::Materialized { .. } => {
                if let Some(&idx) = enqueued_at.get(entry.item_id.as_str()) {
                    out[idx] = None;
                }
                out.push(Some(entry.clone()));
            }
        }
    }

    out.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wuhu_store::{Author, EnvironmentKind, EnvironmentSnapshot, NewSession, ParticipantKind};

    async fn store_with_session(id: &str) -> Store {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_session(NewSession {
                id: id.to_string(),
                provider: "openai".into(),
                model: "gpt-5.1".into(),
                reasoning_effort: None,
                parent_session_id: None,
                working_dir: "/workspace".into(),
                environment: EnvironmentSnapshot {
                    name: "default".into(),
                    kind: EnvironmentKind::Local,
                    path: "/workspace".into(),
                    template_path: None,
                    startup_script: None,
                },
                system_prompt: None,
            })
            .await
            .unwrap();
        store
    }

    fn party(text: &str) -> QueuePayload {
        QueuePayload::Party {
            author: Author::Participant { id: "alice".into(), kind: ParticipantKind::Human },
            content: serde_json::json!(text),
        }
    }

    #[tokio::test]
    async fn enqueue_sets_has_work() {
        let store = store_with_session("s1").await;
        let mgr = QueueManager::new(&store);
        mgr.enqueue("s1", Lane::FollowUp, None, party("hi")).await.unwrap();
        assert!(store.get_session("s1").await.unwrap().has_work);
    }

    #[tokio::test]
    async fn cancel_system_lane_is_rejected() {
        let store = store_with_session("s1").await;
        let mgr = QueueManager::new(&store);
        let id = mgr
            .enqueue("s1", Lane::System, None, QueuePayload::System { source: "runner".into(), content: serde_json::json!({}) })
            .await
            .unwrap();
        let err = mgr.cancel("s1", Lane::System, &id).await.unwrap_err();
        assert!(matches!(err, QueueError::NotCancelable(Lane::System)));
    }

    #[tokio::test]
    async fn cancel_already_canceled_is_silent() {
        let store = store_with_session("s1").await;
        let mgr = QueueManager::new(&store);
        let id = mgr.enqueue("s1", Lane::Steer, None, party("x")).await.unwrap();
        mgr.cancel("s1", Lane::Steer, &id).await.unwrap();
        mgr.cancel("s1", Lane::Steer, &id).await.unwrap(); // no error
    }

    #[tokio::test]
    async fn drain_pending_merges_lanes_in_enqueue_order() {
        let store = store_with_session("s1").await;
        let mgr = QueueManager::new(&store);
        mgr.enqueue("s1", Lane::System, Some("sys-1".into()), QueuePayload::System { source: "runner".into(), content: serde_json::json!({}) }).await.unwrap();
        mgr.enqueue("s1", Lane::Steer, Some("steer-1".into()), party("interrupt")).await.unwrap();
        let drained = mgr.drain_pending("s1", &QueueManager::interrupt_lanes()).await.unwrap();
        assert_eq!(drained.len(), 2);
    }

    #[tokio::test]
    async fn mark_materialized_clears_has_work_when_last_item() {
        let store = store_with_session("s1").await;
        let mgr = QueueManager::new(&store);
        let id = mgr.enqueue("s1", Lane::FollowUp, None, party("hi")).await.unwrap();
        mgr.mark_materialized("s1", Lane::FollowUp, &id, 1).await.unwrap();
        assert!(!store.get_session("s1").await.unwrap().has_work);
    }

    #[test]
    fn coalesce_collapses_enqueue_and_materialize_pair() {
        use chrono::Utc;
        use wuhu_store::QueueJournalEntry;

        let entries = vec![
            QueueJournalEntry {
                id: 1,
                session_id: "s1".into(),
                lane: Lane::FollowUp,
                item_id: "a".into(),
                at: Utc::now(),
                action: QueueJournalAction::Enqueued,
            },
            QueueJournalEntry {
                id: 2,
                session_id: "s1".into(),
                lane: Lane::FollowUp,
                item_id: "a".into(),
                at: Utc::now(),
                action: QueueJournalAction::Materialized { transcript_entry_id: 7 },
            },
        ];
        let coalesced = coalesce_journal(&entries);
        assert_eq!(coalesced.len(), 1);
        assert_eq!(
            coalesced[0],
            CoalescedJournalRecord::Materialized { item_id: "a".into(), transcript_entry_id: 7 }
        );
    }

    #[test]
    fn coalesce_entries_drops_redundant_enqueued_row() {
        use chrono::Utc;
        use wuhu_store::QueueJournalEntry;

        let entries = vec![
            QueueJournalEntry { id: 1, session_id: "s1".into(), lane: Lane::FollowUp, item_id: "a".into(), at: Utc::now(), action: QueueJournalAction::Enqueued },
            QueueJournalEntry {
                id: 2,
                session_id: "s1".into(),
                lane: Lane::FollowUp,
                item_id: "a".into(),
                at: Utc::now(),
                action: QueueJournalAction::Materialized { transcript_entry_id: 7 },
            },
        ];
        let collapsed = coalesce_entries(&entries);
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed[0].id, 2);
    }

    #[test]
    fn coalesce_entries_leaves_standalone_terminal_row_untouched() {
        use chrono::Utc;
        use wuhu_store::QueueJournalEntry;

        // The matching Enqueued is outside the window (not in this slice),
        // so the terminal row has nothing to collapse with.
        let entries = vec![QueueJournalEntry {
            id: 5,
            session_id: "s1".into(),
            lane: Lane::Steer,
            item_id: "a".into(),
            at: Utc::now(),
            action: QueueJournalAction::Canceled,
        }];
        let collapsed = coalesce_entries(&entries);
        assert_eq!(collapsed.len(), 1);
        assert_eq!(collapsed[0].id, 5);
    }

    #[test]
    fn coalesce_keeps_separate_enqueue_and_cancel() {
        use chrono::Utc;
        use wuhu_store::QueueJournalEntry;

        let entries = vec![
            QueueJournalEntry {
                id: 1,
                session_id: "s1".into(),
                lane: Lane::Steer,
                item_id: "a".into(),
                at: Utc::now(),
                action: QueueJournalAction::Enqueued,
            },
            QueueJournalEntry {
                id: 2,
                session_id: "s1".into(),
                lane: Lane::Steer,
                item_id: "b".into(),
                at: Utc::now(),
                action: QueueJournalAction::Enqueued,
            },
            QueueJournalEntry {
                id: 3,
                session_id: "s1".into(),
                lane: Lane::Steer,
                item_id: "b".into(),
                at: Utc::now(),
                action: QueueJournalAction::Canceled,
            },
        ];
        let coalesced = coalesce_journal(&entries);
        assert_eq!(coalesced.len(), 2);
        assert_eq!(coalesced[0], CoalescedJournalRecord::Enqueued { item_id: "a".into() });
        assert_eq!(coalesced[1], CoalescedJournalRecord::Canceled { item_id: "b".into() });
    }
}
