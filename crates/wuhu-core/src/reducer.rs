// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The session actor's persist-first rule in code: every mutation is written
//! to the store first, turned into a [`CommittedAction`], then folded into
//! in-memory [`SessionState`] by [`SessionState::apply`] — a pure function
//! with no I/O. Reloading a session and replaying its full history through
//! `apply` must produce byte-for-byte the same `SessionState` a live actor
//! would have accumulated; that equivalence is the crash-recovery guarantee.

use wuhu_store::{EntryPayload, Lane, MessageKind, QueueJournalAction, QueueJournalEntry, TranscriptEntry};
use wuhu_wire::subscribe::{RegisterStatus, SessionStatus, VersionVector};

/// A single committed change to a session, already durable by the time this
/// value exists. Distinct from `wuhu_wire::subscribe::Event`: this is the
/// actor's internal representation, translated to the wire event only when
/// handed to a subscriber.
#[derive(Debug, Clone)]
pub enum CommittedAction {
    EntryAppended(TranscriptEntry),
    QueueJournal(QueueJournalEntry),
    SettingsUpdated { provider: String, model: String, reasoning_effort: Option<String> },
    StatusChanged(SessionStatus),
}

/// In-memory projection of a session, rebuilt by folding every
/// [`CommittedAction`] the session has ever produced through [`SessionState::apply`].
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub provider: String,
    pub model: String,
    pub reasoning_effort: Option<String>,
    pub status: SessionStatus,
    pub transcript_cursor: Option<i64>,
    pub system_lane_cursor: Option<i64>,
    pub steer_lane_cursor: Option<i64>,
    pub follow_up_lane_cursor: Option<i64>,
}

impl SessionState {
    pub fn new(session: &wuhu_store::Session) -> Self {
        Self {
            session_id: session.id.clone(),
            provider: session.provider.clone(),
            model: session.model.clone(),
            reasoning_effort: session.reasoning_effort.clone(),
            status: SessionStatus::Idle,
            transcript_cursor: None,
            system_lane_cursor: None,
            steer_lane_cursor: None,
            follow_up_lane_cursor: None,
        }
    }

    pub fn version(&self) -> VersionVector {
        VersionVector {
            transcript_cursor: self.transcript_cursor,
            system_lane_cursor: self.system_lane_cursor,
            steer_lane_cursor: self.steer_lane_cursor,
            follow_up_lane_cursor: self.follow_up_lane_cursor,
        }
    }

    /// Fold one committed action into state. Never fails, never performs I/O
    /// — every input has already been validated and persisted by the caller.
    pub fn apply(&mut self, action: &CommittedAction) {
        match action {
            CommittedAction::EntryAppended(entry) => {
                self.transcript_cursor = Some(entry.id);
            }
            CommittedAction::QueueJournal(entry) => {
                let cursor = match entry.lane {
                    Lane::System => &mut self.system_lane_cursor,
                    Lane::Steer => &mut self.steer_lane_cursor,
                    Lane::FollowUp => &mut self.follow_up_lane_cursor,
                };
                *cursor = Some(entry.id);
                // Materializing an item does not itself move the transcript
                // cursor here — the matching EntryAppended action for the
                // same turn carries that update, kept as a separate action
                // because the store appends the entry and the journal row in
                // two calls even though they are part of one logical step.
                let _ = matches!(entry.action, QueueJournalAction::Materialized { .. });
            }
            CommittedAction::SettingsUpdated { provider, model, reasoning_effort } => {
                self.provider = provider.clone();
                self.model = model.clone();
                self.reasoning_effort = reasoning_effort.clone();
            }
            CommittedAction::StatusChanged(status) => {
                self.status = *status;
            }
        }
    }

    pub fn apply_all<'a>(&mut self, actions: impl IntoIterator<Item = &'a CommittedAction>) {
        for a in actions {
            self.apply(a);
        }
    }
}

/// Rebuilds a [`SessionState`] from scratch by replaying every transcript
/// entry and queue-journal row a session has ever produced. Used both by
/// crash recovery (actor startup) and by the reload-equivalence test below.
pub async fn reload(store: &wuhu_store::Store, session_id: &str) -> wuhu_store::Result<SessionState> {
    let session = store.get_session(session_id).await?;
    let mut state = SessionState::new(&session);

    let entries = store.get_entries(session_id, None, None).await?;
    for entry in &entries {
        if let wuhu_store::EntryPayload::SessionSettings { provider, model, reasoning_effort } = &entry.payload {
            state.apply(&CommittedAction::SettingsUpdated {
                provider: provider.clone(),
                model: model.clone(),
                reasoning_effort: reasoning_effort.clone(),
            });
        }
        state.apply(&CommittedAction::EntryAppended(entry.clone()));
    }

    let journal = store.queue_journal_since(session_id, None).await?;
    for entry in journal {
        state.apply(&CommittedAction::QueueJournal(entry));
    }

    state.status = if session.has_work { SessionStatus::Preparing } else { SessionStatus::Idle };
    Ok(state)
}

/// Derives the spec's `Idle | Running | Stopped` register straight from the
/// transcript (spec §3, §4.2). Unlike [`SessionState::status`], which is
/// mutable state folded forward by `apply`, this is a pure read — call it
/// fresh every time the register is needed, never cache it.
pub fn derive_status(entries: &[TranscriptEntry]) -> RegisterStatus {
    if let Some(stop_idx) = entries.iter().rposition(is_execution_stopped_marker) {
        let user_spoke_since = entries[stop_idx + 1..].iter().any(is_user_message);
        if !user_spoke_since {
            return RegisterStatus::Stopped;
        }
    }

    if !crate::loop_::unterminated_tool_starts(entries).is_empty() {
        return RegisterStatus::Running;
    }

    if let Some(last_user_idx) = entries.iter().rposition(is_user_message) {
        let answered = entries[last_user_idx + 1..].iter().any(is_assistant_message);
        if !answered {
            return RegisterStatus::Running;
        }
    }

    RegisterStatus::Idle
}

fn is_execution_stopped_marker(entry: &TranscriptEntry) -> bool {
    matches!(&entry.payload, EntryPayload::Custom { custom_type, .. } if custom_type == "execution_stopped")
}

fn is_user_message(entry: &TranscriptEntry) -> bool {
    matches!(&entry.payload, EntryPayload::Message { kind: MessageKind::User, .. })
}

fn is_assistant_message(entry: &TranscriptEntry) -> bool {
    matches!(&entry.payload, EntryPayload::Message { kind: MessageKind::Assistant, .. })
}
