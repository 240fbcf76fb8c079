// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Subscription-protocol types for observers watching a session live:
//! a single combined [`Event`] enum carries every committing transcript/queue
//! change plus the non-committing streaming deltas, so a subscriber only
//! ever opens one channel per session.
//!
//! Gap-free delivery is a property of how the core registers and drains a
//! subscriber (buffer first, then snapshot the store, then replay buffered
//! events past the snapshot) — these types only carry the data, not that
//! protocol; see `wuhu-core`'s subscription engine.

use serde::{Deserialize, Serialize};
use wuhu_store::{QueueJournalEntry, TranscriptEntry};

/// Coarse lifecycle state of the agentic loop, broadcast on every
/// transition so observers can render status without replaying transcript
/// entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Preparing,
    Inferring,
    ExecutingTools,
    PostCheck,
    Compacting,
}

/// The spec's externally-facing status register: `Idle | Running | Stopped`,
/// recomputed from the transcript on every read rather than stored as
/// mutable state. Distinct from [`SessionStatus`], which is the agentic
/// loop's own internal phase and is broadcast as an implementation detail;
/// this is the value a client actually needs to know whether a turn is
/// still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterStatus {
    Idle,
    Running,
    Stopped,
}

/// Per-lane cursor a subscriber has already observed. `None` means "nothing
/// from this lane/transcript has been seen yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    pub transcript_cursor: Option<i64>,
    pub system_lane_cursor: Option<i64>,
    pub steer_lane_cursor: Option<i64>,
    pub follow_up_lane_cursor: Option<i64>,
}

/// Everything a subscriber needs to reach an up-to-date view in one shot:
/// backfill since a prior [`VersionVector`], plus the vector to pass on the
/// next reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StablePatch {
    pub version: VersionVector,
    pub transcript: Vec<TranscriptEntry>,
    pub system_journal: Vec<QueueJournalEntry>,
    pub steer_journal: Vec<QueueJournalEntry>,
    pub follow_up_journal: Vec<QueueJournalEntry>,
    pub status: SessionStatus,
    /// The spec's `Idle | Running | Stopped` register, derived fresh at
    /// snapshot time — see [`RegisterStatus`].
    pub register_status: RegisterStatus,
}

/// Observable state of a subscriber's connection to the core, pushed on a
/// side channel alongside `Event` so a UI can distinguish "no new events"
/// from "actually disconnected".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Retrying { attempt: u32, delay_seconds: u64 },
    Closed,
}

/// A single event on a session's subscription stream. Committing variants
/// (`TranscriptAppended`, the three `*QueueJournal` variants, `SettingsUpdated`,
/// `StatusUpdated`) mirror a durable write and advance the corresponding
/// [`VersionVector`] cursor. Streaming variants (`StreamBegan`/`StreamDelta`/
/// `StreamEnded`) are never persisted and carry no cursor — a reconnecting
/// subscriber only ever needs `InflightSnapshot` to catch up on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TranscriptAppended { entry: TranscriptEntry },
    SystemQueueJournal { entry: QueueJournalEntry },
    SteerQueueJournal { entry: QueueJournalEntry },
    FollowUpQueueJournal { entry: QueueJournalEntry },
    SettingsUpdated {
        provider: String,
        model: String,
        reasoning_effort: Option<String>,
    },
    StatusUpdated { status: SessionStatus },

    /// A new streaming turn started; `stream_id` groups subsequent deltas.
    StreamBegan { stream_id: String, role: String },
    /// A streaming text/thinking delta. Never persisted — the committed
    /// `TranscriptAppended` for the finished message is the durable record.
    StreamDelta { stream_id: String, delta: String },
    /// The stream finished (normally or via cancellation).
    StreamEnded { stream_id: String },

    /// Sent once, immediately after a subscriber's initial `StablePatch`, so
    /// a client that connects mid-turn sees the in-progress stream without
    /// waiting for the next delta.
    InflightSnapshot {
        stream_id: Option<String>,
        accumulated_text: String,
        status: SessionStatus,
    },
}

impl Event {
    /// Whether this event advances a durable cursor in [`VersionVector`] —
    /// `false` for the ephemeral streaming/inflight variants.
    pub fn is_committing(&self) -> bool {
        !matches!(
            self,
            Event::StreamBegan { .. }
                | Event::StreamDelta { .. }
                | Event::StreamEnded { .. }
                | Event::InflightSnapshot { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_cbor, decode_json, encode_cbor, encode_json};
    use chrono::Utc;
    use wuhu_store::{Author, EntryPayload, MessageKind, ParticipantKind};

    fn sample_entry() -> TranscriptEntry {
        TranscriptEntry {
            id: 1,
            session_id: "s1".into(),
            parent_entry_id: None,
            created_at: Utc::now(),
            payload: EntryPayload::Message {
                kind: MessageKind::User,
                author: Author::Participant { id: "alice".into(), kind: ParticipantKind::Human },
                content: serde_json::json!("hi"),
                timestamp: Utc::now(),
            },
        }
    }

    #[test]
    fn transcript_appended_cbor_round_trip() {
        let ev = Event::TranscriptAppended { entry: sample_entry() };
        let bytes = encode_cbor(&ev).unwrap();
        let back: Event = decode_cbor(&bytes).unwrap();
        assert!(matches!(back, Event::TranscriptAppended { .. }));
    }

    #[test]
    fn stream_delta_json_round_trip() {
        let ev = Event::StreamDelta { stream_id: "t1".into(), delta: "chunk".into() };
        let text = encode_json(&ev).unwrap();
        let back: Event = decode_json(&text).unwrap();
        match back {
            Event::StreamDelta { stream_id, delta } => {
                assert_eq!(stream_id, "t1");
                assert_eq!(delta, "chunk");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn streaming_variants_are_not_committing() {
        assert!(!Event::StreamBegan { stream_id: "t1".into(), role: "assistant".into() }.is_committing());
        assert!(!Event::StreamDelta { stream_id: "t1".into(), delta: "x".into() }.is_committing());
        assert!(!Event::StreamEnded { stream_id: "t1".into() }.is_committing());
        assert!(!Event::InflightSnapshot {
            stream_id: None,
            accumulated_text: String::new(),
            status: SessionStatus::Inferring
        }
        .is_committing());
    }

    #[test]
    fn durable_variants_are_committing() {
        assert!(Event::TranscriptAppended { entry: sample_entry() }.is_committing());
        assert!(Event::StatusUpdated { status: SessionStatus::Idle }.is_committing());
    }

    #[test]
    fn version_vector_defaults_to_all_none() {
        let v = VersionVector::default();
        assert!(v.transcript_cursor.is_none());
        assert!(v.system_lane_cursor.is_none());
        assert!(v.steer_lane_cursor.is_none());
        assert!(v.follow_up_lane_cursor.is_none());
    }

    #[test]
    fn connection_state_retrying_serializes_with_fields() {
        let s = ConnectionState::Retrying { attempt: 2, delay_seconds: 4 };
        let text = encode_json(&s).unwrap();
        assert!(text.contains("\"attempt\":2"));
        let back: ConnectionState = decode_json(&text).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn session_status_serializes_snake_case() {
        let text = encode_json(&SessionStatus::ExecutingTools).unwrap();
        assert_eq!(text, "\"executing_tools\"");
    }

    #[test]
    fn register_status_serializes_snake_case() {
        let text = encode_json(&RegisterStatus::Stopped).unwrap();
        assert_eq!(text, "\"stopped\"");
    }
}
