// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

// ─── Author ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    Human,
    Bot,
}

/// The originator of a transcript entry: system, a human/bot participant, or
/// unknown (forward-compat fallback). Messages enqueued on user lanes
/// (`steer`/`followUp`) may not carry `System`; that invariant is enforced by
/// `wuhu-queue`, not by this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Author {
    System,
    Participant { id: String, kind: ParticipantKind },
    Unknown,
}

// ─── Entry payloads ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Assistant,
    ToolResult,
    CustomMessage,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolExecutionPhase {
    Start,
    End,
}

/// Tagged union over every kind of record that can appear in a session's
/// transcript. Unknown discriminants decode into `Unknown` (never dropped)
/// so re-encoding is lossless — see the hand-written `Deserialize`/`Serialize`
/// impls below (a plain derive would reject unrecognized `type` tags).
#[derive(Debug, Clone)]
pub enum EntryPayload {
    Header {
        version: u32,
        system_prompt: Option<String>,
        metadata: Json,
    },
    Message {
        kind: MessageKind,
        author: Author,
        content: Json,
        timestamp: DateTime<Utc>,
    },
    ToolExecution {
        phase: ToolExecutionPhase,
        tool_call_id: String,
        tool_name: String,
        arguments: Option<Json>,
        result: Option<Json>,
        is_error: Option<bool>,
    },
    Compaction {
        version: u32,
        summary: String,
        tokens_before: u64,
        first_kept_entry_id: i64,
        metadata: Json,
    },
    SessionSettings {
        provider: String,
        model: String,
        reasoning_effort: Option<String>,
    },
    Custom {
        custom_type: String,
        data: Option<Json>,
    },
    /// Forward-compatible fallback: any discriminant not listed above decodes
    /// here with the raw payload preserved verbatim, so round-tripping an
    /// entry written by a newer process never loses data.
    Unknown {
        r#type: String,
        payload: Json,
    },
}

impl EntryPayload {
    /// A human-readable discriminant, used for the `entry_type` store column
    /// and for status derivation without matching the full enum.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            EntryPayload::Header { .. } => "header",
            EntryPayload::Message { .. } => "message",
            EntryPayload::ToolExecution { .. } => "tool_execution",
            EntryPayload::Compaction { .. } => "compaction",
            EntryPayload::SessionSettings { .. } => "session_settings",
            EntryPayload::Custom { .. } => "custom",
            EntryPayload::Unknown { .. } => "unknown",
        }
    }
}

/// `EntryPayload` uses a hand-rolled `Deserialize` rather than a derive
/// because `#[serde(other)]` on an enum discards the original fields —
/// insufficient for the lossless-round-trip requirement. We deserialize into
/// an untyped envelope first and dispatch on the `type` tag ourselves,
/// falling back to `Unknown` when the tag does not match any known variant.
impl<'de> Deserialize<'de> for EntryPayload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw: Json = Json::deserialize(deserializer)?;
        let tag = raw
            .get("type")
            .and_then(Json::as_str)
            .ok_or_else(|| serde::de::Error::missing_field("type"))?
            .to_string();

        let known = matches!(
            tag.as_str(),
            "header"
                | "message"
                | "tool_execution"
                | "compaction"
                | "session_settings"
                | "custom"
        );

        if known {
            #[derive(Deserialize)]
            #[serde(tag = "type", rename_all = "snake_case")]
            enum Known {
                Header {
                    version: u32,
                    #[serde(default)]
                    system_prompt: Option<String>,
                    #[serde(default)]
                    metadata: Json,
                },
                Message {
                    kind: MessageKind,
                    author: Author,
                    content: Json,
                    timestamp: DateTime<Utc>,
                },
                ToolExecution {
                    phase: ToolExecutionPhase,
                    tool_call_id: String,
                    tool_name: String,
                    #[serde(default)]
                    arguments: Option<Json>,
                    #[serde(default)]
                    result: Option<Json>,
                    #[serde(default)]
                    is_error: Option<bool>,
                },
                Compaction {
                    version: u32,
                    summary: String,
                    tokens_before: u64,
                    first_kept_entry_id: i64,
                    #[serde(default)]
                    metadata: Json,
                },
                SessionSettings {
                    provider: String,
                    model: String,
                    #[serde(default)]
                    reasoning_effort: Option<String>,
                },
                Custom {
                    custom_type: String,
                    #[serde(default)]
                    data: Option<Json>,
                },
            }
            let k: Known = serde_json::from_value(raw).map_err(serde::de::Error::custom)?;
            Ok(match k {
                Known::Header { version, system_prompt, metadata } => {
                    EntryPayload::Header { version, system_prompt, metadata }
                }
                Known::Message { kind, author, content, timestamp } => {
                    EntryPayload::Message { kind, author, content, timestamp }
                }
                Known::ToolExecution { phase, tool_call_id, tool_name, arguments, result, is_error } => {
                    EntryPayload::ToolExecution { phase, tool_call_id, tool_name, arguments, result, is_error }
                }
                Known::Compaction { version, summary, tokens_before, first_kept_entry_id, metadata } => {
                    EntryPayload::Compaction { version, summary, tokens_before, first_kept_entry_id, metadata }
                }
                Known::SessionSettings { provider, model, reasoning_effort } => {
                    EntryPayload::SessionSettings { provider, model, reasoning_effort }
                }
                Known::Custom { custom_type, data } => EntryPayload::Custom { custom_type, data },
            })
        } else {
            Ok(EntryPayload::Unknown { r#type: tag, payload: raw })
        }
    }
}

/// Manual `Serialize` so the `Unknown` variant re-emits its original `type`
/// tag and payload fields flattened, instead of nesting under a `payload` key
/// (which would not round-trip byte-for-byte through a second decode).
impl Serialize for EntryPayload {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        #[serde(tag = "type", rename_all = "snake_case")]
        enum Wire<'a> {
            Header {
                version: u32,
                #[serde(skip_serializing_if = "Option::is_none")]
                system_prompt: &'a Option<String>,
                #[serde(skip_serializing_if = "Json::is_null")]
                metadata: &'a Json,
            },
            Message {
                kind: MessageKind,
                author: &'a Author,
                content: &'a Json,
                timestamp: DateTime<Utc>,
            },
            ToolExecution {
                phase: ToolExecutionPhase,
                tool_call_id: &'a str,
                tool_name: &'a str,
                #[serde(skip_serializing_if = "Option::is_none")]
                arguments: &'a Option<Json>,
                #[serde(skip_serializing_if = "Option::is_none")]
                result: &'a Option<Json>,
                #[serde(skip_serializing_if = "Option::is_none")]
                is_error: &'a Option<bool>,
            },
            Compaction {
                version: u32,
                summary: &'a str,
                tokens_before: u64,
                first_kept_entry_id: i64,
                #[serde(skip_serializing_if = "Json::is_null")]
                metadata: &'a Json,
            },
            SessionSettings {
                provider: &'a str,
                model: &'a str,
                #[serde(skip_serializing_if = "Option::is_none")]
                reasoning_effort: &'a Option<String>,
            },
            Custom {
                custom_type: &'a str,
                #[serde(skip_serializing_if = "Option::is_none")]
                data: &'a Option<Json>,
            },
        }

        match self {
            EntryPayload::Header { version, system_prompt, metadata } => Wire::Header {
                version: *version,
                system_prompt,
                metadata,
            }
            .serialize(serializer),
            EntryPayload::Message { kind, author, content, timestamp } => Wire::Message {
                kind: *kind,
                author,
                content,
                timestamp: *timestamp,
            }
            .serialize(serializer),
            EntryPayload::ToolExecution { phase, tool_call_id, tool_name, arguments, result, is_error } => {
                Wire::ToolExecution {
                    phase: *phase,
                    tool_call_id,
                    tool_name,
                    arguments,
                    result,
                    is_error,
                }
                .serialize(serializer)
            }
            EntryPayload::Compaction { version, summary, tokens_before, first_kept_entry_id, metadata } => {
                Wire::Compaction {
                    version: *version,
                    summary,
                    tokens_before: *tokens_before,
                    first_kept_entry_id: *first_kept_entry_id,
                    metadata,
                }
                .serialize(serializer)
            }
            EntryPayload::SessionSettings { provider, model, reasoning_effort } => {
                Wire::SessionSettings { provider, model, reasoning_effort }.serialize(serializer)
            }
            EntryPayload::Custom { custom_type, data } => {
                Wire::Custom { custom_type, data }.serialize(serializer)
            }
            EntryPayload::Unknown { r#type, payload } => {
                // Re-emit the original object exactly, with `type` restored.
                let mut obj = payload.clone();
                if let Json::Object(ref mut map) = obj {
                    map.insert("type".to_string(), Json::String(r#type.clone()));
                }
                obj.serialize(serializer)
            }
        }
    }
}

// ─── Transcript entry & session ──────────────────────────────────────────────

/// An immutable record in a session's linear chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: i64,
    pub session_id: String,
    pub parent_entry_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub payload: EntryPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    Local,
    Template,
    Sandbox,
}

/// Environment snapshot captured immutably at session creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub name: String,
    pub kind: EnvironmentKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_script: Option<String>,
}

/// Canonical environment definition, referenced by id or unique name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub id: String,
    pub name: String,
    pub kind: EnvironmentKind,
    pub path: String,
    pub template_path: Option<String>,
    pub startup_script: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub provider: String,
    pub model: String,
    pub reasoning_effort: Option<String>,
    pub parent_session_id: Option<String>,
    pub working_dir: String,
    pub environment: EnvironmentSnapshot,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub head_entry_id: i64,
    pub tail_entry_id: i64,
    /// Persisted `has_work` flag, flipped atomically with queue/entry
    /// mutations by `setRunning` (see `spec.md` §4.1).
    pub has_work: bool,
}

/// Parameters for `Store::create_session`.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub provider: String,
    pub model: String,
    pub reasoning_effort: Option<String>,
    pub parent_session_id: Option<String>,
    pub working_dir: String,
    pub environment: EnvironmentSnapshot,
    pub system_prompt: Option<String>,
}

// ─── Queues ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Machine-sourced, not cancelable.
    System,
    /// Party-sourced, cancelable, drained at interrupt checkpoints.
    Steer,
    /// Party-sourced, cancelable, drained at turn boundaries.
    FollowUp,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::System => "system",
            Lane::Steer => "steer",
            Lane::FollowUp => "follow_up",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Lane::System),
            "steer" => Some(Lane::Steer),
            "follow_up" => Some(Lane::FollowUp),
            _ => None,
        }
    }

    pub fn is_cancelable(&self) -> bool {
        !matches!(self, Lane::System)
    }
}

/// The decided-open-question pin: the `system` lane carries only a `source`
/// tag plus content, never an `Author`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuePayload {
    System { source: String, content: Json },
    Party { author: Author, content: Json },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedItem {
    pub id: String,
    pub lane: Lane,
    pub enqueued_at: DateTime<Utc>,
    pub payload: QueuePayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemState {
    Pending,
    Canceled,
    Materialized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum QueueJournalAction {
    Enqueued,
    Canceled,
    Materialized { transcript_entry_id: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJournalEntry {
    pub id: i64,
    pub session_id: String,
    pub lane: Lane,
    pub item_id: String,
    pub at: DateTime<Utc>,
    pub action: QueueJournalAction,
}
