// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context compaction for `wuhu-core`'s agentic loop: cut-point selection,
//! summary generation, and stacked-summary projection building.
//!
//! Compaction never mutates the transcript. A `Compaction` entry is appended
//! naming `first_kept_entry_id`; the context sent to the model on every turn
//! is built fresh by stacking `[system_prompt, summary_1..summary_N,
//! entries_from(first_kept_entry_id)]`. Only one compaction round runs per
//! trigger — if the resulting projection still does not fit, callers get
//! [`CompactError::InputDoesNotFit`] rather than compacting again.

use futures::StreamExt;
use thiserror::Error;
use wuhu_model::{CompletionRequest, Message, ModelProvider, ResponseEvent, Role};
use wuhu_store::{EntryPayload, MessageKind, ToolExecutionPhase, TranscriptEntry};

mod truncate;
pub use truncate::smart_truncate;
pub use wuhu_tools::OutputCategory;

const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant for a long-lived conversational coding session. \
     Summarise the conversation history below in a concise, information-dense way. Preserve \
     every technical detail, decision, file name, code snippet, and tool outcome that later \
     turns may depend on. The summary replaces the original history in the model's context, \
     so anything omitted here is permanently unavailable to future turns.";

#[derive(Debug, Error)]
pub enum CompactError {
    #[error("summarization request failed: {0}")]
    SummarizationFailed(String),
    #[error(
        "session does not fit the context window even after compaction: \
         {tokens_after} tokens > {context_limit} limit"
    )]
    InputDoesNotFit { tokens_after: usize, context_limit: usize },
}

pub type Result<T> = std::result::Result<T, CompactError>;

/// Approximate token cost of a single transcript entry, using the same
/// 4-chars-per-token heuristic as `wuhu_model::Message::approx_tokens`.
pub fn entry_tokens(payload: &EntryPayload) -> usize {
    let chars = match payload {
        EntryPayload::Header { system_prompt, metadata, .. } => {
            system_prompt.as_deref().map(str::len).unwrap_or(0) + metadata.to_string().len()
        }
        EntryPayload::Message { content, .. } => content.to_string().len(),
        EntryPayload::ToolExecution { arguments, result, .. } => {
            arguments.as_ref().map(|v| v.to_string().len()).unwrap_or(0)
                + result.as_ref().map(|v| v.to_string().len()).unwrap_or(0)
        }
        EntryPayload::Compaction { summary, .. } => summary.len(),
        EntryPayload::SessionSettings { provider, model, .. } => provider.len() + model.len(),
        EntryPayload::Custom { data, .. } => data.as_ref().map(|v| v.to_string().len()).unwrap_or(0),
        EntryPayload::Unknown { payload, .. } => payload.to_string().len(),
    };
    (chars / 4).max(1)
}

/// `(cached_input + input + output + compaction_buffer) > context_limit`.
pub fn needs_compaction(
    cached_input_tokens: usize,
    input_tokens: usize,
    output_tokens: usize,
    compaction_buffer: usize,
    context_limit: usize,
) -> bool {
    cached_input_tokens + input_tokens + output_tokens + compaction_buffer > context_limit
}

/// A cut-point candidate is valid only at a plain user or assistant message —
/// never inside a tool-call/tool-result pair, which would otherwise be split
/// across the kept/discarded boundary.
pub fn is_valid_cut_boundary(entry: &TranscriptEntry) -> bool {
    matches!(
        &entry.payload,
        EntryPayload::Message { kind: MessageKind::User | MessageKind::Assistant, .. }
    )
}

/// Walk backwards from the newest entry, accumulating [`entry_tokens`] until
/// at least `keep_recent_tokens` worth of history has been seen, then return
/// the index of the nearest valid boundary at or before that point.
///
/// Returns `None` for an empty transcript, or `Some(0)` if fewer than
/// `keep_recent_tokens` exist in the whole session (nothing to cut).
pub fn select_cut_point(entries: &[TranscriptEntry], keep_recent_tokens: usize) -> Option<usize> {
    if entries.is_empty() {
        return None;
    }
    let mut acc = 0usize;
    let mut candidate = None;
    for idx in (0..entries.len()).rev() {
        acc += entry_tokens(&entries[idx].payload);
        if is_valid_cut_boundary(&entries[idx]) {
            candidate = Some(idx);
            if acc >= keep_recent_tokens {
                return candidate;
            }
        }
    }
    candidate
}

/// Request a summary of `to_summarize` from `provider` using a dedicated
/// one-shot summarizer request — never the live conversation's running
/// system prompt — so the compaction call itself cannot blow the budget it
/// is trying to relieve.
pub async fn summarize(provider: &dyn ModelProvider, to_summarize: &[Message]) -> Result<String> {
    let history_text = render_history(to_summarize);
    let req = CompletionRequest {
        messages: vec![Message::user(format!("{SUMMARIZE_PROMPT}\n\n---\n\n{history_text}"))],
        tools: vec![],
        stream: true,
        system_dynamic_suffix: None,
    };
    let mut stream = provider
        .complete(req)
        .await
        .map_err(|e| CompactError::SummarizationFailed(e.to_string()))?;

    let mut summary = String::new();
    while let Some(event) = stream.next().await {
        match event.map_err(|e| CompactError::SummarizationFailed(e.to_string()))? {
            ResponseEvent::TextDelta(t) => summary.push_str(&t),
            ResponseEvent::Error(e) => return Err(CompactError::SummarizationFailed(e)),
            ResponseEvent::Done => break,
            _ => {}
        }
    }
    if summary.trim().is_empty() {
        return Err(CompactError::SummarizationFailed("summarizer returned no text".into()));
    }
    Ok(summary)
}

/// Assemble the stacked context sent to the model: the live system prompt,
/// every prior compaction summary in chronological order, then the verbatim
/// kept messages.
pub fn stack_projection(
    system_prompt: Option<&str>,
    summaries: &[String],
    kept: Vec<Message>,
) -> Vec<Message> {
    let mut out = Vec::with_capacity(1 + summaries.len() + kept.len());
    if let Some(sp) = system_prompt {
        out.push(Message::system(sp));
    }
    for s in summaries {
        out.push(Message::assistant(format!("[Earlier context summary]\n{s}")));
    }
    out.extend(kept);
    out
}

/// After stacking a freshly produced summary onto the projection, verify it
/// actually fits. Compaction runs once per trigger; a projection that still
/// overflows is a hard failure, not a cue to compact again.
pub fn assert_fits(projected_tokens: usize, context_limit: usize) -> Result<()> {
    if projected_tokens > context_limit {
        return Err(CompactError::InputDoesNotFit { tokens_after: projected_tokens, context_limit });
    }
    Ok(())
}

/// Render a message slice to plain text for inclusion in a compaction
/// prompt. Tool-execution pairs render as bracketed markers so the
/// summarizer can still reason about what happened without replaying the
/// raw JSON arguments/results.
fn render_history(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| !matches!(m.role, Role::System))
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
                Role::System => "System",
            };
            let text = m.as_text().map(str::to_string).unwrap_or_else(|| match &m.content {
                wuhu_model::MessageContent::ToolCall { function, .. } => {
                    format!("[tool_call: {}({})]", function.name, function.arguments)
                }
                wuhu_model::MessageContent::ToolResult { content, .. } => {
                    format!("[tool_result: {content}]")
                }
                wuhu_model::MessageContent::ContentParts(parts) => parts
                    .iter()
                    .map(|p| match p {
                        wuhu_model::ContentPart::Text { text } => text.clone(),
                        wuhu_model::ContentPart::Image { .. } => "[image]".to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
                wuhu_model::MessageContent::Text(t) => t.clone(),
            });
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Whether a `Started`-without-`End` tool call recorded in `entry` belongs to
/// the idle-recovery path: used by `wuhu-core` to recognise crash remnants
/// while walking the transcript, re-exported here because the compaction
/// cut-point walk needs the same `ToolExecution` phase matching.
pub fn is_unterminated_tool_start(entry: &EntryPayload, later: &[TranscriptEntry]) -> bool {
    let EntryPayload::ToolExecution { phase: ToolExecutionPhase::Start, tool_call_id, .. } = entry else {
        return false;
    };
    !later.iter().any(|e| {
        matches!(
            &e.payload,
            EntryPayload::ToolExecution { phase: ToolExecutionPhase::End, tool_call_id: id, .. }
            if id == tool_call_id
        )
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use wuhu_model::ScriptedMockProvider;
    use wuhu_store::Author;

    use super::*;

    fn msg_entry(id: i64, kind: MessageKind, text: &str) -> TranscriptEntry {
        TranscriptEntry {
            id,
            session_id: "s1".into(),
            parent_entry_id: Some(id - 1),
            created_at: Utc::now(),
            payload: EntryPayload::Message {
                kind,
                author: Author::Participant { id: "alice".into(), kind: wuhu_store::ParticipantKind::Human },
                content: serde_json::json!(text),
                timestamp: Utc::now(),
            },
        }
    }

    fn tool_entry(id: i64, phase: ToolExecutionPhase, call_id: &str) -> TranscriptEntry {
        TranscriptEntry {
            id,
            session_id: "s1".into(),
            parent_entry_id: Some(id - 1),
            created_at: Utc::now(),
            payload: EntryPayload::ToolExecution {
                phase,
                tool_call_id: call_id.into(),
                tool_name: "read_file".into(),
                arguments: Some(serde_json::json!({"path": "a.rs"})),
                result: Some(serde_json::json!("contents")),
                is_error: Some(false),
            },
        }
    }

    #[test]
    fn needs_compaction_trigger_matches_sum_formula() {
        assert!(needs_compaction(1000, 2000, 500, 100, 3000));
        assert!(!needs_compaction(1000, 1000, 500, 100, 3000));
    }

    #[test]
    fn tool_execution_entries_are_never_valid_boundaries() {
        let e = tool_entry(2, ToolExecutionPhase::Start, "c1");
        assert!(!is_valid_cut_boundary(&e));
    }

    #[test]
    fn user_and_assistant_messages_are_valid_boundaries() {
        assert!(is_valid_cut_boundary(&msg_entry(1, MessageKind::User, "hi")));
        assert!(is_valid_cut_boundary(&msg_entry(1, MessageKind::Assistant, "hi")));
    }

    #[test]
    fn tool_result_messages_are_not_valid_boundaries() {
        assert!(!is_valid_cut_boundary(&msg_entry(1, MessageKind::ToolResult, "result")));
    }

    #[test]
    fn select_cut_point_skips_over_tool_pairs_to_land_on_a_message() {
        let entries = vec![
            msg_entry(1, MessageKind::User, &"x".repeat(400)),
            msg_entry(2, MessageKind::Assistant, "calling a tool"),
            tool_entry(3, ToolExecutionPhase::Start, "c1"),
            msg_entry(4, MessageKind::ToolResult, "contents"),
            tool_entry(5, ToolExecutionPhase::End, "c1"),
            msg_entry(6, MessageKind::Assistant, "done"),
        ];
        // keep_recent_tokens small enough that entry 6 alone already satisfies it.
        let cut = select_cut_point(&entries, 1).unwrap();
        assert_eq!(entries[cut].id, 6);
    }

    #[test]
    fn select_cut_point_walks_past_invalid_boundaries_when_budget_not_met() {
        let entries = vec![
            msg_entry(1, MessageKind::User, "short"),
            tool_entry(2, ToolExecutionPhase::Start, "c1"),
            msg_entry(3, MessageKind::ToolResult, "contents"),
            tool_entry(4, ToolExecutionPhase::End, "c1"),
        ];
        // keep_recent_tokens is huge, so the walk exhausts every entry and
        // must fall back to the only valid boundary seen: entry 1.
        let cut = select_cut_point(&entries, 1_000_000).unwrap();
        assert_eq!(entries[cut].id, 1);
    }

    #[test]
    fn select_cut_point_on_empty_transcript_is_none() {
        assert_eq!(select_cut_point(&[], 10), None);
    }

    #[test]
    fn stack_projection_orders_system_then_summaries_then_kept() {
        let kept = vec![Message::user("hello")];
        let summaries = vec!["earlier summary".to_string()];
        let out = stack_projection(Some("you are helpful"), &summaries, kept);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].role, Role::System);
        assert!(out[1].as_text().unwrap().contains("earlier summary"));
        assert_eq!(out[2].as_text(), Some("hello"));
    }

    #[test]
    fn assert_fits_rejects_oversized_projection() {
        let err = assert_fits(5000, 4000).unwrap_err();
        assert!(matches!(err, CompactError::InputDoesNotFit { .. }));
    }

    #[test]
    fn assert_fits_accepts_projection_within_budget() {
        assert!(assert_fits(3000, 4000).is_ok());
    }

    #[tokio::test]
    async fn summarize_collects_text_deltas_until_done() {
        let provider = ScriptedMockProvider::always_text("concise summary of the session");
        let history = vec![Message::user("please fix the bug"), Message::assistant("fixed it")];
        let summary = summarize(&provider, &history).await.unwrap();
        assert_eq!(summary, "concise summary of the session");
    }

    #[tokio::test]
    async fn summarize_errors_when_stream_reports_error() {
        let provider = ScriptedMockProvider::new(vec![vec![ResponseEvent::Error("boom".into())]]);
        let err = summarize(&provider, &[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, CompactError::SummarizationFailed(msg) if msg == "boom"));
    }

    #[test]
    fn unterminated_tool_start_detected_when_no_matching_end_follows() {
        let start = EntryPayload::ToolExecution {
            phase: ToolExecutionPhase::Start,
            tool_call_id: "c1".into(),
            tool_name: "shell".into(),
            arguments: None,
            result: None,
            is_error: None,
        };
        assert!(is_unterminated_tool_start(&start, &[]));
    }

    #[test]
    fn terminated_tool_start_not_flagged_once_end_is_present() {
        let start = EntryPayload::ToolExecution {
            phase: ToolExecutionPhase::Start,
            tool_call_id: "c1".into(),
            tool_name: "shell".into(),
            arguments: None,
            result: None,
            is_error: None,
        };
        let later = vec![tool_entry(2, ToolExecutionPhase::End, "c1")];
        assert!(!is_unterminated_tool_start(&start, &later));
    }
}
