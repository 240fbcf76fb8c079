// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agentic loop: the state machine that turns queued input into
//! transcript entries by repeatedly preparing a turn, draining input lanes,
//! calling the model, dispatching tool calls, and checking whether another
//! turn is needed. Crash recovery reuses the same drain/dispatch code paths
//! as normal operation — a restarted process walks the transcript for
//! unterminated tool calls before resuming the loop, rather than running a
//! separate recovery procedure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value as Json;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use wuhu_compact::{entry_tokens, needs_compaction, select_cut_point, smart_truncate, stack_projection, summarize};
use wuhu_config::{CompactionConfig, LoopConfig};
use wuhu_model::{CompletionRequest, Message, ModelProvider, ResponseEvent};
use wuhu_queue::QueueManager;
use wuhu_store::{Author, EntryPayload, MessageKind, ParticipantKind, QueuePayload, Store, ToolExecutionPhase, TranscriptEntry};
use wuhu_tools::{ToolCall as DispatchedToolCall, ToolRegistry};
use wuhu_wire::subscribe::{Event, SessionStatus};

use crate::error::{LoopError, Result};
use crate::reducer::{CommittedAction, SessionState};

/// Shared snapshot of the current in-flight assistant stream, read by the
/// subscription engine to satisfy spec §4.6's `inflightSnapshot` event for a
/// subscriber that connects mid-turn. A plain `std::sync::Mutex` is enough:
/// critical sections are a clone/replace, never held across an `.await`.
pub type InflightTracker = Arc<std::sync::Mutex<Option<(String, String)>>>;

/// Everything one turn cycle of the loop needs. Borrowed for the duration of
/// a single `run` call; the actor owns all of these and constructs a fresh
/// `LoopContext` each time it starts a run.
///
/// `state` is a shared, independently-locked handle rather than `&mut
/// SessionState`: a turn spans many suspension points (model inference,
/// tool I/O), and no lock may be held across one of those (spec §5, §9).
/// Every mutation instead takes the lock just long enough to fold one
/// `CommittedAction` into state — see `commit` — so a command on the same
/// session (`stop`, `set_model`, `subscribe`) never waits for a whole turn,
/// only for the current fold.
pub struct LoopContext<'a> {
    pub session_id: &'a str,
    pub store: &'a Store,
    pub tools: &'a ToolRegistry,
    pub provider: Arc<dyn ModelProvider>,
    pub compaction: &'a CompactionConfig,
    pub retry: &'a LoopConfig,
    pub system_prompt: Option<&'a str>,
    pub cancel: Arc<AtomicBool>,
    pub events: &'a broadcast::Sender<Event>,
    pub state: Arc<Mutex<SessionState>>,
    pub inflight: &'a InflightTracker,
}

impl LoopContext<'_> {
    async fn commit(&mut self, action: CommittedAction) {
        self.state.lock().await.apply(&action);
        let event = to_wire_event(&action);
        let _ = self.events.send(event);
    }

    async fn set_status(&mut self, status: SessionStatus) {
        self.commit(CommittedAction::StatusChanged(status)).await;
    }

    fn interrupted(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

/// Translates an already-persisted [`CommittedAction`] into the wire event
/// broadcast to subscribers. Shared with the session actor, which commits
/// actions of its own (settings changes, the stop marker) outside a loop
/// turn.
pub(crate) fn to_wire_event(action: &CommittedAction) -> Event {
    match action {
        CommittedAction::EntryAppended(entry) => Event::TranscriptAppended { entry: entry.clone() },
        CommittedAction::QueueJournal(entry) => match entry.lane {
            wuhu_store::Lane::System => Event::SystemQueueJournal { entry: entry.clone() },
            wuhu_store::Lane::Steer => Event::SteerQueueJournal { entry: entry.clone() },
            wuhu_store::Lane::FollowUp => Event::FollowUpQueueJournal { entry: entry.clone() },
        },
        CommittedAction::SettingsUpdated { provider, model, reasoning_effort } => Event::SettingsUpdated {
            provider: provider.clone(),
            model: model.clone(),
            reasoning_effort: reasoning_effort.clone(),
        },
        CommittedAction::StatusChanged(s) => Event::StatusUpdated { status: *s },
    }
}

/// Runs the agentic loop until the session returns to `Idle` (no pending
/// lane input remains) or a [`LoopError`] aborts the turn. The caller (the
/// session actor) is responsible for flipping `has_work` back to `false`
/// and for deciding whether to surface an error to subscribers or retry on
/// the next enqueue.
pub async fn run(mut ctx: LoopContext<'_>) -> Result<()> {
    recover_from_crash(&mut ctx).await?;

    // Set once PostCheck hands back to Preparing after a tool-executing turn:
    // the model owes the transcript a follow-up response to the tool results
    // it just saw, so this checkpoint must reach Inferring even though no new
    // lane item was drained. Only the turn-boundary and initial-wake entries
    // into Preparing are allowed to idle out on an empty drain.
    let mut owed_followup = false;

    loop {
        if ctx.interrupted() {
            ctx.set_status(SessionStatus::Idle).await;
            return Ok(());
        }

        ctx.set_status(SessionStatus::Preparing).await;

        let interrupt_drained = drain_and_materialize(&mut ctx, &QueueManager::interrupt_lanes()).await?;
        let drained_any = if interrupt_drained {
            true
        } else {
            drain_and_materialize(&mut ctx, &QueueManager::follow_up_lane()).await?
        };

        if !drained_any && !owed_followup {
            if ctx.store.any_pending(ctx.session_id).await? {
                // A lane gained an item between our drain and the has_work
                // check (e.g. a concurrent enqueue) — loop once more rather
                // than going idle on stale information.
                continue;
            }
            ctx.store.set_has_work(ctx.session_id, false).await?;
            ctx.set_status(SessionStatus::Idle).await;
            return Ok(());
        }
        owed_followup = false;

        if ctx.interrupted() {
            ctx.set_status(SessionStatus::Idle).await;
            return Ok(());
        }

        maybe_compact(&mut ctx).await?;

        let turn = run_inference_turn(&mut ctx).await?;

        if !turn.tool_calls.is_empty() {
            ctx.set_status(SessionStatus::ExecutingTools).await;
            dispatch_tools(&mut ctx, &turn.tool_calls).await?;
            ctx.set_status(SessionStatus::PostCheck).await;
            owed_followup = true;
        }
    }
}

// ─── Crash recovery ───────────────────────────────────────────────────────────

/// Walks the transcript once at loop startup looking for `ToolExecution`
/// entries that started but never finished — the signature of a process
/// that crashed mid-dispatch. Idempotent tools are re-executed; everything
/// else gets a synthesized error result so the model sees a definite
/// outcome instead of a silently missing tool turn.
async fn recover_from_crash(ctx: &mut LoopContext<'_>) -> Result<()> {
    let entries = ctx.store.get_entries(ctx.session_id, None, None).await?;
    let unterminated = unterminated_tool_starts(&entries);

    for entry in unterminated {
        let EntryPayload::ToolExecution { tool_call_id, tool_name, arguments, .. } = &entry.payload else {
            continue;
        };
        warn!(session_id = ctx.session_id, tool_call_id, tool_name, "recovering unterminated tool call after crash");

        let (result, is_error) = if ctx.tools.is_idempotent(tool_name) {
            let call = DispatchedToolCall {
                id: tool_call_id.clone(),
                name: tool_name.clone(),
                args: arguments.clone().unwrap_or(Json::Null),
            };
            let out = ctx.tools.execute(&call).await;
            (Json::String(out.content), out.is_error)
        } else {
            (
                Json::String(format!(
                    "tool call interrupted by a process restart and {tool_name} is not \
                     idempotent; not re-executed (recovered_from_crash)"
                )),
                true,
            )
        };

        let result_entry = ctx
            .store
            .append_entry(
                ctx.session_id,
                EntryPayload::Message {
                    kind: MessageKind::ToolResult,
                    author: Author::System,
                    content: result.clone(),
                    timestamp: chrono::Utc::now(),
                },
            )
            .await?;
        ctx.commit(CommittedAction::EntryAppended(result_entry)).await;

        let end = ctx
            .store
            .append_entry(
                ctx.session_id,
                EntryPayload::ToolExecution {
                    phase: ToolExecutionPhase::End,
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    arguments: None,
                    result: Some(result),
                    is_error: Some(is_error),
                },
            )
            .await?;
        ctx.commit(CommittedAction::EntryAppended(end)).await;
    }
    Ok(())
}

/// Transcript entries with a `ToolExecution { Start }` but no matching `End`
/// — the signature of a process that stopped mid-dispatch, whether by crash
/// or an explicit `stop()` command. Shared by [`recover_from_crash`] and the
/// session actor's `stop()` repair path.
pub(crate) fn unterminated_tool_starts(entries: &[TranscriptEntry]) -> Vec<&TranscriptEntry> {
    entries.iter().filter(|e| wuhu_compact::is_unterminated_tool_start(&e.payload, entries)).collect()
}

// ─── Lane draining ────────────────────────────────────────────────────────────

/// Drains every pending item across `lanes`, materializing each as a
/// transcript `Message` entry and recording the journal row. Returns whether
/// anything was drained.
async fn drain_and_materialize(ctx: &mut LoopContext<'_>, lanes: &[wuhu_store::Lane]) -> Result<bool> {
    let queue = QueueManager::new(ctx.store);
    let items = queue.drain_pending(ctx.session_id, lanes).await?;
    if items.is_empty() {
        return Ok(false);
    }

    let existing = ctx.store.get_entries(ctx.session_id, None, None).await?;
    let mut known_participants = known_participant_ids(&existing);

    for item in items {
        let (kind, author, content) = match item.payload {
            QueuePayload::System { source, content } => {
                (MessageKind::CustomMessage, Author::System, serde_json::json!({ "source": source, "body": content }))
            }
            QueuePayload::Party { author, content } => (MessageKind::User, author, content),
        };

        // A group chat escalates the first time a second distinct
        // participant speaks: drop a `participant_joined` marker so the
        // projection knows where to start prefixing user messages with
        // their author's id (spec scenario: alice's opener stays
        // un-prefixed, bob's arrival and everything after it gets prefixed).
        if let Author::Participant { id, .. } = &author {
            if !known_participants.is_empty() && !known_participants.contains(id) {
                let marker = ctx
                    .store
                    .append_entry(
                        ctx.session_id,
                        EntryPayload::Custom {
                            custom_type: "participant_joined".into(),
                            data: Some(serde_json::json!({ "participant_id": id })),
                        },
                    )
                    .await?;
                ctx.commit(CommittedAction::EntryAppended(marker)).await;
            }
            known_participants.insert(id.clone());
        }

        let payload = EntryPayload::Message { kind, author, content, timestamp: item.enqueued_at };
        let entry = ctx.store.append_entry(ctx.session_id, payload).await?;
        ctx.commit(CommittedAction::EntryAppended(entry.clone())).await;

        queue.mark_materialized(ctx.session_id, item.lane, &item.id, entry.id).await?;
        let cursor = ctx.state.lock().await.version().cursor_for(item.lane);
        let journal = ctx.store.queue_journal_since(ctx.session_id, cursor).await?;
        for j in journal {
            ctx.commit(CommittedAction::QueueJournal(j)).await;
        }
    }
    Ok(true)
}

/// Distinct participant ids that have already authored a `User` message in
/// the transcript, used to detect the single-to-group-chat escalation point.
fn known_participant_ids(entries: &[TranscriptEntry]) -> std::collections::HashSet<String> {
    entries
        .iter()
        .filter_map(|e| match &e.payload {
            EntryPayload::Message { kind: MessageKind::User, author: Author::Participant { id, .. }, .. } => Some(id.clone()),
            _ => None,
        })
        .collect()
}

// ─── Compaction ───────────────────────────────────────────────────────────────

async fn maybe_compact(ctx: &mut LoopContext<'_>) -> Result<()> {
    if !ctx.compaction.enabled {
        return Ok(());
    }
    // keep_recent_tokens = 0 asks the cut point to land exactly at the tail —
    // i.e. keep nothing. That degenerates to summarizing the entire
    // transcript on every turn for no benefit, so it is defined as a no-op
    // rather than a pathological compaction (spec §8 boundary behavior).
    if ctx.compaction.keep_recent_tokens == 0 {
        return Ok(());
    }
    let entries = ctx.store.get_entries(ctx.session_id, None, None).await?;
    let used: usize = entries.iter().map(|e| entry_tokens(&e.payload)).sum();
    let limit = ctx.compaction.context_window_tokens.saturating_sub(ctx.compaction.reserve_tokens);
    if !needs_compaction(0, used, 0, ctx.compaction.compaction_buffer, limit) {
        return Ok(());
    }

    ctx.set_status(SessionStatus::Compacting).await;
    info!(session_id = ctx.session_id, used, limit, "compacting session");

    let cut_idx = select_cut_point(&entries, ctx.compaction.keep_recent_tokens)
        .ok_or(LoopError::ContextOverflow(used))?;
    let mut group_chat = false;
    let to_summarize: Vec<Message> = entries[..cut_idx]
        .iter()
        .filter_map(|e| {
            if matches!(&e.payload, EntryPayload::Custom { custom_type, .. } if custom_type == "participant_joined") {
                group_chat = true;
            }
            entry_to_message(e, group_chat)
        })
        .collect();
    let summary = summarize(ctx.provider.as_ref(), &to_summarize).await?;

    let first_kept_entry_id = entries[cut_idx].id;
    let payload = EntryPayload::Compaction {
        version: 1,
        summary,
        tokens_before: used as u64,
        first_kept_entry_id,
        metadata: Json::Null,
    };
    let entry = ctx.store.append_entry(ctx.session_id, payload).await?;
    ctx.commit(CommittedAction::EntryAppended(entry)).await;

    let after: usize = entries[cut_idx..].iter().map(|e| entry_tokens(&e.payload)).sum();
    wuhu_compact::assert_fits(after + ctx.compaction.compaction_buffer, limit)?;
    Ok(())
}

// ─── Inference ────────────────────────────────────────────────────────────────

struct TurnOutcome {
    tool_calls: Vec<PendingToolCall>,
}

#[derive(Debug, Clone)]
struct PendingToolCall {
    id: String,
    name: String,
    args: Json,
}

/// Converts a transcript entry into the message fed to the model, building
/// the `[system, ...summaries, ...kept]` stacked projection's tail. Entries
/// with no model-facing representation (the header, settings changes,
/// compaction markers themselves) return `None`. `group_chat` prefixes a
/// `User` message with its author's id once the transcript has escalated
/// past a `participant_joined` marker (see `drain_and_materialize`).
fn entry_to_message(entry: &TranscriptEntry, group_chat: bool) -> Option<Message> {
    match &entry.payload {
        EntryPayload::Message { kind: MessageKind::Assistant, content, .. } => {
            Some(Message::assistant(content_to_text(content)))
        }
        EntryPayload::Message { kind: MessageKind::User, author: Author::Participant { id, .. }, content, .. } if group_chat => {
            Some(Message::user(format!("{id}:\n\n{}", content_to_text(content))))
        }
        // The tool's outcome is already represented in the projection by the
        // matching `ToolExecution { End }` entry below; this entry exists
        // for the durable transcript and journal (spec §3's `ToolCallStatus`),
        // not to be replayed into context a second time.
        EntryPayload::Message { kind: MessageKind::ToolResult, .. } => None,
        EntryPayload::Message { content, .. } => Some(Message::user(content_to_text(content))),
        EntryPayload::ToolExecution { phase: ToolExecutionPhase::Start, tool_call_id, tool_name, arguments, .. } => {
            Some(Message {
                role: wuhu_model::Role::Assistant,
                content: wuhu_model::MessageContent::ToolCall {
                    tool_call_id: tool_call_id.clone(),
                    function: wuhu_model::FunctionCall {
                        name: tool_name.clone(),
                        arguments: arguments.clone().unwrap_or(Json::Null).to_string(),
                    },
                },
            })
        }
        EntryPayload::ToolExecution { phase: ToolExecutionPhase::End, tool_call_id, result, .. } => {
            Some(Message::tool_result(tool_call_id.clone(), result.as_ref().map(content_to_text).unwrap_or_default()))
        }
        EntryPayload::Header { .. } | EntryPayload::Compaction { .. } | EntryPayload::SessionSettings { .. } => None,
        EntryPayload::Custom { .. } | EntryPayload::Unknown { .. } => None,
    }
}

fn content_to_text(content: &Json) -> String {
    match content {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn build_projection(ctx: &LoopContext<'_>, entries: &[TranscriptEntry]) -> Vec<Message> {
    let summaries: Vec<String> = entries
        .iter()
        .filter_map(|e| match &e.payload {
            EntryPayload::Compaction { summary, .. } => Some(summary.clone()),
            _ => None,
        })
        .collect();
    let last_cut = entries.iter().rev().find_map(|e| match &e.payload {
        EntryPayload::Compaction { first_kept_entry_id, .. } => Some(*first_kept_entry_id),
        _ => None,
    });
    let mut group_chat = false;
    let kept: Vec<Message> = entries
        .iter()
        .filter(|e| last_cut.map(|cut| e.id >= cut).unwrap_or(true))
        .filter_map(|e| {
            if matches!(&e.payload, EntryPayload::Custom { custom_type, .. } if custom_type == "participant_joined") {
                group_chat = true;
            }
            entry_to_message(e, group_chat)
        })
        .collect();
    stack_projection(ctx.system_prompt, &summaries, kept)
}

/// Runs one model turn: builds the projection, calls the provider with
/// retry/backoff, accumulates the streaming response, and persists the
/// resulting assistant message plus any `ToolExecution { Start }` entries
/// for tool calls the model requested.
async fn run_inference_turn(ctx: &mut LoopContext<'_>) -> Result<TurnOutcome> {
    ctx.set_status(SessionStatus::Inferring).await;
    let entries = ctx.store.get_entries(ctx.session_id, None, None).await?;
    let messages = build_projection(ctx, &entries);
    let tools = ctx.tools.schemas();
    let tool_schemas: Vec<wuhu_model::ToolSchema> = tools
        .into_iter()
        .map(|t| wuhu_model::ToolSchema { name: t.name, description: t.description, parameters: t.parameters })
        .collect();

    let req = CompletionRequest { messages, tools: tool_schemas, stream: true, system_dynamic_suffix: None };
    let mut stream = call_with_retry(ctx, req).await?;

    let mut full_text = String::new();
    let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
    let stream_id = uuid::Uuid::new_v4().to_string();
    *ctx.inflight.lock().unwrap() = Some((stream_id.clone(), String::new()));
    let _ = ctx.events.send(Event::StreamBegan { stream_id: stream_id.clone(), role: "assistant".into() });

    while let Some(event) = stream.next().await {
        match event.map_err(|e| LoopError::GiveUp { attempts: 1, reason: e.to_string() })? {
            ResponseEvent::TextDelta(delta) => {
                full_text.push_str(&delta);
                if let Some((_, acc)) = ctx.inflight.lock().unwrap().as_mut() {
                    acc.push_str(&delta);
                }
                let _ = ctx.events.send(Event::StreamDelta { stream_id: stream_id.clone(), delta });
            }
            ResponseEvent::ToolCall { index, id, name, arguments } => {
                let entry = pending.entry(index).or_insert_with(|| PendingToolCall {
                    id: String::new(),
                    name: String::new(),
                    args: Json::Null,
                });
                if !id.is_empty() {
                    entry.id = id;
                }
                if !name.is_empty() {
                    entry.name = name;
                }
                entry.args = merge_arg_fragment(&entry.args, &arguments);
            }
            ResponseEvent::ThinkingDelta(_) => {}
            ResponseEvent::Usage { .. } => {}
            ResponseEvent::Done => break,
            ResponseEvent::Error(e) => {
                warn!(session_id = ctx.session_id, "model stream reported a recoverable error: {e}");
            }
        }
    }
    *ctx.inflight.lock().unwrap() = None;
    let _ = ctx.events.send(Event::StreamEnded { stream_id });

    let mut ordered: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
    ordered.sort_by_key(|(idx, _)| *idx);
    let mut tool_calls = Vec::with_capacity(ordered.len());
    for (_, mut tc) in ordered {
        if tc.name.is_empty() {
            warn!(session_id = ctx.session_id, tool_call_id = %tc.id, "dropping tool call with empty name");
            continue;
        }
        if tc.id.is_empty() {
            tc.id = uuid::Uuid::new_v4().to_string();
        }
        tool_calls.push(tc);
    }

    // The assistant's turn is one `Message` entry even when the model emitted
    // no text of its own (a tool-call-only turn still gets an entry, so the
    // `ToolExecution { Start }` markers that follow have an assistant parent
    // rather than hanging off whatever entry preceded this turn — spec §8
    // scenario 1's 7-entry chain depends on this).
    if !full_text.is_empty() || !tool_calls.is_empty() {
        let entry = ctx
            .store
            .append_entry(
                ctx.session_id,
                EntryPayload::Message {
                    kind: MessageKind::Assistant,
                    author: Author::System,
                    content: Json::String(full_text),
                    timestamp: chrono::Utc::now(),
                },
            )
            .await?;
        ctx.commit(CommittedAction::EntryAppended(entry)).await;
    }

    for tc in &tool_calls {
        let start = ctx
            .store
            .append_entry(
                ctx.session_id,
                EntryPayload::ToolExecution {
                    phase: ToolExecutionPhase::Start,
                    tool_call_id: tc.id.clone(),
                    tool_name: tc.name.clone(),
                    arguments: Some(tc.args.clone()),
                    result: None,
                    is_error: None,
                },
            )
            .await?;
        ctx.commit(CommittedAction::EntryAppended(start)).await;
    }

    Ok(TurnOutcome { tool_calls })
}

/// Arguments arrive as JSON-fragment deltas keyed by tool-call index; most
/// providers send the whole object as one fragment, so parsing eagerly on
/// every delta and falling back to the accumulated raw string keeps this
/// correct for both single-shot and truly incremental providers.
fn merge_arg_fragment(current: &Json, fragment: &str) -> Json {
    if fragment.is_empty() {
        return current.clone();
    }
    let raw = match current {
        Json::String(s) => format!("{s}{fragment}"),
        Json::Null => fragment.to_string(),
        other => other.to_string() + fragment,
    };
    serde_json::from_str(&raw).unwrap_or(Json::String(raw))
}

async fn call_with_retry(ctx: &mut LoopContext<'_>, req: CompletionRequest) -> Result<wuhu_model::provider::ResponseStream> {
    let mut attempt = 0u32;
    let mut backoff_ms = ctx.retry.initial_backoff_ms;
    loop {
        match ctx.provider.complete(req.clone()).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                attempt += 1;
                let reason = e.to_string();
                if attempt >= ctx.retry.max_retries {
                    record_retry_history(ctx, "give_up", attempt, &reason).await?;
                    return Err(LoopError::GiveUp { attempts: attempt, reason });
                }
                let jittered = apply_jitter(backoff_ms, ctx.retry.jitter_fraction, attempt);
                debug!(session_id = ctx.session_id, attempt, jittered, "retrying model completion after error: {reason}");
                record_retry_history(ctx, "retry_attempt", attempt, &reason).await?;
                tokio::time::sleep(std::time::Duration::from_millis(jittered)).await;
                backoff_ms = (backoff_ms * 2).min(ctx.retry.max_backoff_ms);
            }
        }
    }
}

/// Records each retry and the final give-up as a `Custom` transcript entry so
/// observers watching the subscription stream see the retry history, not
/// just a silent delay followed by either a reply or a `GiveUp` error.
async fn record_retry_history(ctx: &mut LoopContext<'_>, custom_type: &str, attempt: u32, reason: &str) -> Result<()> {
    let entry = ctx
        .store
        .append_entry(
            ctx.session_id,
            EntryPayload::Custom {
                custom_type: custom_type.to_string(),
                data: Some(serde_json::json!({ "attempt": attempt, "reason": reason })),
            },
        )
        .await?;
    ctx.commit(CommittedAction::EntryAppended(entry)).await;
    Ok(())
}

/// Deterministic jitter derived from the attempt count rather than a random
/// number generator, so retry timing stays reproducible in tests: scales the
/// backoff by a value in `[1 - jitter_fraction, 1]` using the attempt number
/// as a cheap, non-repeating seed.
fn apply_jitter(backoff_ms: u64, jitter_fraction: f64, attempt: u32) -> u64 {
    if jitter_fraction <= 0.0 {
        return backoff_ms;
    }
    let phase = (attempt as f64 * 0.618_033_988_75).fract();
    let factor = 1.0 - jitter_fraction * phase;
    ((backoff_ms as f64) * factor).round() as u64
}

// ─── Tool dispatch ────────────────────────────────────────────────────────────

/// Sequential, per-assistant-message tool dispatch. A tool returning
/// `is_error: true` is recorded and the loop continues to the next call —
/// only an explicit interrupt (steer/system lane activity or `Stop`) breaks
/// the dispatch early, never a single tool's failure.
async fn dispatch_tools(ctx: &mut LoopContext<'_>, calls: &[PendingToolCall]) -> Result<()> {
    for tc in calls {
        if ctx.interrupted() {
            break;
        }
        let call = DispatchedToolCall { id: tc.id.clone(), name: tc.name.clone(), args: tc.args.clone() };
        let output = ctx.tools.execute(&call).await;
        let cap = ctx.compaction.tool_result_token_cap;
        let category = ctx.tools.get(&tc.name).map(|t| t.output_category()).unwrap_or_default();
        let rendered = smart_truncate(&output.content, category, cap);

        // `ToolCallStatus` (spec §3) is materialized as the ordered presence
        // of `ToolExecution{Start}`, a `Message{ToolResult}` entry carrying
        // the outcome, and the matching `ToolExecution{End}` — the message
        // entry is the one a `Materialized` queue record or an LLM-context
        // projection can point to, `End` is only the closing bracket.
        let result = ctx
            .store
            .append_entry(
                ctx.session_id,
                EntryPayload::Message {
                    kind: MessageKind::ToolResult,
                    author: Author::System,
                    content: Json::String(rendered.clone()),
                    timestamp: chrono::Utc::now(),
                },
            )
            .await?;
        ctx.commit(CommittedAction::EntryAppended(result)).await;

        let end = ctx
            .store
            .append_entry(
                ctx.session_id,
                EntryPayload::ToolExecution {
                    phase: ToolExecutionPhase::End,
                    tool_call_id: tc.id.clone(),
                    tool_name: tc.name.clone(),
                    arguments: None,
                    result: Some(Json::String(rendered)),
                    is_error: Some(output.is_error),
                },
            )
            .await?;
        ctx.commit(CommittedAction::EntryAppended(end)).await;
    }
    Ok(())
}

trait VersionVectorCursor {
    fn cursor_for(&self, lane: wuhu_store::Lane) -> Option<i64>;
}
impl VersionVectorCursor for wuhu_wire::subscribe::VersionVector {
    fn cursor_for(&self, lane: wuhu_store::Lane) -> Option<i64> {
        match lane {
            wuhu_store::Lane::System => self.system_lane_cursor,
            wuhu_store::Lane::Steer => self.steer_lane_cursor,
            wuhu_store::Lane::FollowUp => self.follow_up_lane_cursor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wuhu_config::{CompactionConfig, LoopConfig};
    use wuhu_model::ScriptedMockProvider;
    use wuhu_store::{EnvironmentKind, EnvironmentSnapshot, NewSession, ParticipantKind};

    async fn session_with(store: &Store, id: &str) {
        store
            .create_session(NewSession {
                id: id.to_string(),
                provider: "mock".into(),
                model: "mock-model".into(),
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
                system_prompt: Some("be helpful".into()),
            })
            .await
            .unwrap();
    }

    fn cfgs() -> (CompactionConfig, LoopConfig) {
        (CompactionConfig { enabled: false, ..CompactionConfig::default() }, LoopConfig::default())
    }

    #[tokio::test]
    async fn maybe_compact_is_a_no_op_when_keep_recent_tokens_is_zero() {
        let store = Store::open_in_memory().await.unwrap();
        session_with(&store, "s1").await;
        for i in 0..50 {
            store
                .append_entry(
                    "s1",
                    EntryPayload::Message {
                        kind: MessageKind::User,
                        author: Author::Participant { id: "alice".into(), kind: ParticipantKind::Human },
                        content: serde_json::json!(format!("message {i}")),
                        timestamp: chrono::Utc::now(),
                    },
                )
                .await
                .unwrap();
        }

        let compaction = CompactionConfig { enabled: true, keep_recent_tokens: 0, context_window_tokens: 10, reserve_tokens: 0, ..CompactionConfig::default() };
        let retry = LoopConfig::default();
        let provider: Arc<dyn wuhu_model::ModelProvider> = Arc::new(ScriptedMockProvider::always_text("unused"));
        let (tx, _rx) = broadcast::channel(32);
        let state = Arc::new(Mutex::new(SessionState::new(&store.get_session("s1").await.unwrap())));
        let tools = ToolRegistry::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let inflight = InflightTracker::default();

        maybe_compact(&mut LoopContext {
            session_id: "s1",
            store: &store,
            tools: &tools,
            provider,
            compaction: &compaction,
            retry: &retry,
            system_prompt: None,
            cancel,
            events: &tx,
            state,
            inflight: &inflight,
        })
        .await
        .unwrap();

        let entries = store.get_entries("s1", None, None).await.unwrap();
        assert!(!entries.iter().any(|e| matches!(&e.payload, EntryPayload::Compaction { .. })), "keep_recent_tokens=0 must never compact");
    }

    #[tokio::test]
    async fn full_turn_materializes_followup_then_replies_then_idles() {
        let store = Store::open_in_memory().await.unwrap();
        session_with(&store, "s1").await;
        let queue = QueueManager::new(&store);
        queue
            .enqueue(
                "s1",
                wuhu_store::Lane::FollowUp,
                None,
                QueuePayload::Party { author: Author::Participant { id: "alice".into(), kind: ParticipantKind::Human }, content: serde_json::json!("hello") },
            )
            .await
            .unwrap();

        let (compaction, retry) = cfgs();
        let provider = Arc::new(ScriptedMockProvider::always_text("hi there"));
        let (tx, _rx) = broadcast::channel(32);
        let state = Arc::new(Mutex::new(SessionState::new(&store.get_session("s1").await.unwrap())));
        let tools = ToolRegistry::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let inflight = InflightTracker::default();

        run(LoopContext {
            session_id: "s1",
            store: &store,
            tools: &tools,
            provider,
            compaction: &compaction,
            retry: &retry,
            system_prompt: Some("be helpful"),
            cancel,
            events: &tx,
            state: state.clone(),
            inflight: &inflight,
        })
        .await
        .unwrap();

        assert_eq!(state.lock().await.status, SessionStatus::Idle);
        let entries = store.get_entries("s1", None, None).await.unwrap();
        // header + materialized followup message + assistant reply
        assert_eq!(entries.len(), 3);
        assert!(!store.get_session("s1").await.unwrap().has_work);
    }

    #[tokio::test]
    async fn tool_call_round_trip_persists_start_and_end() {
        let store = Store::open_in_memory().await.unwrap();
        session_with(&store, "s1").await;
        let queue = QueueManager::new(&store);
        queue
            .enqueue(
                "s1",
                wuhu_store::Lane::FollowUp,
                None,
                QueuePayload::Party { author: Author::Participant { id: "alice".into(), kind: ParticipantKind::Human }, content: serde_json::json!("list files") },
            )
            .await
            .unwrap();

        let (compaction, retry) = cfgs();
        let provider = Arc::new(ScriptedMockProvider::tool_then_text("call-1", "echo", r#"{"x":1}"#, "done"));
        let (tx, _rx) = broadcast::channel(32);
        let state = Arc::new(Mutex::new(SessionState::new(&store.get_session("s1").await.unwrap())));

        struct EchoTool;
        #[async_trait::async_trait]
        impl wuhu_tools::Tool for EchoTool {
            fn name(&self) -> &str { "echo" }
            fn description(&self) -> &str { "echo" }
            fn parameters_schema(&self) -> Json { serde_json::json!({"type":"object"}) }
            fn default_policy(&self) -> wuhu_tools::ApprovalPolicy { wuhu_tools::ApprovalPolicy::Auto }
            async fn execute(&self, call: &wuhu_tools::ToolCall) -> wuhu_tools::ToolOutput {
                wuhu_tools::ToolOutput::ok(&call.id, "ok")
            }
        }
        let mut tools = ToolRegistry::new();
        tools.register(EchoTool);
        let cancel = Arc::new(AtomicBool::new(false));
        let inflight = InflightTracker::default();

        run(LoopContext {
            session_id: "s1",
            store: &store,
            tools: &tools,
            provider,
            compaction: &compaction,
            retry: &retry,
            system_prompt: None,
            cancel,
            events: &tx,
            state,
            inflight: &inflight,
        })
        .await
        .unwrap();

        let entries = store.get_entries("s1", None, None).await.unwrap();
        let tool_entries: Vec<_> = entries
            .iter()
            .filter(|e| matches!(e.payload, EntryPayload::ToolExecution { .. }))
            .collect();
        assert_eq!(tool_entries.len(), 2);
        assert!(matches!(tool_entries[0].payload, EntryPayload::ToolExecution { phase: ToolExecutionPhase::Start, .. }));
        assert!(matches!(tool_entries[1].payload, EntryPayload::ToolExecution { phase: ToolExecutionPhase::End, .. }));
    }

    /// Spec §8 scenario 1: a prompt that triggers exactly one tool call
    /// produces a 7-entry linear chain — header, user message, assistant
    /// (tool call), tool-start, tool-result message, tool-end, final
    /// assistant text — each entry parented by its immediate predecessor.
    #[tokio::test]
    async fn prompt_plus_tool_plus_assistant_yields_the_seven_entry_chain() {
        let store = Store::open_in_memory().await.unwrap();
        session_with(&store, "s1").await;
        let queue = QueueManager::new(&store);
        queue
            .enqueue(
                "s1",
                wuhu_store::Lane::FollowUp,
                None,
                QueuePayload::Party {
                    author: Author::Participant { id: "alice".into(), kind: ParticipantKind::Human },
                    content: serde_json::json!("What's the weather in Tokyo?"),
                },
            )
            .await
            .unwrap();

        let (compaction, retry) = cfgs();
        let provider = Arc::new(ScriptedMockProvider::tool_then_text(
            "tool-1",
            "weather",
            r#"{"city":"Tokyo"}"#,
            "Tokyo is 29°C.",
        ));
        let (tx, _rx) = broadcast::channel(32);
        let state = Arc::new(Mutex::new(SessionState::new(&store.get_session("s1").await.unwrap())));

        struct WeatherTool;
        #[async_trait::async_trait]
        impl wuhu_tools::Tool for WeatherTool {
            fn name(&self) -> &str { "weather" }
            fn description(&self) -> &str { "weather" }
            fn parameters_schema(&self) -> Json { serde_json::json!({"type":"object"}) }
            fn default_policy(&self) -> wuhu_tools::ApprovalPolicy { wuhu_tools::ApprovalPolicy::Auto }
            async fn execute(&self, call: &wuhu_tools::ToolCall) -> wuhu_tools::ToolOutput {
                wuhu_tools::ToolOutput::ok(&call.id, "29°C")
            }
        }
        let mut tools = ToolRegistry::new();
        tools.register(WeatherTool);
        let cancel = Arc::new(AtomicBool::new(false));
        let inflight = InflightTracker::default();

        run(LoopContext {
            session_id: "s1",
            store: &store,
            tools: &tools,
            provider,
            compaction: &compaction,
            retry: &retry,
            system_prompt: Some("You are helpful."),
            cancel,
            events: &tx,
            state,
            inflight: &inflight,
        })
        .await
        .unwrap();

        let entries = store.get_entries("s1", None, None).await.unwrap();
        assert_eq!(entries.len(), 7);

        assert!(matches!(entries[0].payload, EntryPayload::Header { .. }));
        assert_eq!(entries[0].parent_entry_id, None);

        assert!(matches!(entries[1].payload, EntryPayload::Message { kind: MessageKind::User, .. }));
        assert_eq!(entries[1].parent_entry_id, Some(entries[0].id));

        assert!(matches!(entries[2].payload, EntryPayload::Message { kind: MessageKind::Assistant, .. }));
        assert_eq!(entries[2].parent_entry_id, Some(entries[1].id));

        assert!(matches!(entries[3].payload, EntryPayload::ToolExecution { phase: ToolExecutionPhase::Start, .. }));
        assert_eq!(entries[3].parent_entry_id, Some(entries[2].id));

        match &entries[4].payload {
            EntryPayload::Message { kind: MessageKind::ToolResult, content, .. } => {
                assert_eq!(content, &serde_json::json!("29°C"));
            }
            other => panic!("expected tool-result message, got {other:?}"),
        }
        assert_eq!(entries[4].parent_entry_id, Some(entries[3].id));

        assert!(matches!(entries[5].payload, EntryPayload::ToolExecution { phase: ToolExecutionPhase::End, .. }));
        assert_eq!(entries[5].parent_entry_id, Some(entries[4].id));

        match &entries[6].payload {
            EntryPayload::Message { kind: MessageKind::Assistant, content, .. } => {
                assert_eq!(content, &serde_json::json!("Tokyo is 29°C."));
            }
            other => panic!("expected final assistant message, got {other:?}"),
        }
        assert_eq!(entries[6].parent_entry_id, Some(entries[5].id));
    }

    #[tokio::test]
    async fn crash_recovery_synthesizes_error_for_non_idempotent_tool() {
        let store = Store::open_in_memory().await.unwrap();
        session_with(&store, "s1").await;
        store
            .append_entry(
                "s1",
                EntryPayload::ToolExecution {
                    phase: ToolExecutionPhase::Start,
                    tool_call_id: "c1".into(),
                    tool_name: "shell".into(),
                    arguments: Some(serde_json::json!({"command":"ls"})),
                    result: None,
                    is_error: None,
                },
            )
            .await
            .unwrap();

        let (compaction, retry) = cfgs();
        let provider = Arc::new(ScriptedMockProvider::new(vec![]));
        let (tx, _rx) = broadcast::channel(32);
        let state = Arc::new(Mutex::new(SessionState::new(&store.get_session("s1").await.unwrap())));
        let tools = ToolRegistry::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let inflight = InflightTracker::default();

        recover_from_crash(&mut LoopContext {
            session_id: "s1",
            store: &store,
            tools: &tools,
            provider,
            compaction: &compaction,
            retry: &retry,
            system_prompt: None,
            cancel,
            events: &tx,
            state,
            inflight: &inflight,
        })
        .await
        .unwrap();

        let entries = store.get_entries("s1", None, None).await.unwrap();
        let end = entries
            .iter()
            .find(|e| matches!(&e.payload, EntryPayload::ToolExecution { phase: ToolExecutionPhase::End, .. }))
            .unwrap();
        match &end.payload {
            EntryPayload::ToolExecution { is_error, result, .. } => {
                assert_eq!(*is_error, Some(true));
                assert!(result.as_ref().unwrap().to_string().contains("recovered_from_crash"));
            }
            _ => panic!("expected tool execution end"),
        }

        let result_message = entries
            .iter()
            .find(|e| matches!(&e.payload, EntryPayload::Message { kind: MessageKind::ToolResult, .. }))
            .expect("crash recovery must append a Message{ToolResult} entry");
        assert_eq!(result_message.parent_entry_id, Some(2), "the result message must be the tool-start's direct child");
        assert_eq!(end.parent_entry_id, Some(result_message.id), "the End marker must follow the result message");
    }

    #[test]
    fn apply_jitter_stays_within_bounds() {
        for attempt in 0..20 {
            let j = apply_jitter(1000, 0.2, attempt);
            assert!(j <= 1000 && j >= 800);
        }
    }

    #[test]
    fn zero_jitter_fraction_returns_base_backoff() {
        assert_eq!(apply_jitter(500, 0.0, 3), 500);
    }

    #[test]
    fn merge_arg_fragment_parses_full_json_in_one_delta() {
        let merged = merge_arg_fragment(&Json::Null, r#"{"path":"a.rs"}"#);
        assert_eq!(merged, serde_json::json!({"path":"a.rs"}));
    }

    #[test]
    fn merge_arg_fragment_accumulates_incremental_deltas() {
        let mut acc = Json::Null;
        acc = merge_arg_fragment(&acc, r#"{"pat"#);
        acc = merge_arg_fragment(&acc, r#"h":"a.rs"}"#);
        assert_eq!(acc, serde_json::json!({"path":"a.rs"}));
    }

    #[tokio::test]
    async fn second_distinct_participant_escalates_to_group_chat_prefixing() {
        let store = Store::open_in_memory().await.unwrap();
        session_with(&store, "s1").await;
        let queue = QueueManager::new(&store);

        queue
            .enqueue(
                "s1",
                wuhu_store::Lane::FollowUp,
                None,
                QueuePayload::Party {
                    author: Author::Participant { id: "alice".into(), kind: ParticipantKind::Human },
                    content: serde_json::json!("hello"),
                },
            )
            .await
            .unwrap();

        let (compaction, retry) = cfgs();
        let (tx, _rx) = broadcast::channel(32);
        let state = Arc::new(Mutex::new(SessionState::new(&store.get_session("s1").await.unwrap())));
        let tools = ToolRegistry::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let inflight = InflightTracker::default();
        let provider = Arc::new(ScriptedMockProvider::always_text("hi alice"));

        run(LoopContext {
            session_id: "s1",
            store: &store,
            tools: &tools,
            provider,
            compaction: &compaction,
            retry: &retry,
            system_prompt: None,
            cancel: cancel.clone(),
            events: &tx,
            state: state.clone(),
            inflight: &inflight,
        })
        .await
        .unwrap();

        // alice's opener has no prior participant, so no marker yet.
        let entries = store.get_entries("s1", None, None).await.unwrap();
        assert!(!entries.iter().any(|e| matches!(&e.payload, EntryPayload::Custom { custom_type, .. } if custom_type == "participant_joined")));

        queue
            .enqueue(
                "s1",
                wuhu_store::Lane::FollowUp,
                None,
                QueuePayload::Party {
                    author: Author::Participant { id: "bob".into(), kind: ParticipantKind::Human },
                    content: serde_json::json!("hi"),
                },
            )
            .await
            .unwrap();

        let provider2 = Arc::new(ScriptedMockProvider::always_text("hi bob"));
        run(LoopContext {
            session_id: "s1",
            store: &store,
            tools: &tools,
            provider: provider2,
            compaction: &compaction,
            retry: &retry,
            system_prompt: None,
            cancel,
            events: &tx,
            state: state.clone(),
            inflight: &inflight,
        })
        .await
        .unwrap();

        let entries = store.get_entries("s1", None, None).await.unwrap();
        let marker_idx = entries
            .iter()
            .position(|e| matches!(&e.payload, EntryPayload::Custom { custom_type, .. } if custom_type == "participant_joined"))
            .expect("bob's arrival must drop a participant_joined marker");
        let bob_msg_idx = entries
            .iter()
            .position(|e| matches!(&e.payload, EntryPayload::Message { author: Author::Participant { id, .. }, .. } if id == "bob"))
            .unwrap();
        assert!(marker_idx < bob_msg_idx, "marker must precede bob's message");

        let messages = build_projection(
            &LoopContext {
                session_id: "s1",
                store: &store,
                tools: &tools,
                provider: Arc::new(ScriptedMockProvider::always_text("unused")),
                compaction: &compaction,
                retry: &retry,
                system_prompt: None,
                cancel: Arc::new(AtomicBool::new(false)),
                events: &tx,
                state,
                inflight: &inflight,
            },
            &entries,
        );
        let rendered: Vec<&str> = messages
            .iter()
            .filter_map(|m| match &m.content {
                wuhu_model::MessageContent::Text(t) if m.role == wuhu_model::Role::User => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert!(rendered.iter().any(|t| *t == "hello"), "alice's opener stays un-prefixed: {rendered:?}");
        assert!(rendered.iter().any(|t| *t == "bob:\n\nhi"), "bob's message is prefixed: {rendered:?}");
    }
}
