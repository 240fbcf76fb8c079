// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The session actor: the single writer for one session's mutable state
//! (spec §4.2). Commands that only append to a queue (`enqueue`,
//! `enqueue_system`, `cancel`) hit the store directly and return as soon as
//! the durable write lands — queueing is itself concurrency-safe, and the
//! actor only needs to make sure the agentic loop is running to drain it.
//! Commands that touch `SessionState` (`set_model`, `stop`) serialize behind
//! the same lock the loop itself runs under, so a turn in progress and a
//! command never observe or mutate state at the same time.
//!
//! Ownership: a process holds at most one [`SessionActor`] per session
//! identifier — [`SessionRegistry`] is the map enforcing that.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value as Json;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;
use wuhu_config::{CompactionConfig, LoopConfig};
use wuhu_queue::QueueManager;
use wuhu_store::{Author, EntryPayload, Lane, MessageKind, NewSession, QueuePayload, Store, ToolExecutionPhase, TranscriptEntry};
use wuhu_tools::ToolRegistry;
use wuhu_wire::subscribe::{Event, SessionStatus, StablePatch, VersionVector};

use crate::error::{LoopError, Result};
use crate::loop_::{self, InflightTracker, LoopContext};
use crate::provider_resolver::ProviderResolver;
use crate::reducer::{self, CommittedAction, SessionState};
use crate::subscribe::{self, EventStream, RegisterSnapshot};

/// Outcome of [`SessionActor::set_model`]: whether the change was applied
/// immediately (the session was idle) or deferred until the in-flight turn
/// returns to idle.
#[derive(Debug, Clone)]
pub struct SetModelOutcome {
    pub applied: bool,
    pub provider: String,
    pub model: String,
    pub reasoning_effort: Option<String>,
}

/// Outcome of [`SessionActor::stop`]: the stop marker entry (if the session
/// was not already idle) and the synthesized repair entries — a `Message {
/// ToolResult }` plus its matching `ToolExecution { End }` per tool call left
/// unterminated by the interrupt.
#[derive(Debug, Clone)]
pub struct StopOutcome {
    pub stop_entry: Option<TranscriptEntry>,
    pub repaired_entries: Vec<TranscriptEntry>,
}

/// Owns one session's serialized mutable state and drives its agentic loop.
///
/// `state`, `cancel`, `loop_active` and `pending_model_change` are
/// independent primitives rather than one `Mutex<ActorInner>`: a turn spans
/// suspension points (inference, tool I/O) that must never happen while
/// holding a lock (spec §5, §9). `state` is locked only for the brief folds
/// `LoopContext::commit` performs; `cancel`/`loop_active` are lock-free
/// atomics so `stop()` and `ensure_loop_running()` never wait on a turn in
/// progress.
pub struct SessionActor {
    session_id: String,
    store: Arc<Store>,
    tools: Arc<ToolRegistry>,
    resolver: Arc<dyn ProviderResolver>,
    compaction: CompactionConfig,
    retry: LoopConfig,
    system_prompt: Option<String>,
    events: broadcast::Sender<Event>,
    inflight: InflightTracker,
    state: Arc<Mutex<SessionState>>,
    cancel: Arc<AtomicBool>,
    loop_active: Arc<AtomicBool>,
    pending_model_change: Mutex<Option<(String, String, Option<String>)>>,
}

impl SessionActor {
    /// Reconstructs an actor's in-memory state from the durable store —
    /// used both for a session's first subscription/command after process
    /// start and, transitively through [`loop_::run`]'s own crash-recovery
    /// pass, after an unclean restart.
    pub async fn load(
        store: Arc<Store>,
        tools: Arc<ToolRegistry>,
        resolver: Arc<dyn ProviderResolver>,
        compaction: CompactionConfig,
        retry: LoopConfig,
        session_id: &str,
    ) -> Result<Arc<Self>> {
        let state = reducer::reload(&store, session_id).await?;
        let header = store.get_entries(session_id, None, Some(1)).await?;
        let system_prompt = header.first().and_then(|e| match &e.payload {
            EntryPayload::Header { system_prompt, .. } => system_prompt.clone(),
            _ => None,
        });
        let (events, _rx) = broadcast::channel(1024);

        Ok(Arc::new(Self {
            session_id: session_id.to_string(),
            store,
            tools,
            resolver,
            compaction,
            retry,
            system_prompt,
            events,
            inflight: InflightTracker::default(),
            state: Arc::new(Mutex::new(state)),
            cancel: Arc::new(AtomicBool::new(false)),
            loop_active: Arc::new(AtomicBool::new(false)),
            pending_model_change: Mutex::new(None),
        }))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Enqueues party-sourced input on `steer` or `followUp` and ensures the
    /// loop is running to drain it. Returns the queue item id.
    pub async fn enqueue(self: &Arc<Self>, lane: Lane, author: Author, content: Json) -> Result<String> {
        if lane == Lane::System {
            return Err(LoopError::InvalidCommand("use enqueue_system for the system lane".into()));
        }
        let id = QueueManager::new(&self.store).enqueue(&self.session_id, lane, None, QueuePayload::Party { author, content }).await?;
        self.ensure_loop_running();
        Ok(id)
    }

    /// Enqueues machine-sourced input on the non-cancelable `system` lane.
    pub async fn enqueue_system(self: &Arc<Self>, source: String, content: Json) -> Result<String> {
        let id = QueueManager::new(&self.store).enqueue(&self.session_id, Lane::System, None, QueuePayload::System { source, content }).await?;
        self.ensure_loop_running();
        Ok(id)
    }

    /// Cancels a pending item. Fails silently if it is already terminal or
    /// non-cancelable — matches `wuhu_queue::QueueManager::cancel`'s own
    /// contract, which this just forwards to.
    pub async fn cancel(&self, lane: Lane, id: &str) -> Result<()> {
        QueueManager::new(&self.store).cancel(&self.session_id, lane, id).await?;
        Ok(())
    }

    /// Changes the session's model selection. Applied immediately if the
    /// session is idle; otherwise deferred until the running turn idles, so
    /// a model never changes mid-inference.
    pub async fn set_model(self: &Arc<Self>, provider: String, model: String, reasoning_effort: Option<String>) -> Result<SetModelOutcome> {
        let is_idle = self.state.lock().await.status == SessionStatus::Idle;
        if is_idle {
            self.commit_settings(provider.clone(), model.clone(), reasoning_effort.clone()).await?;
            Ok(SetModelOutcome { applied: true, provider, model, reasoning_effort })
        } else {
            *self.pending_model_change.lock().await = Some((provider.clone(), model.clone(), reasoning_effort.clone()));
            Ok(SetModelOutcome { applied: false, provider, model, reasoning_effort })
        }
    }

    /// Interrupts any running turn, appends a stop marker, and synthesizes
    /// an error `Message { ToolResult }` plus the matching `ToolExecution
    /// { End }` for any tool call the interrupt left unterminated — unlike
    /// crash recovery, an explicit stop never re-executes even an idempotent
    /// tool.
    ///
    /// `cancel` is set directly on the shared atomic, without taking any
    /// lock first, so a turn `drive_loop` is actively running observes it at
    /// its very next `ctx.interrupted()` check instead of only after the
    /// turn has already finished on its own.
    pub async fn stop(self: &Arc<Self>) -> Result<StopOutcome> {
        let was_running = self.loop_active.load(Ordering::Acquire);
        if !was_running {
            return Ok(StopOutcome { stop_entry: None, repaired_entries: Vec::new() });
        }
        self.cancel.store(true, Ordering::Relaxed);

        let stop_entry = self
            .store
            .append_entry(&self.session_id, EntryPayload::Custom { custom_type: "execution_stopped".into(), data: None })
            .await?;

        let entries = self.store.get_entries(&self.session_id, None, None).await?;
        let mut repaired_entries = Vec::new();
        for entry in loop_::unterminated_tool_starts(&entries) {
            let EntryPayload::ToolExecution { tool_call_id, tool_name, .. } = &entry.payload else { continue };
            let result_content = Json::String("stopped by an explicit stop command".into());
            let result_entry = self
                .store
                .append_entry(
                    &self.session_id,
                    EntryPayload::Message {
                        kind: MessageKind::ToolResult,
                        author: Author::System,
                        content: result_content.clone(),
                        timestamp: chrono::Utc::now(),
                    },
                )
                .await?;
            repaired_entries.push(result_entry);
            let end = self
                .store
                .append_entry(
                    &self.session_id,
                    EntryPayload::ToolExecution {
                        phase: ToolExecutionPhase::End,
                        tool_call_id: tool_call_id.clone(),
                        tool_name: tool_name.clone(),
                        arguments: None,
                        result: Some(result_content),
                        is_error: Some(true),
                    },
                )
                .await?;
            repaired_entries.push(end);
        }

        {
            let mut guard = self.state.lock().await;
            guard.apply(&CommittedAction::EntryAppended(stop_entry.clone()));
            for entry in &repaired_entries {
                guard.apply(&CommittedAction::EntryAppended(entry.clone()));
            }
        }
        let _ = self.events.send(loop_::to_wire_event(&CommittedAction::EntryAppended(stop_entry.clone())));
        for entry in &repaired_entries {
            let _ = self.events.send(loop_::to_wire_event(&CommittedAction::EntryAppended(entry.clone())));
        }

        Ok(StopOutcome { stop_entry: Some(stop_entry), repaired_entries })
    }

    /// Direct transcript read per spec §6's `SessionCommanding.getTranscript`
    /// — unlike `subscribe`, this does not register a live event stream, it
    /// just answers one `getEntries` query against the store.
    pub async fn get_transcript(
        &self,
        since: Option<i64>,
        since_time: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<TranscriptEntry>> {
        Ok(self.store.get_entries_filtered(&self.session_id, since, since_time, None).await?)
    }

    /// Subscribes an observer to this session's transcript/queue/status
    /// stream, backfilling since `since` per spec §4.6.
    pub async fn subscribe(self: &Arc<Self>, since: Option<VersionVector>) -> Result<(StablePatch, EventStream)> {
        let registers = {
            let guard = self.state.lock().await;
            RegisterSnapshot {
                status: guard.status,
                provider: guard.provider.clone(),
                model: guard.model.clone(),
                reasoning_effort: guard.reasoning_effort.clone(),
            }
        };
        subscribe::subscribe(&self.store, &self.events, &self.inflight, &self.session_id, since, registers).await
    }

    /// Spec §4.2's derived `Idle | Running | Stopped` register, recomputed
    /// fresh from the transcript — see [`reducer::derive_status`].
    pub async fn status(&self) -> Result<wuhu_wire::subscribe::RegisterStatus> {
        let entries = self.store.get_entries(&self.session_id, None, None).await?;
        Ok(reducer::derive_status(&entries))
    }

    /// Marks the loop running and spawns `drive_loop` unless it is already
    /// active. The atomic swap makes the check-and-set race-free without any
    /// lock, so a burst of concurrent `enqueue` calls spawns at most one
    /// driver.
    fn ensure_loop_running(self: &Arc<Self>) {
        if self.loop_active.swap(true, Ordering::AcqRel) {
            return;
        }
        let actor = Arc::clone(self);
        tokio::spawn(async move {
            actor.drive_loop().await;
        });
    }

    async fn commit_settings(&self, provider: String, model: String, reasoning_effort: Option<String>) -> Result<()> {
        let entry = self
            .store
            .append_entry(
                &self.session_id,
                EntryPayload::SessionSettings { provider: provider.clone(), model: model.clone(), reasoning_effort: reasoning_effort.clone() },
            )
            .await?;
        let settings = CommittedAction::SettingsUpdated { provider, model, reasoning_effort };
        {
            let mut guard = self.state.lock().await;
            guard.apply(&CommittedAction::EntryAppended(entry.clone()));
            guard.apply(&settings);
        }
        let _ = self.events.send(loop_::to_wire_event(&CommittedAction::EntryAppended(entry)));
        let _ = self.events.send(loop_::to_wire_event(&settings));
        Ok(())
    }

    /// Runs the agentic loop to completion (repeatedly, in case new work
    /// arrives in the narrow window between a turn finishing and us
    /// releasing `loop_active`), applying any model change deferred by
    /// `set_model` once the session is idle again.
    ///
    /// No lock is held across `loop_::run`'s await (spec §5, §9): the
    /// provider is resolved under a brief lock on `state`, then `run` itself
    /// only ever takes that same lock for the instant of one `commit`.
    async fn drive_loop(self: Arc<Self>) {
        loop {
            let provider = {
                let guard = self.state.lock().await;
                match self.resolver.resolve(&guard.provider, &guard.model) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(session_id = %self.session_id, error = %e, "failed to resolve provider, aborting turn");
                        self.loop_active.store(false, Ordering::Release);
                        return;
                    }
                }
            };
            let ctx = LoopContext {
                session_id: &self.session_id,
                store: &self.store,
                tools: &self.tools,
                provider,
                compaction: &self.compaction,
                retry: &self.retry,
                system_prompt: self.system_prompt.as_deref(),
                cancel: self.cancel.clone(),
                events: &self.events,
                state: self.state.clone(),
                inflight: &self.inflight,
            };
            let result = loop_::run(ctx).await;
            if let Err(e) = &result {
                warn!(session_id = %self.session_id, error = %e, "agentic loop turn ended in error");
            }

            self.cancel.store(false, Ordering::Relaxed);

            let pending_change = self.pending_model_change.lock().await.take();
            if let Some((provider, model, reasoning_effort)) = pending_change {
                if let Err(e) = self.commit_settings(provider, model, reasoning_effort).await {
                    warn!(session_id = %self.session_id, error = %e, "failed to apply deferred model change");
                }
            }

            let has_more = self.store.any_pending(&self.session_id).await.unwrap_or(false);
            if !has_more {
                self.loop_active.store(false, Ordering::Release);
                return;
            }
        }
    }
}

/// Process-wide map from session id to its live actor, enforcing the
/// at-most-one-actor-per-session ownership rule (spec §4.2, §9).
pub struct SessionRegistry {
    store: Arc<Store>,
    tools: Arc<ToolRegistry>,
    resolver: Arc<dyn ProviderResolver>,
    compaction: CompactionConfig,
    retry: LoopConfig,
    actors: Mutex<HashMap<String, Arc<SessionActor>>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<Store>, tools: Arc<ToolRegistry>, resolver: Arc<dyn ProviderResolver>, compaction: CompactionConfig, retry: LoopConfig) -> Self {
        Self { store, tools, resolver, compaction, retry, actors: Mutex::new(HashMap::new()) }
    }

    /// Creates a new session in the store and loads its actor.
    pub async fn create_session(&self, new: NewSession) -> Result<Arc<SessionActor>> {
        let id = new.id.clone();
        self.store.create_session(new).await?;
        self.get_or_load(&id).await
    }

    /// Returns the live actor for `session_id`, loading it from the store on
    /// first access.
    pub async fn get_or_load(&self, session_id: &str) -> Result<Arc<SessionActor>> {
        let mut actors = self.actors.lock().await;
        if let Some(actor) = actors.get(session_id) {
            return Ok(Arc::clone(actor));
        }
        let actor =
            SessionActor::load(Arc::clone(&self.store), Arc::clone(&self.tools), Arc::clone(&self.resolver), self.compaction.clone(), self.retry.clone(), session_id)
                .await?;
        actors.insert(session_id.to_string(), Arc::clone(&actor));
        Ok(actor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wuhu_model::{MockProvider, ScriptedMockProvider};
    use wuhu_store::{EnvironmentKind, EnvironmentSnapshot, ParticipantKind};

    use crate::provider_resolver::StaticResolver;

    fn new_session(id: &str) -> NewSession {
        NewSession {
            id: id.to_string(),
            provider: "mock".into(),
            model: "mock-model".into(),
            reasoning_effort: None,
            parent_session_id: None,
            working_dir: "/workspace".into(),
            environment: EnvironmentSnapshot { name: "default".into(), kind: EnvironmentKind::Local, path: "/workspace".into(), template_path: None, startup_script: None },
            system_prompt: Some("be helpful".into()),
        }
    }

    async fn registry_with(provider: Arc<dyn wuhu_model::ModelProvider>) -> SessionRegistry {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let tools = Arc::new(ToolRegistry::new());
        let resolver: Arc<dyn ProviderResolver> = Arc::new(StaticResolver::new(provider));
        SessionRegistry::new(store, tools, resolver, CompactionConfig { enabled: false, ..CompactionConfig::default() }, LoopConfig::default())
    }

    async fn wait_idle(actor: &Arc<SessionActor>) {
        for _ in 0..200 {
            let status = actor.state.lock().await.status;
            let loop_active = actor.loop_active.load(Ordering::Acquire);
            if status == SessionStatus::Idle && !loop_active {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("actor never returned to idle");
    }

    #[tokio::test]
    async fn enqueue_drives_the_loop_to_a_reply_and_back_to_idle() {
        let registry = registry_with(Arc::new(ScriptedMockProvider::always_text("hi there"))).await;
        let actor = registry.create_session(new_session("s1")).await.unwrap();

        actor
            .enqueue(Lane::FollowUp, Author::Participant { id: "alice".into(), kind: ParticipantKind::Human }, serde_json::json!("hello"))
            .await
            .unwrap();
        wait_idle(&actor).await;

        let entries = actor.store.get_entries("s1", None, None).await.unwrap();
        assert!(entries.iter().any(|e| matches!(&e.payload, EntryPayload::Message { kind: wuhu_store::MessageKind::Assistant, .. })));
    }

    #[tokio::test]
    async fn set_model_applies_immediately_while_idle() {
        let registry = registry_with(Arc::new(MockProvider)).await;
        let actor = registry.create_session(new_session("s1")).await.unwrap();

        let outcome = actor.set_model("anthropic".into(), "claude".into(), Some("high".into())).await.unwrap();
        assert!(outcome.applied);
        assert_eq!(actor.state.lock().await.provider, "anthropic");
    }

    #[tokio::test]
    async fn second_get_or_load_returns_the_same_actor() {
        let registry = registry_with(Arc::new(MockProvider)).await;
        let first = registry.create_session(new_session("s1")).await.unwrap();
        let second = registry.get_or_load("s1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn stop_while_idle_is_a_no_op() {
        let registry = registry_with(Arc::new(MockProvider)).await;
        let actor = registry.create_session(new_session("s1")).await.unwrap();
        let outcome = actor.stop().await.unwrap();
        assert!(outcome.stop_entry.is_none());
        assert!(outcome.repaired_entries.is_empty());
    }

    #[tokio::test]
    async fn cancel_on_system_lane_is_rejected() {
        let registry = registry_with(Arc::new(MockProvider)).await;
        let actor = registry.create_session(new_session("s1")).await.unwrap();
        let id = actor.enqueue_system("runner".into(), serde_json::json!({})).await.unwrap();
        let err = actor.cancel(Lane::System, &id).await.unwrap_err();
        assert!(matches!(err, LoopError::Queue(_)));
    }

    /// A tool that blocks until released, notifying the test once its
    /// execution has actually begun. Lets a test observe `stop()` racing a
    /// turn that is genuinely in flight rather than one that merely hasn't
    /// started yet.
    struct BlockingTool {
        started: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait::async_trait]
    impl wuhu_tools::Tool for BlockingTool {
        fn name(&self) -> &str {
            "block"
        }
        fn description(&self) -> &str {
            "blocks until released"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        fn default_policy(&self) -> wuhu_tools::ApprovalPolicy {
            wuhu_tools::ApprovalPolicy::Auto
        }
        async fn execute(&self, call: &wuhu_tools::ToolCall) -> wuhu_tools::ToolOutput {
            self.started.notify_one();
            self.release.notified().await;
            wuhu_tools::ToolOutput::ok(&call.id, "released")
        }
    }

    #[tokio::test]
    async fn stop_interrupts_a_turn_blocked_on_a_tool_call() {
        let provider = Arc::new(ScriptedMockProvider::tool_then_text("call-1", "block", "{}", "done"));
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let mut tools = ToolRegistry::new();
        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        tools.register(BlockingTool { started: started.clone(), release: release.clone() });
        let resolver: Arc<dyn ProviderResolver> = Arc::new(StaticResolver::new(provider));
        let registry = SessionRegistry::new(store, Arc::new(tools), resolver, CompactionConfig { enabled: false, ..CompactionConfig::default() }, LoopConfig::default());
        let actor = registry.create_session(new_session("s1")).await.unwrap();

        actor
            .enqueue(Lane::FollowUp, Author::Participant { id: "alice".into(), kind: ParticipantKind::Human }, serde_json::json!("go"))
            .await
            .unwrap();

        // Wait for the tool call to actually be mid-flight before stopping,
        // proving the interrupt reaches a turn that is genuinely running
        // rather than one that simply hadn't started yet.
        tokio::time::timeout(Duration::from_secs(1), started.notified()).await.unwrap();

        let outcome = actor.stop().await.unwrap();
        assert!(outcome.stop_entry.is_some());
        // One unterminated tool call repairs to two entries: the error
        // `Message { ToolResult }` and its matching `ToolExecution { End }`.
        assert_eq!(outcome.repaired_entries.len(), 2);

        release.notify_one();
        wait_idle(&actor).await;

        let entries = actor.store.get_entries("s1", None, None).await.unwrap();
        assert!(!entries.iter().any(|e| matches!(
            &e.payload,
            EntryPayload::Message { kind: wuhu_store::MessageKind::Assistant, content, .. }
                if content.as_str() == Some("done")
        )));
    }
}
