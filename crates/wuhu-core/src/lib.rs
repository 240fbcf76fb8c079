// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The session core: the single-writer actor that owns a session's mutable
//! state, the agentic loop it drives, and the gap-free subscription engine
//! observers attach to. Durable storage, lane queueing, compaction, model
//! access, and tool execution are all external collaborators (see
//! `wuhu-store`, `wuhu-queue`, `wuhu-compact`, `wuhu-model`, `wuhu-tools`);
//! this crate only wires them together into the session command surface.

mod actor;
mod error;
mod loop_;
mod prompts;
mod provider_resolver;
mod reducer;
mod subscribe;

pub use actor::{SessionActor, SessionRegistry, SetModelOutcome, StopOutcome};
pub use error::{LoopError, Result};
pub use loop_::{InflightTracker, LoopContext};
pub use prompts::{system_prompt, PromptContext};
pub use provider_resolver::{MapResolver, ProviderResolver, StaticResolver};
pub use reducer::{reload, CommittedAction, SessionState};
pub use subscribe::{subscribe, RegisterSnapshot};
