// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Error kinds owned by the agentic loop. `StoreError`/`QueueError` propagate
/// in unchanged via `From` — the loop never translates a store failure into
/// one of its own variants, since a write that fails at the durable layer is
/// already fully described by `StoreError`.
#[derive(Debug, Error)]
pub enum LoopError {
    /// A single turn's projected context exceeds the configured window even
    /// before compaction is attempted.
    #[error("context overflow: {0} tokens exceeds window")]
    ContextOverflow(usize),

    /// Compaction ran once and the resulting projection still does not fit.
    /// The loop never compacts twice for the same trigger.
    #[error(transparent)]
    InputDoesNotFit(#[from] wuhu_compact::CompactError),

    /// A tool invocation failed in a way the loop could not route around
    /// (distinct from a tool returning `is_error: true`, which is recorded
    /// in the transcript and does not stop the loop).
    #[error("tool {tool_name} failed: {reason}")]
    ToolFailed { tool_name: String, reason: String },

    /// Retry budget exhausted against the model provider.
    #[error("gave up after {attempts} attempts: {reason}")]
    GiveUp { attempts: u32, reason: String },

    #[error(transparent)]
    Store(#[from] wuhu_store::StoreError),

    #[error(transparent)]
    Queue(#[from] wuhu_queue::QueueError),

    #[error("no provider registered for {provider}/{model}")]
    UnknownProvider { provider: String, model: String },

    /// A session command was issued against the wrong lane — e.g. `enqueue`
    /// called with the `system` lane, which only `enqueue_system` may use.
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

pub type Result<T> = std::result::Result<T, LoopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_converts_via_from() {
        let store_err = wuhu_store::StoreError::not_found("session x");
        let loop_err: LoopError = store_err.into();
        assert!(matches!(loop_err, LoopError::Store(_)));
    }

    #[test]
    fn compact_error_converts_via_from() {
        let compact_err = wuhu_compact::CompactError::InputDoesNotFit { tokens_after: 100, context_limit: 50 };
        let loop_err: LoopError = compact_err.into();
        assert!(matches!(loop_err, LoopError::InputDoesNotFit(_)));
    }

    #[test]
    fn give_up_message_includes_attempt_count() {
        let e = LoopError::GiveUp { attempts: 3, reason: "timeout".into() };
        assert!(e.to_string().contains('3'));
    }
}
