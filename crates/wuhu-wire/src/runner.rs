// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Wire protocol between the session core and the runner/tool-executor
//! process that performs environment materialization and tool execution.
//!
//! Exchanged over a long-lived bidirectional channel (CBOR frames, see
//! [`crate::codec`]). Requests and their matching responses share the same
//! `id`; there is no requirement that responses arrive in request order —
//! a slow tool call never blocks the `hello`/registration handshake.
//!
//! # Typical flow
//!
//! ```text
//! Core                                   Runner
//!  │── Hello {runner_id} ───────────────►│
//!  │◄─ Hello {runner_id} ────────────────│
//!  │── RegisterSession {session_id} ────►│
//!  │── ResolveEnvironmentRequest {id} ───►│
//!  │◄─ ResolveEnvironmentResponse {id} ───│
//!  │── ToolRequest {id, tool_name} ──────►│
//!  │◄─ ToolResponse {id, content} ────────│
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Messages exchanged between the session core and a runner over the
/// tool-executor channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerMessage {
    /// Handshake sent by either side immediately after connecting.
    Hello { runner_id: String, capabilities: Vec<String> },

    /// Ask the runner to materialize (or locate) an environment by name.
    ResolveEnvironmentRequest { id: String, environment: String },

    /// The runner's answer, correlated to the request by `id`.
    ResolveEnvironmentResponse { id: String, path: String },

    /// Bind this connection to a session so subsequent tool traffic is
    /// routed without repeating the session id on every frame.
    RegisterSession { session_id: String },

    /// Dispatch a single tool invocation to the runner.
    ToolRequest {
        id: String,
        session_id: String,
        tool_call_id: String,
        tool_name: String,
        arguments: Json,
    },

    /// The runner's tool result, correlated to the request by `id`.
    ToolResponse {
        id: String,
        tool_call_id: String,
        content: String,
        is_error: bool,
    },
}

impl RunnerMessage {
    /// The correlation id for a request/response pair, `None` for
    /// handshake/registration frames which have no matching reply.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            RunnerMessage::ResolveEnvironmentRequest { id, .. }
            | RunnerMessage::ResolveEnvironmentResponse { id, .. }
            | RunnerMessage::ToolRequest { id, .. }
            | RunnerMessage::ToolResponse { id, .. } => Some(id),
            RunnerMessage::Hello { .. } | RunnerMessage::RegisterSession { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_cbor, encode_cbor, decode_json, encode_json};

    #[test]
    fn tool_request_cbor_round_trip() {
        let msg = RunnerMessage::ToolRequest {
            id: "req-1".into(),
            session_id: "sess-1".into(),
            tool_call_id: "call-1".into(),
            tool_name: "shell".into(),
            arguments: serde_json::json!({"command": "ls"}),
        };
        let bytes = encode_cbor(&msg).unwrap();
        let back: RunnerMessage = decode_cbor(&bytes).unwrap();
        match back {
            RunnerMessage::ToolRequest { tool_name, .. } => assert_eq!(tool_name, "shell"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn tool_response_json_round_trip() {
        let msg = RunnerMessage::ToolResponse {
            id: "req-1".into(),
            tool_call_id: "call-1".into(),
            content: "ok".into(),
            is_error: false,
        };
        let text = encode_json(&msg).unwrap();
        let back: RunnerMessage = decode_json(&text).unwrap();
        assert_eq!(back.correlation_id(), Some("req-1"));
    }

    #[test]
    fn hello_and_register_session_have_no_correlation_id() {
        assert_eq!(
            RunnerMessage::Hello { runner_id: "r1".into(), capabilities: vec![] }.correlation_id(),
            None
        );
        assert_eq!(
            RunnerMessage::RegisterSession { session_id: "s1".into() }.correlation_id(),
            None
        );
    }
}
