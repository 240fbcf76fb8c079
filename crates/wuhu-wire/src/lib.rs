// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wire types for the session core's two external channels: the
//! runner/tool-executor protocol ([`runner`]) and the live subscription
//! protocol ([`subscribe`]). Every type here derives `Serialize`/
//! `Deserialize` and is transport-agnostic — [`codec`] offers both CBOR
//! (compact, binary) and JSON (debuggable, browser-friendly) encodings of
//! the same types, matching the dual-encoding convention used throughout
//! this workspace's control-plane code.

pub mod codec;
pub mod runner;
pub mod subscribe;

pub use codec::{decode_cbor, decode_json, encode_cbor, encode_json};
pub use runner::RunnerMessage;
pub use subscribe::{ConnectionState, Event, SessionStatus, StablePatch, VersionVector};
