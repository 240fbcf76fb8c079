// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{de::DeserializeOwned, Serialize};

/// Encode any wire message to CBOR (via `ciborium`) — the compact,
/// schema-free encoding used over the runner/tool-executor channel and the
/// persistent subscription transport.
pub fn encode_cbor<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| anyhow::anyhow!("CBOR encode: {e}"))?;
    Ok(buf)
}

/// Decode a wire message from CBOR bytes.
pub fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    ciborium::from_reader(bytes).map_err(|e| anyhow::anyhow!("CBOR decode: {e}"))
}

/// Encode any wire message to JSON — used by the WebSocket/HTTP facing
/// subscription transport where CBOR's binary framing is less convenient
/// (browser clients, log inspection, curl debugging).
pub fn encode_json<T: Serialize>(value: &T) -> anyhow::Result<String> {
    serde_json::to_string(value).map_err(|e| anyhow::anyhow!("JSON encode: {e}"))
}

/// Decode a wire message from a JSON string.
pub fn decode_json<T: DeserializeOwned>(s: &str) -> anyhow::Result<T> {
    serde_json::from_str(s).map_err(|e| anyhow::anyhow!("JSON decode: {e}"))
}
