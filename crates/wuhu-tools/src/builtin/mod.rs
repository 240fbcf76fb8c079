// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Illustrative tool implementations.
//!
//! Concrete tool bodies are an external-collaborator concern (see
//! `ToolExecutor` in `wuhu-core`). The two tools kept here exist only to
//! exercise the agentic loop's tool-dispatch path in tests without a real
//! tool executor attached.
pub mod read_file;
pub mod shell;
