// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod mock;
mod provider;
pub mod sanitize;
mod types;

pub use mock::{MockProvider, ScriptedMockProvider};
pub use provider::{InputModality, ModelProvider, ResponseStream};
pub use types::*;
