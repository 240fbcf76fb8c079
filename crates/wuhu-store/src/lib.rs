// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Durable, crash-consistent storage for sessions, their append-only
//! transcripts, input queues, and environment definitions.
//!
//! A single SQLite connection behind an async mutex backs everything in this
//! crate; every public method is `async` and safe to call concurrently, with
//! actual disk I/O always happening on a blocking-pool thread.

mod db;
mod environments;
mod error;
mod queue;
mod sessions;
mod types;

pub use db::{Store, SCHEMA_VERSION};
pub use error::{Result, StoreError};
pub use types::{
    Author, EntryPayload, EnvironmentKind, EnvironmentRecord, EnvironmentSnapshot, Lane,
    MessageKind, NewSession, ParticipantKind, QueueItemState, QueueJournalAction,
    QueueJournalEntry, QueuePayload, QueuedItem, Session, ToolExecutionPhase, TranscriptEntry,
};
