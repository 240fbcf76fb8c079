// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "wuhu", version, about = "Local command surface for a wuhu session daemon")]
pub struct Cli {
    /// Path to an explicit config file, layered on top of the usual search path.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a new session.
    CreateSession {
        id: String,
        #[arg(long, default_value = "mock")]
        provider: String,
        #[arg(long, default_value = "mock-model")]
        model: String,
        #[arg(long)]
        reasoning_effort: Option<String>,
        #[arg(long, default_value = ".")]
        working_dir: String,
        #[arg(long)]
        system_prompt: Option<String>,
    },
    /// Enqueue a follow-up message on the `followUp` lane.
    Send {
        session: String,
        #[arg(long, default_value = "cli")]
        author: String,
        text: String,
    },
    /// Enqueue an interrupting message on the `steer` lane.
    Steer {
        session: String,
        #[arg(long, default_value = "cli")]
        author: String,
        text: String,
    },
    /// Cancel a pending queue item.
    Cancel {
        session: String,
        /// One of `steer`, `follow-up`, `system`.
        lane: String,
        id: String,
    },
    /// Change a session's model selection.
    SetModel {
        session: String,
        provider: String,
        model: String,
        #[arg(long)]
        reasoning_effort: Option<String>,
    },
    /// Interrupt a running session and repair any unterminated tool calls.
    Stop { session: String },
    /// Print the transcript as newline-delimited JSON.
    Transcript {
        session: String,
        /// Only print entries with id greater than this cursor.
        #[arg(long)]
        since: Option<i64>,
        /// Only print entries created after this RFC3339 timestamp.
        #[arg(long)]
        since_time: Option<chrono::DateTime<chrono::Utc>>,
    },
    /// Stream live events for a session until interrupted.
    Subscribe { session: String },
    /// List all known sessions.
    ListSessions,
}
