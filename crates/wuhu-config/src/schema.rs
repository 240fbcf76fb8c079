// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Top-level process configuration, merged from the layered YAML search
/// path (see `loader::load`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub retry: LoopConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Where the durable store keeps its SQLite file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file. `:memory:` opens an in-memory
    /// database (used by tests and single-shot CLI invocations).
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: "wuhu.sqlite3".to_string() }
    }
}

/// Logging configuration consumed by the `wuhu` binary at process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive string, e.g. "wuhu=debug,info".
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { filter: "info".to_string() }
    }
}

/// Compaction trigger and budget tuning, matching the `(cached_input + input +
/// output + compaction_buffer) > context_limit` trigger shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Total context window budget a provider/model pair exposes.
    pub context_window_tokens: usize,
    /// Tokens reserved for the model's own reply plus tool-schema overhead,
    /// subtracted from `context_window_tokens` before the trigger fires.
    pub reserve_tokens: usize,
    /// Tokens of raw transcript kept verbatim after the cut point, walking
    /// backwards from the newest entry in the projection.
    pub keep_recent_tokens: usize,
    /// Extra headroom added to the usage total before comparing against
    /// `context_window_tokens - reserve_tokens`.
    pub compaction_buffer: usize,
    /// Token cap applied to an individual tool result before it is
    /// materialized into the transcript (via `wuhu_compact::smart_truncate`).
    pub tool_result_token_cap: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            context_window_tokens: 128_000,
            reserve_tokens: 8_000,
            keep_recent_tokens: 4_000,
            compaction_buffer: 2_000,
            tool_result_token_cap: 4_000,
        }
    }
}

/// Inference retry/backoff policy, read by the agentic loop instead of
/// inlining constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_retries: u32,
    /// Fraction of the computed backoff to randomize, in `[0.0, 1.0]`.
    pub jitter_fraction: f64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_retries: 5,
            jitter_fraction: 0.2,
        }
    }
}

/// Tool-approval pattern configuration (glob patterns matched against a
/// tool's shell-like command string).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    pub auto_approve_patterns: Vec<String>,
    pub deny_patterns: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            auto_approve_patterns: vec!["ls *".into(), "cat *".into(), "ls".into()],
            deny_patterns: vec!["rm -rf /*".into()],
        }
    }
}

/// The kind of environment snapshot captured immutably at session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    /// A plain local working-directory checkout; no template/startup script.
    Local,
    /// A materialized workspace copied from a template directory.
    Template,
    /// A container or remote sandbox; `path` is an opaque handle.
    Sandbox,
}

/// Canonical environment definition, referenced by id or unique name.
/// Workspace materialization (copying the template, running the startup
/// script) is an external collaborator concern; this type only carries the
/// configuration the core snapshots immutably into each session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    pub name: String,
    pub kind: EnvironmentKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_script: Option<String>,
}

/// Reasoning-effort hint forwarded to providers that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// Per-session creation parameters, consumed at `createSession` time by the
/// transport skin (out of scope) and handed to the core unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSpec {
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
