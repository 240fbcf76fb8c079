// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::Local;

/// Optional overrides and extra context injected into the system prompt for
/// one session. Workspace materialization (project root detection, git/CI
/// context, skills and subagent discovery) is an external collaborator's
/// concern; this struct only carries what the agentic loop itself needs.
#[derive(Debug, Default)]
pub struct PromptContext<'a> {
    /// Replaces the entire default system prompt when set.
    pub system_prompt_override: Option<&'a str>,
    /// Appended verbatim after the default Guidelines section (or after
    /// `system_prompt_override`, if also set).
    pub append_system_prompt: Option<&'a str>,
}

// ─── Guidelines module ───────────────────────────────────────────────────────

mod guidelines {
    pub fn general() -> &'static str {
        "- Be concise and precise. Use tools instead of guessing.\n\
         - Verify assumptions about file contents and command behavior before acting on them."
    }

    pub fn tool_usage() -> &'static str {
        "- Prefer the narrowest tool that gets the job done over a shell one-liner.\n\
         - Batch independent tool calls in parallel to reduce turn count.\n\
         - Read enough of a file to understand the surrounding context before editing it."
    }

    pub fn code_quality() -> &'static str {
        "- Keep changes scoped to what was asked; do not refactor unrelated code.\n\
         - Write tests for new functionality when the project has a test suite.\n\
         - Preserve existing code structure and style conventions."
    }

    pub fn error_handling() -> &'static str {
        "- When a tool call fails, diagnose the cause before retrying — do not repeat an \
           identical failing call.\n\
         - Never bypass safety checks (force-push, --no-verify, skipping hooks) without \
           explicit user permission."
    }
}

fn build_guidelines_section() -> String {
    format!(
        "## Guidelines\n\n\
         ### General Principles\n\
         {}\n\n\
         ### Tool Usage\n\
         {}\n\n\
         ### Code Quality\n\
         {}\n\n\
         ### Error Handling\n\
         {}",
        guidelines::general(),
        guidelines::tool_usage(),
        guidelines::code_quality(),
        guidelines::error_handling(),
    )
}

/// Build the system prompt for a session's agentic loop.
pub fn system_prompt(ctx: PromptContext<'_>) -> String {
    if let Some(custom) = ctx.system_prompt_override {
        return match ctx.append_system_prompt {
            Some(extra) => format!("{}\n\n{}", custom.trim_end(), extra),
            None => custom.to_string(),
        };
    }

    let agent_identity = format!(
        "You are a coding agent running inside a long-lived session managed by a daemon.\n\n\
         Current date and time: `{current_date_time}`\n\n\
         You can read and write files, run shell commands, and call the tools made available to \
         you. Work systematically, verify your changes, and report your progress clearly.\n\
         Always finish the task the user asked for before ending your turn.",
        current_date_time = Local::now().format("%Y-%m-%d %H:%M:%S"),
    );

    let guidelines_section = build_guidelines_section();

    let append_section = match ctx.append_system_prompt {
        Some(extra) => format!("\n\n{extra}"),
        None => String::new(),
    };

    format!("{agent_identity}\n\n{guidelines_section}{append_section}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
