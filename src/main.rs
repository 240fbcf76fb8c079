// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! A thin local command surface over [`wuhu_core::SessionRegistry`] for
//! manual operation and integration testing. This is not the transport
//! layer — no HTTP, WebSocket, or TUI front end lives here, only a
//! one-shot-per-invocation CLI that opens the store, runs one command, and
//! exits.

mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use wuhu_core::{SessionRegistry, StaticResolver};
use wuhu_store::{Author, EnvironmentKind, EnvironmentSnapshot, Lane, NewSession, ParticipantKind, Store};
use wuhu_tools::ToolRegistry;
use wuhu_wire::codec::encode_json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = wuhu_config::load(cli.config.as_deref()).context("loading configuration")?;
    init_logging(&config.log.filter);

    let store = Arc::new(Store::open(&config.store.path).await.context("opening store")?);
    let mut tools = ToolRegistry::new();
    tools.register(wuhu_tools::builtin::read_file::ReadFileTool);
    tools.register(wuhu_tools::builtin::shell::ShellTool::default());
    let tools = Arc::new(tools);

    // No vendor inference backend is wired into this binary — dispatching a
    // request to a concrete provider's wire protocol is an external
    // collaborator's concern (see `wuhu_model::ModelProvider`'s doc
    // comment). `MockProvider` lets the command surface exercise the full
    // session-actor and agentic-loop path end to end without one.
    let resolver = Arc::new(StaticResolver::new(Arc::new(wuhu_model::MockProvider)));
    let registry = Arc::new(SessionRegistry::new(Arc::clone(&store), tools, resolver, config.compaction.clone(), config.retry.clone()));

    run_command(cli.command, registry, store).await
}

fn init_logging(filter: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

async fn run_command(command: Commands, registry: Arc<SessionRegistry>, store: Arc<Store>) -> anyhow::Result<()> {
    match command {
        Commands::CreateSession { id, provider, model, reasoning_effort, working_dir, system_prompt } => {
            let actor = registry
                .create_session(NewSession {
                    id,
                    provider,
                    model,
                    reasoning_effort,
                    parent_session_id: None,
                    working_dir: working_dir.clone(),
                    environment: EnvironmentSnapshot { name: "default".into(), kind: EnvironmentKind::Local, path: working_dir, template_path: None, startup_script: None },
                    system_prompt,
                })
                .await?;
            println!("created session {}", actor.session_id());
        }
        Commands::Send { session, author, text } => {
            let actor = registry.get_or_load(&session).await?;
            let id = actor.enqueue(Lane::FollowUp, Author::Participant { id: author, kind: ParticipantKind::Human }, serde_json::json!(text)).await?;
            println!("enqueued {id}");
        }
        Commands::Steer { session, author, text } => {
            let actor = registry.get_or_load(&session).await?;
            let id = actor.enqueue(Lane::Steer, Author::Participant { id: author, kind: ParticipantKind::Human }, serde_json::json!(text)).await?;
            println!("enqueued {id}");
        }
        Commands::Cancel { session, lane, id } => {
            let actor = registry.get_or_load(&session).await?;
            actor.cancel(parse_lane(&lane)?, &id).await?;
            println!("canceled {id}");
        }
        Commands::SetModel { session, provider, model, reasoning_effort } => {
            let actor = registry.get_or_load(&session).await?;
            let outcome = actor.set_model(provider, model, reasoning_effort).await?;
            println!("applied={} provider={} model={}", outcome.applied, outcome.provider, outcome.model);
        }
        Commands::Stop { session } => {
            let actor = registry.get_or_load(&session).await?;
            let outcome = actor.stop().await?;
            println!("stop entry appended: {}, wrote {} repair entries", outcome.stop_entry.is_some(), outcome.repaired_entries.len());
        }
        Commands::Transcript { session, since, since_time } => {
            let actor = registry.get_or_load(&session).await?;
            let entries = actor.get_transcript(since, since_time).await?;
            for entry in &entries {
                println!("{}", encode_json(entry)?);
            }
        }
        Commands::Subscribe { session } => {
            let actor = registry.get_or_load(&session).await?;
            let (patch, mut stream) = actor.subscribe(None).await?;
            println!(
                "# backfill: {} transcript entries, status={:?}, register_status={:?}",
                patch.transcript.len(),
                patch.status,
                patch.register_status
            );
            while let Some(event) = futures::StreamExt::next(&mut stream).await {
                println!("{}", encode_json(&event)?);
            }
        }
        Commands::ListSessions => {
            for session in store.list_sessions().await? {
                println!("{}\t{}/{}", session.id, session.provider, session.model);
            }
        }
    }
    Ok(())
}

fn parse_lane(s: &str) -> anyhow::Result<Lane> {
    match s {
        "steer" => Ok(Lane::Steer),
        "follow-up" | "followup" => Ok(Lane::FollowUp),
        "system" => Ok(Lane::System),
        other => anyhow::bail!("unknown lane: {other}"),
    }
}
