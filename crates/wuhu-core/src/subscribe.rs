// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The gap-free subscribe protocol (spec §4.6): register a buffered
//! subscriber *before* reading anything from the store, so any event the
//! actor commits while we are still computing the backfill lands in the
//! subscriber's own buffer rather than being missed. The steps, in order:
//!
//! 1. Subscribe to the broadcast channel (buffers from this instant on).
//! 2. Read the store's current transcript/journal state.
//! 3. Package that read into a [`StablePatch`] and the cursor it reflects.
//! 4. Forward the buffered channel, dropping anything the patch already
//!    carries, so nothing is delivered twice and nothing is skipped.

use std::pin::Pin;

use futures::future::ready;
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use wuhu_store::{Lane, Store};
use wuhu_wire::subscribe::{Event, SessionStatus, StablePatch, VersionVector};

use crate::error::Result;
use crate::loop_::InflightTracker;
use crate::reducer::derive_status;

/// The actor's in-memory register state, which the store alone cannot
/// reconstruct a [`StablePatch`] from — status and the live model settings.
#[derive(Debug, Clone)]
pub struct RegisterSnapshot {
    pub status: SessionStatus,
    pub provider: String,
    pub model: String,
    pub reasoning_effort: Option<String>,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Subscribes to `session_id`, returning an immediate [`StablePatch`]
/// backfilling everything since `since`, plus a stream of subsequent events
/// with no gap and no duplicate relative to that patch.
pub async fn subscribe(
    store: &Store,
    events: &broadcast::Sender<Event>,
    inflight: &InflightTracker,
    session_id: &str,
    since: Option<VersionVector>,
    registers: RegisterSnapshot,
) -> Result<(StablePatch, EventStream)> {
    let since = since.unwrap_or_default();

    // Step 1: register before reading the store.
    let rx = events.subscribe();

    // Step 2: backfill.
    let transcript = store.get_entries(session_id, since.transcript_cursor, None).await?;
    let system_journal = lane_journal(store, session_id, Lane::System, since.system_lane_cursor).await?;
    let steer_journal = lane_journal(store, session_id, Lane::Steer, since.steer_lane_cursor).await?;
    let follow_up_journal = lane_journal(store, session_id, Lane::FollowUp, since.follow_up_lane_cursor).await?;

    // Step 3: the snapshot cursor is the furthest point the patch above
    // actually reflects — the last backfilled id per component, or the
    // caller's own cursor if nothing new existed for that component.
    let version = VersionVector {
        transcript_cursor: transcript.last().map(|e| e.id).or(since.transcript_cursor),
        system_lane_cursor: system_journal.last().map(|e| e.id).or(since.system_lane_cursor),
        steer_lane_cursor: steer_journal.last().map(|e| e.id).or(since.steer_lane_cursor),
        follow_up_lane_cursor: follow_up_journal.last().map(|e| e.id).or(since.follow_up_lane_cursor),
    };

    // The register status (spec §4.2) depends on the whole transcript, not
    // just the window backfilled above, so it is derived from a dedicated
    // full read rather than from `transcript`.
    let register_status = derive_status(&store.get_entries(session_id, None, None).await?);

    let patch = StablePatch {
        version,
        transcript,
        system_journal,
        steer_journal,
        follow_up_journal,
        status: registers.status,
        register_status,
    };

    // Step 4: forward the buffered channel, filtering out anything already
    // covered by `version`. `Err` (subscriber lagged and the channel
    // overwrote unread slots) is dropped rather than surfaced — a lagged
    // subscriber has no way to know what it missed except reconnecting with
    // its last-known version vector, which replays through the patch path
    // above again.
    let tail = BroadcastStream::new(rx)
        .filter_map(|r| ready(r.ok()))
        .filter(move |ev| ready(!already_in_patch(ev, &version)));

    let inflight_snapshot = inflight.lock().unwrap().clone().map(|(stream_id, accumulated_text)| Event::InflightSnapshot {
        stream_id: Some(stream_id),
        accumulated_text,
        status: registers.status,
    });

    let stream: EventStream = match inflight_snapshot {
        Some(ev) => Box::pin(futures::stream::once(ready(ev)).chain(tail)),
        None => Box::pin(tail),
    };

    Ok((patch, stream))
}

/// Backfills one lane's journal since `cursor`, then applies the
/// enqueue+materialize (or enqueue+cancel) collapsing rule (spec §4.6): if
/// an item's whole pending lifetime fits inside the window being backfilled,
/// the subscriber only sees its terminal record.
async fn lane_journal(
    store: &Store,
    session_id: &str,
    lane: Lane,
    cursor: Option<i64>,
) -> Result<Vec<wuhu_store::QueueJournalEntry>> {
    let all = store.queue_journal_since(session_id, cursor).await?;
    let filtered: Vec<_> = all.into_iter().filter(|e| e.lane == lane).collect();
    Ok(wuhu_queue::coalesce_entries(&filtered))
}

/// Whether `ev` advances a cursor already captured by `version` — i.e. the
/// initial [`StablePatch`] already carries it, so the streamed copy must be
/// dropped to avoid delivering it twice.
fn already_in_patch(ev: &Event, version: &VersionVector) -> bool {
    match ev {
        Event::TranscriptAppended { entry } => version.transcript_cursor.is_some_and(|c| entry.id <= c),
        Event::SystemQueueJournal { entry } => version.system_lane_cursor.is_some_and(|c| entry.id <= c),
        Event::SteerQueueJournal { entry } => version.steer_lane_cursor.is_some_and(|c| entry.id <= c),
        Event::FollowUpQueueJournal { entry } => version.follow_up_lane_cursor.is_some_and(|c| entry.id <= c),
        // Registers (`SettingsUpdated`/`StatusUpdated`) carry no cursor and
        // always reflect the latest value in the patch's `status` field, not
        // a replayable history; streaming/inflight events are never part of
        // a patch at all. Neither is ever filtered here.
        _ => false,
    }
}
