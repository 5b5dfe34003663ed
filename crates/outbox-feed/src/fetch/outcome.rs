//! Results reported by the fetch orchestrator.

use std::collections::HashSet;

use nostr::{Event, EventId};

/// Why a fetch stopped before querying every planned relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Enough unique events arrived from enough relays.
    TargetReached,
    /// The global deadline passed.
    GlobalTimeout,
    /// The operation was cancelled or superseded.
    Cancelled,
}

impl StopReason {
    /// String representation for logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::TargetReached => "target_reached",
            StopReason::GlobalTimeout => "global_timeout",
            StopReason::Cancelled => "cancelled",
        }
    }
}

/// Phase timings in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchTiming {
    /// Follow and relay list resolution plus planning.
    pub planning_ms: u64,
    /// Relay fan-out.
    pub fetch_ms: u64,
    /// Everything.
    pub total_ms: u64,
}

/// Result of a wait-for-all fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    /// Unique events, newest first.
    pub events: Vec<Event>,
    /// Relays a request was sent to.
    pub queried_relays: Vec<String>,
    /// Relays that were planned or considered but never queried.
    pub skipped_relays: Vec<String>,
    /// Relays that failed or timed out.
    pub failed_relays: Vec<String>,
    /// Phase timings.
    pub timing: FetchTiming,
    /// True if the fetch was cut short (see `stop_reason`).
    pub stopped_early: bool,
    /// Why the fetch stopped early, if it did.
    pub stop_reason: Option<StopReason>,
}

impl FetchOutcome {
    /// Relays that answered.
    pub fn succeeded_relays(&self) -> Vec<&str> {
        self.queried_relays
            .iter()
            .filter(|r| !self.failed_relays.contains(r))
            .map(String::as_str)
            .collect()
    }
}

/// One relay's contribution to a streamed fetch.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    /// The relay that answered.
    pub relay: String,
    /// Events from this relay not seen in any earlier chunk.
    pub events: Vec<Event>,
    /// False when the relay failed or timed out.
    pub complete: bool,
}

/// Final report of a streamed fetch, delivered exactly once.
#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    /// Unique events delivered across all chunks.
    pub total_events: usize,
    /// Relays a request was sent to.
    pub queried_relays: Vec<String>,
    /// Relays that were never queried.
    pub skipped_relays: Vec<String>,
    /// Relays that failed or timed out.
    pub failed_relays: Vec<String>,
    /// Time from start to completion in milliseconds.
    pub fetch_ms: u64,
    /// True if the fetch was cut short (see `stop_reason`).
    pub stopped_early: bool,
    /// Why the fetch stopped early, if it did.
    pub stop_reason: Option<StopReason>,
}

/// First-wins deduplication by event id.
#[derive(Debug, Default)]
pub(crate) struct EventCollector {
    seen: HashSet<EventId>,
    events: Vec<Event>,
}

impl EventCollector {
    /// Add `events`, returning the ones not seen before.
    pub(crate) fn add(&mut self, events: Vec<Event>) -> Vec<Event> {
        let mut fresh = Vec::with_capacity(events.len());
        for event in events {
            if self.seen.insert(event.id) {
                fresh.push(event);
            }
        }
        self.events.extend(fresh.iter().cloned());
        fresh
    }

    /// Number of unique events so far.
    pub(crate) fn len(&self) -> usize {
        self.seen.len()
    }

    /// All unique events, newest first with id as tie-break.
    pub(crate) fn into_sorted(mut self) -> Vec<Event> {
        self.events
            .sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        self.events
    }
}
