//! Timeout-bounded relay fan-out.
//!
//! The orchestrator takes a [`QueryPlan`] and asks each relay for its
//! assigned authors. Two modes share the same per-relay logic:
//!
//! - [`FetchOrchestrator::execute`] runs relays in sequential waves of
//!   `concurrency` and returns one merged [`FetchOutcome`].
//! - [`FetchOrchestrator::stream`] keeps up to `concurrency` relays in
//!   flight and hands every relay's new events to a callback as it arrives.
//!
//! Every relay races its own timeout, clamped to what is left of the global
//! budget. Dropping a timed-out fetch future cancels the request. Failures
//! and timeouts never abort the batch; they are recorded in the outcome and
//! in the [`HealthTracker`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use nostr::Event;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::outcome::{
    EventCollector, FetchOutcome, FetchTiming, StopReason, StreamChunk, StreamSummary,
};
use crate::fetcher::{EventFetcher, FeedFilter};
use crate::planner::{QueryPlan, QueryPlanEntry};
use crate::relay::HealthTracker;

/// Limits for one fetch.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Budget for a single relay.
    pub per_relay_timeout: Duration,
    /// Budget for the whole fetch.
    pub global_timeout: Duration,
    /// Relays queried at once.
    pub concurrency: usize,
    /// Unique events after which no further relays are started.
    pub target_event_count: usize,
    /// Relays that must have been queried before the target can stop a fetch.
    pub min_relays_before_early_stop: usize,
    /// Relays that are never queried, even if planned.
    pub blocked_relays: HashSet<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            per_relay_timeout: Duration::from_millis(2500),
            global_timeout: Duration::from_millis(5000),
            concurrency: 6,
            target_event_count: 300,
            min_relays_before_early_stop: 3,
            blocked_relays: HashSet::new(),
        }
    }
}

/// How a single relay request ended.
#[derive(Debug)]
enum RelayResult {
    Events(Vec<Event>),
    Failed(String),
    TimedOut,
}

#[derive(Debug)]
struct RelayReport {
    relay: String,
    result: RelayResult,
    latency: Duration,
}

/// What a streaming task did with its relay.
#[derive(Debug)]
enum StreamTask {
    Done(RelayReport),
    /// Started, then stopped by cancellation or early stop.
    Abandoned(String),
    /// Never started.
    NotStarted(String),
}

/// Runs query plans against relays.
pub struct FetchOrchestrator<F> {
    fetcher: Arc<F>,
    health: Arc<HealthTracker>,
}

impl<F: EventFetcher> FetchOrchestrator<F> {
    pub fn new(fetcher: Arc<F>, health: Arc<HealthTracker>) -> Self {
        Self { fetcher, health }
    }

    /// The health tracker outcomes are reported to.
    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    /// Run `plan` in waves and return the merged result.
    ///
    /// Before each wave the fetch stops if `cancel` fired, the global
    /// deadline passed, or the target event count was reached after at
    /// least `min_relays_before_early_stop` relays. Relays that never got a
    /// request are reported as skipped.
    pub async fn execute(
        &self,
        plan: &QueryPlan,
        template: &FeedFilter,
        options: &FetchOptions,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        let start = Instant::now();
        let deadline = start + options.global_timeout;

        let mut outcome = FetchOutcome {
            skipped_relays: plan.skipped_relays.clone(),
            ..Default::default()
        };
        let entries = runnable_entries(plan, options, &mut outcome.skipped_relays);
        let mut collector = EventCollector::default();
        let mut timed_out = false;
        let concurrency = options.concurrency.max(1);

        for (index, wave) in entries.chunks(concurrency).enumerate() {
            if let Some(reason) = stop_reason(
                cancel,
                deadline,
                collector.len(),
                outcome.queried_relays.len(),
                options,
            ) {
                outcome.stop_reason = Some(reason);
                outcome
                    .skipped_relays
                    .extend(entries[index * concurrency..].iter().map(|e| e.relay.clone()));
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let budget = options.per_relay_timeout.min(remaining);

            tracing::debug!(
                wave = index,
                relays = wave.len(),
                budget_ms = budget.as_millis() as u64,
                "starting fetch wave"
            );

            let mut tasks = JoinSet::new();
            for entry in wave {
                let fetcher = Arc::clone(&self.fetcher);
                let filter = template.for_authors(&entry.authors);
                let relay = entry.relay.clone();
                outcome.queried_relays.push(relay.clone());
                tasks.spawn(fetch_relay(fetcher, relay, filter, budget));
            }

            let cancelled = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tasks.abort_all();
                        break true;
                    }
                    joined = tasks.join_next() => match joined {
                        Some(Ok(report)) => {
                            timed_out |= matches!(report.result, RelayResult::TimedOut);
                            absorb(&self.health, report, &mut collector, &mut outcome.failed_relays);
                        }
                        Some(Err(e)) => tracing::warn!(error = %e, "relay fetch task failed"),
                        None => break false,
                    }
                }
            };

            if cancelled {
                outcome.stop_reason = Some(StopReason::Cancelled);
                outcome.skipped_relays.extend(
                    entries
                        .iter()
                        .skip((index + 1) * concurrency)
                        .map(|e| e.relay.clone()),
                );
                break;
            }
        }

        if outcome.stop_reason.is_none() && timed_out && Instant::now() >= deadline {
            outcome.stop_reason = Some(StopReason::GlobalTimeout);
        }
        outcome.stopped_early = outcome.stop_reason.is_some();

        if let Some(reason) = outcome.stop_reason {
            counter!("outbox_fetch_stopped_early_total", "reason" => reason.as_str()).increment(1);
        }

        outcome.events = collector.into_sorted();
        let fetch_ms = start.elapsed().as_millis() as u64;
        outcome.timing = FetchTiming {
            planning_ms: 0,
            fetch_ms,
            total_ms: fetch_ms,
        };

        tracing::info!(
            events = outcome.events.len(),
            queried = outcome.queried_relays.len(),
            failed = outcome.failed_relays.len(),
            skipped = outcome.skipped_relays.len(),
            stop_reason = outcome.stop_reason.map(|r| r.as_str()),
            fetch_ms,
            "fetch complete"
        );

        outcome
    }

    /// Run `plan` in the background, delivering results per relay.
    ///
    /// Returns as soon as the per-relay filters are built. `on_chunk` is
    /// called once for every relay that finished (with `complete = false` if
    /// it failed or timed out) and `on_complete` exactly once at the end.
    /// Once `cancel` fires no further chunks are delivered and no health is
    /// recorded.
    pub fn stream<C, D>(
        &self,
        plan: QueryPlan,
        template: FeedFilter,
        options: FetchOptions,
        cancel: CancellationToken,
        mut on_chunk: C,
        on_complete: D,
    ) -> JoinHandle<()>
    where
        C: FnMut(StreamChunk) + Send + 'static,
        D: FnOnce(StreamSummary) + Send + 'static,
    {
        let mut skipped = plan.skipped_relays.clone();
        let requests: Vec<(String, FeedFilter)> = runnable_entries(&plan, &options, &mut skipped)
            .into_iter()
            .map(|entry| (entry.relay.clone(), template.for_authors(&entry.authors)))
            .collect();

        let fetcher = Arc::clone(&self.fetcher);
        let health = Arc::clone(&self.health);

        tokio::spawn(async move {
            let start = Instant::now();
            let deadline = start + options.global_timeout;
            let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
            let stop = cancel.child_token();

            let mut tasks = JoinSet::new();
            for (relay, filter) in requests {
                let fetcher = Arc::clone(&fetcher);
                let semaphore = Arc::clone(&semaphore);
                let stop = stop.clone();
                let per_relay_timeout = options.per_relay_timeout;

                tasks.spawn(async move {
                    let permit = tokio::select! {
                        biased;
                        _ = stop.cancelled() => None,
                        permit = semaphore.acquire_owned() => permit.ok(),
                    };
                    let Some(_permit) = permit else {
                        return StreamTask::NotStarted(relay);
                    };

                    let now = Instant::now();
                    if stop.is_cancelled() || now >= deadline {
                        return StreamTask::NotStarted(relay);
                    }
                    let budget = per_relay_timeout.min(deadline - now);

                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => StreamTask::Abandoned(relay),
                        report = fetch_relay(fetcher, relay.clone(), filter, budget) => {
                            StreamTask::Done(report)
                        }
                    }
                });
            }

            let mut collector = EventCollector::default();
            let mut summary = StreamSummary {
                skipped_relays: skipped,
                ..Default::default()
            };
            let mut reported = 0usize;
            let mut timed_out = false;
            let mut not_started = false;
            let mut target_reached = false;

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(StreamTask::Done(report)) => {
                        summary.queried_relays.push(report.relay.clone());
                        if cancel.is_cancelled() {
                            continue;
                        }
                        timed_out |= matches!(report.result, RelayResult::TimedOut);

                        let relay = report.relay.clone();
                        let chunk =
                            match absorb(&health, report, &mut collector, &mut summary.failed_relays)
                            {
                                Some(events) => StreamChunk {
                                    relay,
                                    events,
                                    complete: true,
                                },
                                None => StreamChunk {
                                    relay,
                                    events: Vec::new(),
                                    complete: false,
                                },
                            };
                        on_chunk(chunk);
                        reported += 1;

                        if !stop.is_cancelled()
                            && collector.len() >= options.target_event_count
                            && reported >= options.min_relays_before_early_stop
                        {
                            target_reached = true;
                            stop.cancel();
                        }
                    }
                    Ok(StreamTask::Abandoned(relay)) => summary.queried_relays.push(relay),
                    Ok(StreamTask::NotStarted(relay)) => {
                        not_started = true;
                        summary.skipped_relays.push(relay);
                    }
                    Err(e) => tracing::warn!(error = %e, "relay stream task failed"),
                }
            }

            summary.stop_reason = if cancel.is_cancelled() {
                Some(StopReason::Cancelled)
            } else if target_reached {
                Some(StopReason::TargetReached)
            } else if Instant::now() >= deadline && (timed_out || not_started) {
                Some(StopReason::GlobalTimeout)
            } else {
                None
            };
            summary.stopped_early = summary.stop_reason.is_some();
            summary.total_events = collector.len();
            summary.fetch_ms = start.elapsed().as_millis() as u64;

            if let Some(reason) = summary.stop_reason {
                counter!("outbox_fetch_stopped_early_total", "reason" => reason.as_str())
                    .increment(1);
            }

            tracing::info!(
                events = summary.total_events,
                queried = summary.queried_relays.len(),
                failed = summary.failed_relays.len(),
                skipped = summary.skipped_relays.len(),
                stop_reason = summary.stop_reason.map(|r| r.as_str()),
                fetch_ms = summary.fetch_ms,
                "stream complete"
            );

            on_complete(summary);
        })
    }
}

/// Plan entries that may be queried, in priority order. Blocked entries are
/// moved to `skipped`.
fn runnable_entries<'a>(
    plan: &'a QueryPlan,
    options: &FetchOptions,
    skipped: &mut Vec<String>,
) -> Vec<&'a QueryPlanEntry> {
    let mut entries = Vec::with_capacity(plan.entries.len());
    for entry in &plan.entries {
        if options.blocked_relays.contains(&entry.relay) {
            tracing::debug!(relay = %entry.relay, "not querying blocked relay");
            skipped.push(entry.relay.clone());
        } else if !entry.authors.is_empty() {
            entries.push(entry);
        }
    }
    entries
}

fn stop_reason(
    cancel: &CancellationToken,
    deadline: Instant,
    unique_events: usize,
    queried: usize,
    options: &FetchOptions,
) -> Option<StopReason> {
    if cancel.is_cancelled() {
        Some(StopReason::Cancelled)
    } else if Instant::now() >= deadline {
        Some(StopReason::GlobalTimeout)
    } else if unique_events >= options.target_event_count
        && queried >= options.min_relays_before_early_stop
    {
        Some(StopReason::TargetReached)
    } else {
        None
    }
}

async fn fetch_relay<F: EventFetcher>(
    fetcher: Arc<F>,
    relay: String,
    filter: FeedFilter,
    budget: Duration,
) -> RelayReport {
    let started = Instant::now();
    let request = fetcher.fetch_events(filter, vec![relay.clone()], budget);
    let result = match tokio::time::timeout(budget, request).await {
        Ok(Ok(events)) => RelayResult::Events(events),
        Ok(Err(e)) => RelayResult::Failed(e.to_string()),
        Err(_) => RelayResult::TimedOut,
    };
    RelayReport {
        relay,
        result,
        latency: started.elapsed(),
    }
}

/// Fold one relay's report into the collector and the health tracker.
///
/// Returns the events not seen before, or `None` if the relay failed.
fn absorb(
    health: &HealthTracker,
    report: RelayReport,
    collector: &mut EventCollector,
    failed: &mut Vec<String>,
) -> Option<Vec<Event>> {
    histogram!("outbox_relay_fetch_duration_seconds").record(report.latency.as_secs_f64());

    match report.result {
        RelayResult::Events(events) => {
            let received = events.len();
            let fresh = collector.add(events);
            health.record_success(&report.relay, report.latency.as_millis() as u64);

            counter!("outbox_relay_fetches_total", "result" => "ok").increment(1);
            counter!("outbox_events_received_total").increment(received as u64);
            counter!("outbox_events_duplicate_total").increment((received - fresh.len()) as u64);
            tracing::debug!(
                relay = %report.relay,
                received,
                new = fresh.len(),
                latency_ms = report.latency.as_millis() as u64,
                "relay answered"
            );
            Some(fresh)
        }
        RelayResult::Failed(reason) => {
            health.record_failure(&report.relay);
            counter!("outbox_relay_fetches_total", "result" => "error").increment(1);
            tracing::debug!(relay = %report.relay, error = %reason, "relay fetch failed");
            failed.push(report.relay);
            None
        }
        RelayResult::TimedOut => {
            health.record_timeout(&report.relay);
            counter!("outbox_relay_fetches_total", "result" => "timeout").increment(1);
            tracing::debug!(relay = %report.relay, "relay fetch timed out");
            failed.push(report.relay);
            None
        }
    }
}
