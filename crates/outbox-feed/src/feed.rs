//! The outbox feed service.
//!
//! [`OutboxFeed`] owns the caches, the health tracker, the planner and the
//! orchestrator, and runs the whole pipeline for one user:
//!
//! ```text
//! follows ──▶ relay lists ──▶ plan ──▶ fetch ──▶ FeedResult
//!                               ▲         │
//!                               └─health◀─┘
//! ```
//!
//! Every call takes a new generation. Starting a call cancels the one before
//! it, and a call that was superseded returns [`FeedResult::Superseded`]
//! instead of publishing its (partial) result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use metrics::counter;
use nostr::PublicKey;
use outbox_core::{FollowEntry, RelayConfig};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{FollowListResolver, RelayListCache, SnapshotStore};
use crate::clock::{Clock, SystemClock};
use crate::config::OutboxConfig;
use crate::fetch::{
    FetchOrchestrator, FetchOutcome, FetchTiming, GenerationTicket, Generations, StopReason,
    StreamChunk, StreamSummary,
};
use crate::fetcher::{EventFetcher, FeedFilter};
use crate::planner::{QueryPlan, QueryPlanner};
use crate::relay::{CoverageRanker, HealthAwareRanker, HealthTracker, RelayRanker};

/// Result of a feed fetch.
#[derive(Debug, Clone)]
pub enum FeedResult {
    /// The fetch is the latest one and its outcome was published.
    Current(Arc<FetchOutcome>),
    /// A newer fetch started before this one finished.
    Superseded {
        /// Generation of the superseded fetch.
        generation: u64,
    },
}

impl FeedResult {
    /// The outcome, if this fetch is current.
    pub fn outcome(&self) -> Option<&FetchOutcome> {
        match self {
            FeedResult::Current(outcome) => Some(outcome.as_ref()),
            FeedResult::Superseded { .. } => None,
        }
    }

    /// True if a newer fetch replaced this one.
    pub fn is_superseded(&self) -> bool {
        matches!(self, FeedResult::Superseded { .. })
    }
}

/// Everything resolved before fetching.
struct Prepared {
    plan: QueryPlan,
    planning_ms: u64,
}

/// Outbox-model feed service.
pub struct OutboxFeed<F> {
    config: OutboxConfig,
    follows: FollowListResolver<F>,
    relay_lists: RelayListCache<F>,
    planner: QueryPlanner,
    health: Arc<HealthTracker>,
    orchestrator: FetchOrchestrator<F>,
    generations: Arc<Generations>,
    latest: Mutex<Option<(u64, Arc<FetchOutcome>)>>,
}

impl<F: EventFetcher> OutboxFeed<F> {
    /// Build the service with the system clock.
    pub fn new(config: OutboxConfig, fetcher: Arc<F>, store: Arc<dyn SnapshotStore>) -> Self {
        Self::with_clock(config, fetcher, store, Arc::new(SystemClock))
    }

    /// Build the service with an explicit clock for cache TTLs and health
    /// cooldowns.
    pub fn with_clock(
        config: OutboxConfig,
        fetcher: Arc<F>,
        store: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let health = Arc::new(HealthTracker::with_clock(
            config.health_config(),
            Arc::clone(&clock),
        ));

        Self {
            follows: FollowListResolver::new(config.follow_list_config(), Arc::clone(&fetcher)),
            relay_lists: RelayListCache::new(
                config.relay_list_config(),
                Arc::clone(&fetcher),
                store,
                clock,
            ),
            planner: QueryPlanner::new(config.plan_options()),
            orchestrator: FetchOrchestrator::new(fetcher, Arc::clone(&health)),
            health,
            generations: Arc::new(Generations::new()),
            latest: Mutex::new(None),
            config,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// The relay health tracker.
    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    /// The relay list cache.
    pub fn relay_lists(&self) -> &RelayListCache<F> {
        &self.relay_lists
    }

    /// The follow list resolver.
    pub fn follows(&self) -> &FollowListResolver<F> {
        &self.follows
    }

    /// The latest generation issued.
    pub fn generation(&self) -> u64 {
        self.generations.current()
    }

    /// The most recently published outcome and its generation.
    pub fn latest(&self) -> Option<(u64, Arc<FetchOutcome>)> {
        self.latest.lock().clone()
    }

    /// Cancel whatever fetch is in progress.
    pub fn cancel(&self) {
        self.generations.cancel_current();
    }

    /// Fetch `user`'s feed and wait for the merged result.
    ///
    /// `template` supplies kinds, time range and limit; authors are filled in
    /// per relay from the plan.
    pub async fn fetch_feed(&self, user: &PublicKey, template: FeedFilter) -> FeedResult {
        let ticket = self.generations.begin();
        let start = Instant::now();

        tracing::debug!(generation = ticket.generation, user = %user, "fetching feed");

        let Some(prepared) = self.prepare(user, &ticket, start).await else {
            return self.superseded(ticket.generation);
        };

        let mut outcome = if prepared.plan.is_empty() {
            FetchOutcome::default()
        } else {
            self.orchestrator
                .execute(
                    &prepared.plan,
                    &template,
                    &self.config.fetch_options(),
                    &ticket.cancel,
                )
                .await
        };

        let total_ms = start.elapsed().as_millis() as u64;
        outcome.timing = FetchTiming {
            planning_ms: prepared.planning_ms,
            fetch_ms: outcome.timing.fetch_ms,
            total_ms,
        };

        self.publish(&ticket, outcome)
    }

    /// Fetch `user`'s feed, delivering events per relay as they arrive.
    ///
    /// Resolution and planning happen before this returns; the fan-out runs
    /// in the background. `on_complete` is called exactly once, also when
    /// nothing needs fetching or the call is superseded during resolution
    /// (then with [`StopReason::Cancelled`]). Chunks from a superseded
    /// generation are dropped.
    pub async fn stream_feed<C, D>(
        &self,
        user: &PublicKey,
        template: FeedFilter,
        mut on_chunk: C,
        on_complete: D,
    ) -> Option<JoinHandle<()>>
    where
        C: FnMut(StreamChunk) + Send + 'static,
        D: FnOnce(StreamSummary) + Send + 'static,
    {
        let ticket = self.generations.begin();
        let start = Instant::now();

        let Some(prepared) = self.prepare(user, &ticket, start).await else {
            counter!("outbox_feed_superseded_total").increment(1);
            on_complete(StreamSummary {
                stopped_early: true,
                stop_reason: Some(StopReason::Cancelled),
                ..Default::default()
            });
            return None;
        };

        if prepared.plan.is_empty() {
            on_complete(StreamSummary::default());
            return None;
        }

        let generations = Arc::clone(&self.generations);
        let generation = ticket.generation;
        let handle = self.orchestrator.stream(
            prepared.plan,
            template,
            self.config.fetch_options(),
            ticket.cancel,
            move |chunk| {
                if generations.is_current(generation) {
                    on_chunk(chunk);
                }
            },
            on_complete,
        );
        Some(handle)
    }

    /// Resolve follows and relay lists and build a plan. `None` if the
    /// ticket was cancelled on the way.
    async fn prepare(
        &self,
        user: &PublicKey,
        ticket: &GenerationTicket,
        start: Instant,
    ) -> Option<Prepared> {
        let follows = unless_cancelled(&ticket.cancel, self.follows.resolve(user, false)).await?;

        if follows.is_empty() {
            tracing::info!(user = %user, "no follows, nothing to fetch");
            return Some(Prepared {
                plan: QueryPlan::default(),
                planning_ms: start.elapsed().as_millis() as u64,
            });
        }

        let authors: Vec<PublicKey> = follows.iter().map(|f| f.author).collect();
        let configs = unless_cancelled(
            &ticket.cancel,
            self.relay_lists.resolve_many(&authors, false),
        )
        .await?;

        let plan = self.plan(&follows, &configs);
        Some(Prepared {
            plan,
            planning_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Build a plan with the configured ranker, excluding relays the health
    /// tracker considers ineligible.
    pub fn plan(
        &self,
        follows: &[FollowEntry],
        configs: &HashMap<PublicKey, RelayConfig>,
    ) -> QueryPlan {
        let ranker: Box<dyn RelayRanker> = if self.config.adaptive {
            Box::new(HealthAwareRanker::new(Arc::clone(&self.health)))
        } else {
            Box::new(CoverageRanker)
        };
        let is_usable = |url: &str| self.health.is_eligible(url);
        let plan = self.planner.plan(follows, configs, ranker.as_ref(), &is_usable);
        for entry in &plan.entries {
            if self.health.is_recovery_due(&entry.relay) {
                tracing::info!(relay = %entry.relay, "probing dead relay after cooldown");
            }
        }
        plan
    }

    fn publish(&self, ticket: &GenerationTicket, outcome: FetchOutcome) -> FeedResult {
        let mut latest = self.latest.lock();
        if ticket.cancel.is_cancelled() || !self.generations.is_current(ticket.generation) {
            drop(latest);
            return self.superseded(ticket.generation);
        }

        let outcome = Arc::new(outcome);
        *latest = Some((ticket.generation, Arc::clone(&outcome)));
        FeedResult::Current(outcome)
    }

    fn superseded(&self, generation: u64) -> FeedResult {
        counter!("outbox_feed_superseded_total").increment(1);
        tracing::debug!(generation, "feed fetch superseded");
        FeedResult::Superseded { generation }
    }
}

async fn unless_cancelled<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        value = work => Some(value),
    }
}
