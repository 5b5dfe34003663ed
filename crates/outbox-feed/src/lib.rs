//! Outbox-model feed fetching for Nostr.
//!
//! Instead of asking every relay for every followed author, this crate finds
//! out where each author actually writes (their NIP-65 relay list), picks a
//! small set of relays that covers everyone, and fetches from exactly those
//! relays under strict latency budgets.
//!
//! # Modules
//!
//! - [`cache`] - Follow list resolver, relay list cache and snapshot stores
//! - [`relay`] - Relay health tracking and ranking strategies
//! - [`planner`] - Greedy covering-set query planner
//! - [`fetch`] - Wave-based and streaming fan-out, generations
//! - [`feed`] - The [`OutboxFeed`] service wiring it all together
//! - [`fetcher`] - The [`EventFetcher`] seam over a nostr-sdk client
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │ FollowListResolver  │  kind 3, moka cache (5 min)
//! └──────────┬──────────┘
//!            │ authors
//!            ▼
//! ┌─────────────────────┐
//! │   RelayListCache    │  kind 10002, TTL 30 min, SQLite snapshot
//! └──────────┬──────────┘
//!            │ author -> write relays
//!            ▼
//! ┌─────────────────────┐      ┌─────────────────┐
//! │    QueryPlanner     │◀─────│  HealthTracker  │  eligibility + ranking
//! └──────────┬──────────┘      └────────▲────────┘
//!            │ relay -> authors         │ success / failure / timeout
//!            ▼                          │
//! ┌─────────────────────┐               │
//! │  FetchOrchestrator  │───────────────┘
//! └──────────┬──────────┘
//!            │ deduplicated events, newest first
//!            ▼
//!        FeedResult
//! ```
//!
//! Relay fetch failures never surface as errors: the worst case is a thinner
//! feed, with the shortfall explained by the outcome's failed and skipped
//! relays.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod fetcher;
pub mod planner;
pub mod relay;

#[cfg(test)]
mod testing;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use cache::{
    FollowListConfig, FollowListResolver, MemorySnapshotStore, RelayListCache,
    RelayListCacheConfig, SnapshotStore, SqliteSnapshotStore,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OutboxConfig;
pub use feed::{FeedResult, OutboxFeed};
pub use fetch::{
    FetchOptions, FetchOrchestrator, FetchOutcome, FetchTiming, GenerationTicket, Generations,
    StopReason, StreamChunk, StreamSummary,
};
pub use fetcher::{EventFetcher, FeedFilter, NostrFetcher};
pub use planner::{PlanOptions, QueryPlan, QueryPlanEntry, QueryPlanner};
pub use relay::{
    CoverageRanker, HealthAwareRanker, HealthConfig, HealthState, HealthTracker, RelayCandidate,
    RelayHealthRecord, RelayRanker,
};
