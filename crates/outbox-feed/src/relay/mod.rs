//! Relay health tracking and relay selection.
//!
//! This module keeps in-memory health state for every relay the engine
//! queries and turns it into a ranking the query planner can use.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HealthTracker                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  - Fed success / failure / timeout by the fetch orchestrator    │
//! │  - Classifies relays as healthy, degraded or dead               │
//! │  - Excludes dead relays until their cooldown passes             │
//! └─────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          RelayRanker                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  CoverageRanker     most candidate authors first                │
//! │  HealthAwareRanker  coverage x quality score                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use outbox_feed::relay::{HealthAwareRanker, HealthConfig, HealthTracker};
//!
//! let health = Arc::new(HealthTracker::new(HealthConfig::default()));
//!
//! // Report outcomes as fetches finish
//! health.record_success("wss://relay.example.com", 180);
//! health.record_timeout("wss://slow.example.com");
//!
//! // Plan only with relays that are worth a connection
//! let usable = health.filter_healthy_relays(&candidates);
//! let ranker = HealthAwareRanker::new(Arc::clone(&health));
//! ```

mod health;
mod scoring;
mod selector;

pub use health::{HealthConfig, HealthState, HealthStats, HealthTracker, RelayHealthRecord};
pub use scoring::{RelayStatsForScoring, compute_score};
pub use selector::{CoverageRanker, HealthAwareRanker, RelayCandidate, RelayRanker};
