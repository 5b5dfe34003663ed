//! Relay ranking strategies for the query planner.
//!
//! The planner walks relays in the order a [`RelayRanker`] gives it and
//! greedily assigns uncovered authors. Two strategies are provided:
//!
//! - [`CoverageRanker`]: most candidate authors first, URL as tie-break.
//! - [`HealthAwareRanker`]: coverage weighted by the relay's quality score,
//!   so fast reliable relays win over slow or failing ones of similar reach.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use nostr::PublicKey;

use super::health::HealthTracker;
use super::scoring::{RelayStatsForScoring, compute_median, compute_score};

/// A relay together with the authors it could serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCandidate {
    /// Relay URL.
    pub url: String,
    /// Authors that list this relay (or were routed to it as a fallback).
    pub authors: Vec<PublicKey>,
}

impl RelayCandidate {
    /// Number of candidate authors.
    pub fn coverage(&self) -> usize {
        self.authors.len()
    }
}

/// Orders candidate relays for greedy selection.
pub trait RelayRanker: Send + Sync {
    /// Sort `candidates` best first. Must be deterministic.
    fn rank(&self, candidates: &mut [RelayCandidate]);

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

fn by_coverage(a: &RelayCandidate, b: &RelayCandidate) -> Ordering {
    b.coverage()
        .cmp(&a.coverage())
        .then_with(|| a.url.cmp(&b.url))
}

/// Ranks by candidate-author count descending, then URL ascending.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoverageRanker;

impl RelayRanker for CoverageRanker {
    fn rank(&self, candidates: &mut [RelayCandidate]) {
        candidates.sort_by(by_coverage);
    }

    fn name(&self) -> &'static str {
        "coverage"
    }
}

/// Ranks by coverage multiplied by the relay's quality score.
pub struct HealthAwareRanker {
    health: Arc<HealthTracker>,
}

impl HealthAwareRanker {
    pub fn new(health: Arc<HealthTracker>) -> Self {
        Self { health }
    }

    fn scores(&self, candidates: &[RelayCandidate]) -> HashMap<String, f64> {
        let stats: Vec<(String, RelayStatsForScoring)> = candidates
            .iter()
            .map(|c| {
                let stats = self
                    .health
                    .record(&c.url)
                    .map(|r| RelayStatsForScoring::from(&r))
                    .unwrap_or_default();
                (c.url.clone(), stats)
            })
            .collect();

        let mut latencies: Vec<f64> = stats
            .iter()
            .filter_map(|(_, s)| s.avg_latency_ms)
            .collect();
        let median = compute_median(&mut latencies);

        stats
            .into_iter()
            .map(|(url, s)| {
                let score = compute_score(&s, median);
                (url, score)
            })
            .collect()
    }
}

impl RelayRanker for HealthAwareRanker {
    fn rank(&self, candidates: &mut [RelayCandidate]) {
        let scores = self.scores(candidates);
        let weight = |c: &RelayCandidate| {
            c.coverage() as f64 * scores.get(&c.url).copied().unwrap_or(0.0)
        };

        candidates.sort_by(|a, b| {
            weight(b)
                .total_cmp(&weight(a))
                .then_with(|| by_coverage(a, b))
        });
    }

    fn name(&self) -> &'static str {
        "health-aware"
    }
}
