//! Covering-set query planning.
//!
//! Given who the user follows and where each of them writes, the planner
//! picks a small set of relays that together cover every author, and
//! assigns each author to exactly one of them.
//!
//! # Algorithm
//!
//! ```text
//! 1. candidates per author   write relays (usable, unblocked, first N)
//!                            else relay hints, else "needs fallback"
//! 2. relay -> authors        fallback authors go to every fallback relay
//! 3. rank relays             RelayRanker (coverage, or coverage x health)
//! 4. greedy walk             take each relay's still-uncovered authors;
//!                            too few -> defer; cap reached -> skip
//! 5. backfill                deferred relays, most uncovered first,
//!                            while the relay cap allows
//! ```
//!
//! Greedy set cover is a log-factor approximation of the optimum, which is
//! plenty for follow lists of a few thousand authors.

use std::collections::{BTreeMap, HashMap, HashSet};

use metrics::{counter, gauge};
use nostr::PublicKey;
use outbox_core::{
    FollowEntry, NormalizeOptions, RelayConfig, normalize_relay_list, normalize_relay_url_with_opts,
};

use crate::relay::{RelayCandidate, RelayRanker};

/// Planner limits and relay lists.
#[derive(Debug, Clone)]
pub struct PlanOptions {
    /// Maximum number of relays in a plan.
    pub max_relays: usize,
    /// Maximum authors assigned to one relay.
    pub max_authors_per_relay: usize,
    /// Relays that would cover fewer new authors than this are deferred.
    pub min_authors_per_relay: usize,
    /// How many of an author's write relays are considered.
    pub max_relays_per_author: usize,
    /// Relays used for authors without any usable relay.
    pub fallback_relays: Vec<String>,
    /// Relays that are never planned.
    pub blocked_relays: HashSet<String>,
    /// How fallback and blocked relay URLs are normalized.
    pub normalize: NormalizeOptions,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            max_relays: 15,
            max_authors_per_relay: 50,
            min_authors_per_relay: 3,
            max_relays_per_author: 2,
            fallback_relays: outbox_core::DEFAULT_FALLBACK_RELAYS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            blocked_relays: HashSet::new(),
            normalize: NormalizeOptions::default(),
        }
    }
}

/// One relay and the authors to request from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlanEntry {
    /// Relay URL.
    pub relay: String,
    /// Authors assigned to this relay. Disjoint from every other entry.
    pub authors: Vec<PublicKey>,
    /// Selection order, 0 first.
    pub priority: usize,
}

/// Result of planning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPlan {
    /// Selected relays in priority order.
    pub entries: Vec<QueryPlanEntry>,
    /// Relays left out only because the relay cap was reached.
    pub skipped_relays: Vec<String>,
}

impl QueryPlan {
    /// True when there is nothing to fetch.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of selected relays.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Selected relay URLs in priority order.
    pub fn relays(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.relay.as_str()).collect()
    }

    /// Number of authors covered.
    pub fn author_count(&self) -> usize {
        self.entries.iter().map(|e| e.authors.len()).sum()
    }
}

/// Builds query plans.
#[derive(Debug, Clone)]
pub struct QueryPlanner {
    options: PlanOptions,
}

impl QueryPlanner {
    /// Create a planner. Fallback and blocked URLs are normalized so they
    /// compare equal to the normalized URLs in relay configs.
    pub fn new(mut options: PlanOptions) -> Self {
        let opts = options.normalize.clone();
        options.blocked_relays = options
            .blocked_relays
            .iter()
            .flat_map(|url| {
                let normalized = normalize_relay_url_with_opts(url, &opts).ok();
                std::iter::once(url.clone()).chain(normalized)
            })
            .collect();

        options.fallback_relays =
            normalize_relay_list(options.fallback_relays.iter().map(String::as_str), &opts);

        Self { options }
    }

    /// Get the options.
    pub fn options(&self) -> &PlanOptions {
        &self.options
    }

    /// Whether `url` is on the blocklist.
    pub fn is_blocked(&self, url: &str) -> bool {
        self.options.blocked_relays.contains(url)
    }

    /// Build a plan covering `follows`.
    ///
    /// `is_usable` is consulted for every relay (typically the health
    /// tracker's eligibility check); relays it rejects are treated like
    /// blocked ones.
    pub fn plan(
        &self,
        follows: &[FollowEntry],
        configs: &HashMap<PublicKey, RelayConfig>,
        ranker: &dyn RelayRanker,
        is_usable: &dyn Fn(&str) -> bool,
    ) -> QueryPlan {
        if follows.is_empty() {
            return QueryPlan::default();
        }

        let opts = &self.options;
        let allowed = |url: &str| !self.is_blocked(url) && is_usable(url);

        // Step 1 and 2: candidate relays per author, inverted to relay -> authors.
        let mut by_relay: BTreeMap<String, Vec<PublicKey>> = BTreeMap::new();
        let mut needs_fallback = Vec::new();
        let mut seen_authors = HashSet::with_capacity(follows.len());

        for follow in follows {
            if !seen_authors.insert(follow.author) {
                continue;
            }

            let write_relays = configs
                .get(&follow.author)
                .map(|c| c.write_relays.as_slice())
                .unwrap_or_default();

            let mut candidates: Vec<&str> = write_relays
                .iter()
                .map(String::as_str)
                .filter(|url| allowed(url))
                .take(opts.max_relays_per_author)
                .collect();

            if candidates.is_empty() {
                candidates = follow
                    .relay_hints
                    .iter()
                    .map(String::as_str)
                    .filter(|url| allowed(url))
                    .take(opts.max_relays_per_author)
                    .collect();
            }

            if candidates.is_empty() {
                needs_fallback.push(follow.author);
                continue;
            }

            for url in candidates {
                by_relay.entry(url.to_string()).or_default().push(follow.author);
            }
        }

        if !needs_fallback.is_empty() {
            let fallbacks: Vec<&String> = opts
                .fallback_relays
                .iter()
                .filter(|url| allowed(url))
                .collect();

            if fallbacks.is_empty() {
                tracing::warn!(
                    authors = needs_fallback.len(),
                    "no usable fallback relay, authors left uncovered"
                );
            }

            for url in fallbacks {
                let authors = by_relay.entry(url.clone()).or_default();
                for author in &needs_fallback {
                    if !authors.contains(author) {
                        authors.push(*author);
                    }
                }
            }
        }

        // Step 3: rank.
        let mut candidates: Vec<RelayCandidate> = by_relay
            .into_iter()
            .map(|(url, authors)| RelayCandidate { url, authors })
            .collect();
        ranker.rank(&mut candidates);

        // Step 4: greedy walk.
        let mut covered: HashSet<PublicKey> = HashSet::with_capacity(seen_authors.len());
        let mut entries: Vec<QueryPlanEntry> = Vec::new();
        let mut deferred: Vec<&RelayCandidate> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();

        let uncovered_of = |candidate: &RelayCandidate, covered: &HashSet<PublicKey>| {
            candidate
                .authors
                .iter()
                .filter(|a| !covered.contains(*a))
                .copied()
                .collect::<Vec<_>>()
        };

        for candidate in &candidates {
            let uncovered = uncovered_of(candidate, &covered);
            if uncovered.is_empty() {
                continue;
            }
            if entries.len() >= opts.max_relays {
                skipped.push(candidate.url.clone());
                continue;
            }
            if uncovered.len() < opts.min_authors_per_relay {
                deferred.push(candidate);
                continue;
            }
            self.select(&mut entries, &mut covered, &candidate.url, uncovered);
        }

        // Step 5: backfill deferred relays, most uncovered first.
        loop {
            let best = deferred
                .iter()
                .enumerate()
                .map(|(i, c)| (i, uncovered_of(c, &covered)))
                .filter(|(_, uncovered)| !uncovered.is_empty())
                .max_by(|(ia, a), (ib, b)| a.len().cmp(&b.len()).then(ib.cmp(ia)));

            let Some((index, uncovered)) = best else {
                break;
            };

            if entries.len() >= opts.max_relays {
                skipped.extend(
                    deferred
                        .iter()
                        .filter(|c| !uncovered_of(c, &covered).is_empty())
                        .map(|c| c.url.clone()),
                );
                break;
            }

            let candidate = deferred.remove(index);
            self.select(&mut entries, &mut covered, &candidate.url, uncovered);
        }

        let uncovered_count = seen_authors.len() - covered.len();

        gauge!("outbox_plan_relays").set(entries.len() as f64);
        gauge!("outbox_plan_authors_covered").set(covered.len() as f64);
        counter!("outbox_plan_relays_skipped_total").increment(skipped.len() as u64);

        tracing::info!(
            ranker = ranker.name(),
            follows = seen_authors.len(),
            relays = entries.len(),
            covered = covered.len(),
            uncovered = uncovered_count,
            fallback_authors = needs_fallback.len(),
            skipped = skipped.len(),
            "built query plan"
        );

        QueryPlan {
            entries,
            skipped_relays: skipped,
        }
    }

    fn select(
        &self,
        entries: &mut Vec<QueryPlanEntry>,
        covered: &mut HashSet<PublicKey>,
        relay: &str,
        mut authors: Vec<PublicKey>,
    ) {
        authors.truncate(self.options.max_authors_per_relay.max(1));
        covered.extend(authors.iter().copied());
        tracing::debug!(relay = %relay, authors = authors.len(), "selected relay");
        entries.push(QueryPlanEntry {
            relay: relay.to_string(),
            authors,
            priority: entries.len(),
        });
    }
}

impl Default for QueryPlanner {
    fn default() -> Self {
        Self::new(PlanOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::CoverageRanker;
    use nostr::Keys;

    fn pk() -> PublicKey {
        Keys::generate().public_key()
    }

    fn config(author: PublicKey, write: &[&str]) -> RelayConfig {
        RelayConfig {
            author,
            write_relays: write.iter().map(|s| s.to_string()).collect(),
            read_relays: Vec::new(),
            updated_at: 0,
        }
    }

    fn always(_: &str) -> bool {
        true
    }

    fn plan_with(
        planner: &QueryPlanner,
        follows: &[FollowEntry],
        configs: &HashMap<PublicKey, RelayConfig>,
    ) -> QueryPlan {
        planner.plan(follows, configs, &CoverageRanker, &always)
    }

    fn assert_disjoint(plan: &QueryPlan) {
        let mut seen = HashSet::new();
        for entry in &plan.entries {
            for author in &entry.authors {
                assert!(seen.insert(*author), "author assigned twice");
            }
        }
        let relays: HashSet<_> = plan.entries.iter().map(|e| &e.relay).collect();
        assert_eq!(relays.len(), plan.entries.len(), "relay selected twice");
    }

    fn covered(plan: &QueryPlan) -> HashSet<PublicKey> {
        plan.entries
            .iter()
            .flat_map(|e| e.authors.iter().copied())
            .collect()
    }

    // ========================================================================
    // Basic planning
    // ========================================================================

    #[test]
    fn test_empty_follows_yield_empty_plan() {
        let plan = plan_with(&QueryPlanner::default(), &[], &HashMap::new());
        assert!(plan.is_empty());
        assert!(plan.skipped_relays.is_empty());
    }

    #[test]
    fn test_shared_relay_covers_everyone() {
        let authors: Vec<PublicKey> = (0..5).map(|_| pk()).collect();
        let follows: Vec<FollowEntry> = authors.iter().map(|a| FollowEntry::new(*a)).collect();
        let configs: HashMap<_, _> = authors
            .iter()
            .enumerate()
            .map(|(i, a)| {
                let own = format!("wss://own{i}.example.com");
                (*a, config(*a, &["wss://shared.example.com", own.as_str()]))
            })
            .collect();

        let plan = plan_with(&QueryPlanner::default(), &follows, &configs);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.entries[0].relay, "wss://shared.example.com");
        assert_eq!(plan.entries[0].authors, authors);
        assert_eq!(plan.entries[0].priority, 0);
    }

    #[test]
    fn test_scenario_three_authors_two_relays_each() {
        let authors: Vec<PublicKey> = (0..3).map(|_| pk()).collect();
        let follows: Vec<FollowEntry> = authors.iter().map(|a| FollowEntry::new(*a)).collect();
        let configs: HashMap<_, _> = authors
            .iter()
            .enumerate()
            .map(|(i, a)| {
                let first = format!("wss://a{i}.example.com");
                let second = format!("wss://b{i}.example.com");
                (*a, config(*a, &[first.as_str(), second.as_str()]))
            })
            .collect();

        let planner = QueryPlanner::new(PlanOptions {
            max_relays: 10,
            ..Default::default()
        });
        let plan = plan_with(&planner, &follows, &configs);

        assert!(plan.len() <= 6);
        assert_eq!(covered(&plan), authors.iter().copied().collect());
        assert!(plan.skipped_relays.is_empty());
        assert_disjoint(&plan);
    }

    #[test]
    fn test_scenario_no_relay_configs_use_fallbacks() {
        let authors: Vec<PublicKey> = (0..100).map(|_| pk()).collect();
        let follows: Vec<FollowEntry> = authors.iter().map(|a| FollowEntry::new(*a)).collect();
        // Every author resolved to the empty sentinel.
        let configs: HashMap<_, _> = authors
            .iter()
            .map(|a| (*a, RelayConfig::empty(*a, 0)))
            .collect();

        let planner = QueryPlanner::default();
        let plan = plan_with(&planner, &follows, &configs);

        assert!(plan.len() <= 3);
        assert!(
            plan.entries
                .iter()
                .all(|e| planner.options().fallback_relays.contains(&e.relay))
        );
        assert!(plan.entries.iter().all(|e| e.authors.len() <= 50));
        assert_eq!(covered(&plan).len(), 100);
        assert_disjoint(&plan);
    }

    #[test]
    fn test_hints_used_when_no_write_relays() {
        let alice = pk();
        let follows = vec![FollowEntry::new(alice).with_hint("wss://hint.example.com")];
        let planner = QueryPlanner::new(PlanOptions {
            min_authors_per_relay: 1,
            ..Default::default()
        });

        let plan = plan_with(&planner, &follows, &HashMap::new());
        assert_eq!(plan.relays(), vec!["wss://hint.example.com"]);
    }

    #[test]
    fn test_duplicate_follows_planned_once() {
        let alice = pk();
        let follows = vec![FollowEntry::new(alice), FollowEntry::new(alice)];
        let configs = HashMap::from([(alice, config(alice, &["wss://a.example.com"]))]);

        let plan = plan_with(&QueryPlanner::default(), &follows, &configs);
        assert_eq!(plan.author_count(), 1);
    }

    // ========================================================================
    // Limits
    // ========================================================================

    #[test]
    fn test_relay_cap_and_skipped_relays() {
        let authors: Vec<PublicKey> = (0..12).map(|_| pk()).collect();
        let follows: Vec<FollowEntry> = authors.iter().map(|a| FollowEntry::new(*a)).collect();
        // Four disjoint groups of three authors.
        let configs: HashMap<_, _> = authors
            .iter()
            .enumerate()
            .map(|(i, a)| {
                let relay = format!("wss://group{}.example.com", i / 3);
                (*a, config(*a, &[relay.as_str()]))
            })
            .collect();

        let planner = QueryPlanner::new(PlanOptions {
            max_relays: 2,
            ..Default::default()
        });
        let plan = plan_with(&planner, &follows, &configs);

        assert_eq!(plan.len(), 2);
        assert_eq!(plan.author_count(), 6);
        assert_eq!(
            plan.skipped_relays,
            vec!["wss://group2.example.com", "wss://group3.example.com"]
        );
    }

    #[test]
    fn test_max_authors_per_relay_spills_to_next_relay() {
        let authors: Vec<PublicKey> = (0..6).map(|_| pk()).collect();
        let follows: Vec<FollowEntry> = authors.iter().map(|a| FollowEntry::new(*a)).collect();
        let configs: HashMap<_, _> = authors
            .iter()
            .map(|a| {
                (
                    *a,
                    config(*a, &["wss://big.example.com", "wss://other.example.com"]),
                )
            })
            .collect();

        let planner = QueryPlanner::new(PlanOptions {
            max_authors_per_relay: 4,
            min_authors_per_relay: 1,
            ..Default::default()
        });
        let plan = plan_with(&planner, &follows, &configs);

        assert_eq!(plan.relays(), vec!["wss://big.example.com", "wss://other.example.com"]);
        assert_eq!(plan.entries[0].authors.len(), 4);
        assert_eq!(plan.entries[1].authors.len(), 2);
        assert_disjoint(&plan);
    }

    #[test]
    fn test_max_relays_per_author_truncates_candidates() {
        let alice = pk();
        let follows = vec![FollowEntry::new(alice)];
        let configs = HashMap::from([(
            alice,
            config(
                alice,
                &["wss://z.example.com", "wss://y.example.com", "wss://a.example.com"],
            ),
        )]);
        let planner = QueryPlanner::new(PlanOptions {
            max_relays_per_author: 2,
            min_authors_per_relay: 1,
            ..Default::default()
        });

        let plan = plan_with(&planner, &follows, &configs);
        // wss://a is the third choice and never becomes a candidate.
        assert_eq!(plan.relays(), vec!["wss://y.example.com"]);
    }

    #[test]
    fn test_low_yield_relays_deferred_behind_bigger_ones() {
        let big: Vec<PublicKey> = (0..3).map(|_| pk()).collect();
        let loner = pk();
        let mut follows: Vec<FollowEntry> = big.iter().map(|a| FollowEntry::new(*a)).collect();
        follows.push(FollowEntry::new(loner));

        let mut configs: HashMap<_, _> = big
            .iter()
            .map(|a| (*a, config(*a, &["wss://zz-big.example.com"])))
            .collect();
        configs.insert(loner, config(loner, &["wss://aa-small.example.com"]));

        let plan = plan_with(&QueryPlanner::default(), &follows, &configs);
        assert_eq!(
            plan.relays(),
            vec!["wss://zz-big.example.com", "wss://aa-small.example.com"]
        );
        assert_eq!(plan.entries[1].priority, 1);
    }

    // ========================================================================
    // Exclusions
    // ========================================================================

    #[test]
    fn test_blocked_relays_never_planned() {
        let authors: Vec<PublicKey> = (0..4).map(|_| pk()).collect();
        let follows: Vec<FollowEntry> = authors.iter().map(|a| FollowEntry::new(*a)).collect();
        let configs: HashMap<_, _> = authors
            .iter()
            .map(|a| {
                (
                    *a,
                    config(*a, &["wss://blocked.example.com", "wss://ok.example.com"]),
                )
            })
            .collect();

        let planner = QueryPlanner::new(PlanOptions {
            blocked_relays: HashSet::from(["wss://blocked.example.com/".to_string()]),
            fallback_relays: vec!["wss://blocked.example.com".to_string()],
            ..Default::default()
        });
        let plan = plan_with(&planner, &follows, &configs);
        assert_eq!(plan.relays(), vec!["wss://ok.example.com"]);
        assert!(!plan.skipped_relays.contains(&"wss://blocked.example.com".to_string()));
    }

    #[test]
    fn test_unusable_relays_fall_through_to_fallback() {
        let authors: Vec<PublicKey> = (0..3).map(|_| pk()).collect();
        let follows: Vec<FollowEntry> = authors.iter().map(|a| FollowEntry::new(*a)).collect();
        let configs: HashMap<_, _> = authors
            .iter()
            .map(|a| (*a, config(*a, &["wss://dead.example.com"])))
            .collect();

        let planner = QueryPlanner::new(PlanOptions {
            fallback_relays: vec!["wss://fallback.example.com".to_string()],
            ..Default::default()
        });
        let is_usable = |url: &str| url != "wss://dead.example.com";
        let plan = planner.plan(&follows, &configs, &CoverageRanker, &is_usable);

        assert_eq!(plan.relays(), vec!["wss://fallback.example.com"]);
        assert_eq!(plan.author_count(), 3);
    }

    #[test]
    fn test_no_usable_fallback_leaves_authors_uncovered() {
        let follows = vec![FollowEntry::new(pk())];
        let planner = QueryPlanner::new(PlanOptions {
            fallback_relays: Vec::new(),
            ..Default::default()
        });
        assert!(plan_with(&planner, &follows, &HashMap::new()).is_empty());
    }

    #[test]
    fn test_fallback_relays_normalized_with_options() {
        let strict = QueryPlanner::new(PlanOptions {
            fallback_relays: vec![
                "wss://Fallback.example.com/".to_string(),
                "wss://fallback.example.com".to_string(),
                "ws://localhost:7777".to_string(),
            ],
            ..Default::default()
        });
        assert_eq!(
            strict.options().fallback_relays,
            vec!["wss://fallback.example.com"]
        );

        let local = QueryPlanner::new(PlanOptions {
            fallback_relays: vec!["ws://localhost:7777/".to_string()],
            min_authors_per_relay: 1,
            normalize: NormalizeOptions {
                allow_local: true,
                ..Default::default()
            },
            ..Default::default()
        });
        let follows = vec![FollowEntry::new(pk())];
        let plan = plan_with(&local, &follows, &HashMap::new());
        assert_eq!(plan.relays(), vec!["ws://localhost:7777"]);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let authors: Vec<PublicKey> = (0..20).map(|_| pk()).collect();
        let follows: Vec<FollowEntry> = authors.iter().map(|a| FollowEntry::new(*a)).collect();
        let configs: HashMap<_, _> = authors
            .iter()
            .enumerate()
            .map(|(i, a)| {
                let r1 = format!("wss://r{}.example.com", i % 4);
                let r2 = format!("wss://r{}.example.com", (i + 1) % 5);
                (*a, config(*a, &[r1.as_str(), r2.as_str()]))
            })
            .collect();

        let planner = QueryPlanner::default();
        let first = plan_with(&planner, &follows, &configs);
        for _ in 0..5 {
            assert_eq!(plan_with(&planner, &follows, &configs), first);
        }
        assert_eq!(covered(&first).len(), 20);
        assert_disjoint(&first);
    }
}
