//! Follow list resolution.
//!
//! Fetches a user's kind 3 contact list from the bootstrap relays and keeps
//! the parsed entries in a moka cache with a short TTL.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use moka::future::Cache;
use nostr::{Kind, PublicKey};
use outbox_core::{FollowEntry, NormalizeOptions, newest_per_author, parse_follow_list};

use crate::fetcher::{EventFetcher, FeedFilter};

/// Default TTL for cached follow lists (5 minutes).
const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Maximum number of users whose follow lists are cached.
const DEFAULT_CAPACITY: u64 = 1_000;

/// Configuration for the follow list resolver.
#[derive(Debug, Clone)]
pub struct FollowListConfig {
    /// Relays queried for kind 3 records.
    pub bootstrap_relays: Vec<String>,
    /// How long a resolved follow list is served without refetching.
    pub ttl: Duration,
    /// Timeout for one follow-list request.
    pub fetch_timeout: Duration,
    /// URL filtering applied to relay hints.
    pub normalize: NormalizeOptions,
}

impl Default for FollowListConfig {
    fn default() -> Self {
        Self {
            bootstrap_relays: outbox_core::DEFAULT_BOOTSTRAP_RELAYS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ttl: DEFAULT_TTL,
            fetch_timeout: Duration::from_secs(5),
            normalize: NormalizeOptions::default(),
        }
    }
}

/// Resolves and caches follow lists.
pub struct FollowListResolver<F> {
    config: FollowListConfig,
    fetcher: Arc<F>,
    cache: Cache<PublicKey, Arc<Vec<FollowEntry>>>,
}

impl<F: EventFetcher> FollowListResolver<F> {
    pub fn new(config: FollowListConfig, fetcher: Arc<F>) -> Self {
        let cache = Cache::builder()
            .max_capacity(DEFAULT_CAPACITY)
            .time_to_live(config.ttl)
            .build();
        Self {
            config,
            fetcher,
            cache,
        }
    }

    /// The follow set of `user`.
    ///
    /// Network failures and missing contact lists resolve to an empty list,
    /// which is not cached so the next call tries again.
    pub async fn resolve(&self, user: &PublicKey, force_refresh: bool) -> Arc<Vec<FollowEntry>> {
        if !force_refresh && let Some(follows) = self.cache.get(user).await {
            tracing::debug!(user = %user, follows = follows.len(), "follow list cache hit");
            return follows;
        }

        let filter = FeedFilter::new()
            .kinds([Kind::ContactList])
            .authors([*user]);
        let events = match self
            .fetcher
            .fetch_events(
                filter,
                self.config.bootstrap_relays.clone(),
                self.config.fetch_timeout,
            )
            .await
        {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(user = %user, error = %e, "failed to fetch follow list");
                counter!("outbox_follow_list_fetches_total", "result" => "error").increment(1);
                return Arc::new(Vec::new());
            }
        };

        let newest = newest_per_author(
            events.into_iter().filter(|e| e.pubkey == *user),
            Kind::ContactList,
        );
        let Some(event) = newest.get(user) else {
            tracing::info!(user = %user, "no follow list found");
            counter!("outbox_follow_list_fetches_total", "result" => "missing").increment(1);
            return Arc::new(Vec::new());
        };

        let follows = Arc::new(parse_follow_list(event, &self.config.normalize));
        counter!("outbox_follow_list_fetches_total", "result" => "ok").increment(1);
        tracing::info!(user = %user, follows = follows.len(), "resolved follow list");
        self.cache.insert(*user, Arc::clone(&follows)).await;
        follows
    }

    /// Drop the cached follow list for `user`.
    pub async fn invalidate(&self, user: &PublicKey) {
        self.cache.invalidate(user).await;
    }
}
