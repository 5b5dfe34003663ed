//! Per-author relay list resolution and caching.
//!
//! The `RelayListCache` is responsible for:
//! - Answering "where does this author write?" from memory when fresh
//! - Fetching NIP-65 relay lists (kind 10002) for everyone else in batches
//! - Caching authors without a usable list as an empty sentinel
//! - Persisting a versioned snapshot so a restart does not start cold
//!
//! Resolution never fails. A batch that errors is logged and its authors
//! fall back to whatever (possibly stale) entry the cache still holds, or are
//! left out so the planner routes them to the fallback relays.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::counter;
use nostr::{Event, Kind, PublicKey};
use outbox_core::{
    MAX_AUTHORS_PER_REQUEST, NormalizeOptions, RelayConfig, newest_per_author, parse_relay_list,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use super::store::SnapshotStore;
use crate::Result;
use crate::clock::Clock;
use crate::fetcher::{EventFetcher, FeedFilter};

/// Key under which the relay list snapshot is stored.
pub const SNAPSHOT_KEY: &str = "relay_lists";

/// Snapshot format version. Snapshots with any other version are discarded.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Configuration for the relay list cache.
#[derive(Debug, Clone)]
pub struct RelayListCacheConfig {
    /// Relays queried for kind 10002 records.
    pub bootstrap_relays: Vec<String>,
    /// How long a resolved entry is served without refetching.
    pub ttl: Duration,
    /// Snapshots older than this are ignored on load.
    pub max_snapshot_age: Duration,
    /// Maximum authors per relay-list request.
    pub batch_size: usize,
    /// Timeout for one relay-list request.
    pub fetch_timeout: Duration,
    /// URL filtering applied to parsed relay lists.
    pub normalize: NormalizeOptions,
}

impl Default for RelayListCacheConfig {
    fn default() -> Self {
        Self {
            bootstrap_relays: outbox_core::DEFAULT_BOOTSTRAP_RELAYS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ttl: Duration::from_secs(30 * 60),
            max_snapshot_age: Duration::from_secs(24 * 3600),
            batch_size: MAX_AUTHORS_PER_REQUEST,
            fetch_timeout: Duration::from_secs(5),
            normalize: NormalizeOptions::default(),
        }
    }
}

/// Persisted form of the cache.
#[derive(Debug, Serialize, Deserialize)]
struct RelayListSnapshot {
    version: u32,
    /// When the snapshot was written (Unix epoch milliseconds).
    timestamp: u64,
    /// Entries keyed by author hex.
    data: HashMap<String, RelayConfig>,
}

/// Relay list cache with TTL and snapshot persistence.
pub struct RelayListCache<F> {
    config: RelayListCacheConfig,
    fetcher: Arc<F>,
    store: Arc<dyn SnapshotStore>,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<PublicKey, RelayConfig>>,
    /// Set once the persisted snapshot has been read.
    snapshot_loaded: AtomicBool,
}

impl<F: EventFetcher> RelayListCache<F> {
    /// Create a cache. The snapshot is read lazily on first use.
    pub fn new(
        config: RelayListCacheConfig,
        fetcher: Arc<F>,
        store: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            fetcher,
            store,
            clock,
            entries: Mutex::new(HashMap::new()),
            snapshot_loaded: AtomicBool::new(false),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &RelayListCacheConfig {
        &self.config
    }

    /// Resolve relay configs for `authors`.
    ///
    /// Fresh cached entries are returned as-is; the rest are fetched unless
    /// the network fails, in which case stale entries are used when present.
    /// With `force_refresh` every author is fetched again.
    pub async fn resolve_many(
        &self,
        authors: &[PublicKey],
        force_refresh: bool,
    ) -> HashMap<PublicKey, RelayConfig> {
        self.ensure_snapshot_loaded();

        let now = self.clock.now_ms();
        let ttl_ms = self.config.ttl.as_millis() as u64;

        let mut resolved = HashMap::with_capacity(authors.len());
        let mut stale: HashMap<PublicKey, RelayConfig> = HashMap::new();
        let mut to_fetch = Vec::new();
        let mut seen = HashSet::with_capacity(authors.len());

        {
            let entries = self.entries.lock();
            for author in authors {
                if !seen.insert(*author) {
                    continue;
                }
                match entries.get(author) {
                    Some(config)
                        if !force_refresh && now.saturating_sub(config.updated_at) < ttl_ms =>
                    {
                        resolved.insert(*author, config.clone());
                    }
                    Some(config) => {
                        stale.insert(*author, config.clone());
                        to_fetch.push(*author);
                    }
                    None => to_fetch.push(*author),
                }
            }
        }

        counter!("outbox_relay_list_cache_hits_total").increment(resolved.len() as u64);
        counter!("outbox_relay_list_cache_misses_total").increment(to_fetch.len() as u64);

        if to_fetch.is_empty() {
            return resolved;
        }

        tracing::debug!(
            cached = resolved.len(),
            fetching = to_fetch.len(),
            force_refresh,
            "resolving relay lists"
        );

        let fetched = self.fetch_relay_lists(&to_fetch).await;

        if !fetched.is_empty() {
            let mut entries = self.entries.lock();
            for (author, config) in &fetched {
                entries.insert(*author, config.clone());
            }
        }

        let mut missing = 0usize;
        for author in &to_fetch {
            if let Some(config) = fetched.get(author) {
                resolved.insert(*author, config.clone());
            } else if let Some(config) = stale.remove(author) {
                resolved.insert(*author, config);
            } else {
                missing += 1;
            }
        }

        if missing > 0 {
            tracing::warn!(
                missing,
                "relay lists unavailable for some authors, they will use fallback relays"
            );
        }

        if !fetched.is_empty()
            && let Err(e) = self.persist()
        {
            tracing::warn!(error = %e, "failed to persist relay list snapshot");
        }

        resolved
    }

    /// Fetch relay lists for `authors` in bounded batches.
    ///
    /// Authors in a successful batch always get an entry (the empty sentinel
    /// if no usable list came back). Authors in a failed batch get none.
    async fn fetch_relay_lists(&self, authors: &[PublicKey]) -> HashMap<PublicKey, RelayConfig> {
        let batch_size = self.config.batch_size.clamp(1, MAX_AUTHORS_PER_REQUEST);
        let mut tasks: JoinSet<(Vec<PublicKey>, Result<Vec<Event>>)> = JoinSet::new();

        for chunk in authors.chunks(batch_size) {
            let batch = chunk.to_vec();
            let fetcher = Arc::clone(&self.fetcher);
            let relays = self.config.bootstrap_relays.clone();
            let timeout = self.config.fetch_timeout;
            tasks.spawn(async move {
                let filter = FeedFilter::new()
                    .kinds([Kind::RelayList])
                    .authors(batch.iter().copied());
                let result = fetcher.fetch_events(filter, relays, timeout).await;
                (batch, result)
            });
        }

        let now = self.clock.now_ms();
        let mut fetched = HashMap::with_capacity(authors.len());

        while let Some(joined) = tasks.join_next().await {
            let (batch, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "relay list batch task failed");
                    counter!("outbox_relay_list_fetch_errors_total").increment(1);
                    continue;
                }
            };

            let events = match result {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(
                        authors = batch.len(),
                        error = %e,
                        "relay list batch fetch failed"
                    );
                    counter!("outbox_relay_list_fetch_errors_total").increment(1);
                    continue;
                }
            };

            let wanted: HashSet<PublicKey> = batch.iter().copied().collect();
            let newest = newest_per_author(
                events.into_iter().filter(|e| wanted.contains(&e.pubkey)),
                Kind::RelayList,
            );

            for author in batch {
                let config = match newest.get(&author) {
                    Some(event) => parse_relay_list(event, &self.config.normalize, now),
                    None => RelayConfig::empty(author, now),
                };
                fetched.insert(author, config);
            }
        }

        fetched
    }

    fn ensure_snapshot_loaded(&self) {
        if !self.snapshot_loaded.swap(true, Ordering::SeqCst) {
            let loaded = self.load_snapshot();
            if loaded > 0 {
                tracing::info!(entries = loaded, "loaded relay list snapshot");
            }
        }
    }

    /// Merge the persisted snapshot into memory.
    ///
    /// Returns the number of entries taken from the snapshot. Missing,
    /// corrupt, wrong-version and too-old snapshots count as a miss.
    pub fn load_snapshot(&self) -> usize {
        self.snapshot_loaded.store(true, Ordering::SeqCst);

        let raw = match self.store.load(SNAPSHOT_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                counter!("outbox_relay_list_snapshot_loads_total", "result" => "missing")
                    .increment(1);
                return 0;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read relay list snapshot");
                counter!("outbox_relay_list_snapshot_loads_total", "result" => "error")
                    .increment(1);
                return 0;
            }
        };

        let snapshot: RelayListSnapshot = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "discarding corrupt relay list snapshot");
                counter!("outbox_relay_list_snapshot_loads_total", "result" => "corrupt")
                    .increment(1);
                return 0;
            }
        };

        if snapshot.version != SNAPSHOT_VERSION {
            tracing::info!(
                found = snapshot.version,
                expected = SNAPSHOT_VERSION,
                "discarding relay list snapshot with old schema"
            );
            counter!("outbox_relay_list_snapshot_loads_total", "result" => "version")
                .increment(1);
            return 0;
        }

        let age_ms = self.clock.now_ms().saturating_sub(snapshot.timestamp);
        if age_ms > self.config.max_snapshot_age.as_millis() as u64 {
            tracing::info!(age_ms, "discarding expired relay list snapshot");
            counter!("outbox_relay_list_snapshot_loads_total", "result" => "expired")
                .increment(1);
            return 0;
        }

        let mut entries = self.entries.lock();
        let mut loaded = 0;
        for (key, config) in snapshot.data {
            if PublicKey::from_hex(&key).ok() != Some(config.author) {
                continue;
            }
            let newer_in_memory = entries
                .get(&config.author)
                .is_some_and(|current| current.updated_at >= config.updated_at);
            if !newer_in_memory {
                entries.insert(config.author, config);
                loaded += 1;
            }
        }

        counter!("outbox_relay_list_snapshot_loads_total", "result" => "ok").increment(1);
        loaded
    }

    /// Write the current cache contents to the snapshot store.
    pub fn persist(&self) -> Result<()> {
        let data: HashMap<String, RelayConfig> = self
            .entries
            .lock()
            .iter()
            .map(|(author, config)| (author.to_hex(), config.clone()))
            .collect();

        let snapshot = RelayListSnapshot {
            version: SNAPSHOT_VERSION,
            timestamp: self.clock.now_ms(),
            data,
        };

        let json = serde_json::to_string(&snapshot)?;
        self.store.save(SNAPSHOT_KEY, &json)?;
        tracing::debug!(entries = snapshot.data.len(), "persisted relay list snapshot");
        Ok(())
    }

    /// The cached entry for `author`, fresh or not.
    pub fn get(&self, author: &PublicKey) -> Option<RelayConfig> {
        self.entries.lock().get(author).cloned()
    }

    /// Drop the cached entry for `author`.
    pub fn invalidate(&self, author: &PublicKey) {
        self.entries.lock().remove(author);
    }

    /// Drop every cached entry and the persisted snapshot.
    pub fn clear(&self) {
        self.entries.lock().clear();
        self.snapshot_loaded.store(true, Ordering::SeqCst);
        if let Err(e) = self.store.remove(SNAPSHOT_KEY) {
            tracing::warn!(error = %e, "failed to remove relay list snapshot");
        }
    }

    /// Number of cached authors.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::MemorySnapshotStore;
    use crate::clock::ManualClock;
    use crate::testing::{FakeFetcher, Reply, relay_list};
    use nostr::Keys;

    const T0: u64 = 1_700_000_000_000;

    struct Harness {
        fetcher: Arc<FakeFetcher>,
        store: Arc<MemorySnapshotStore>,
        clock: Arc<ManualClock>,
        cache: RelayListCache<FakeFetcher>,
    }

    fn harness() -> Harness {
        let fetcher = Arc::new(FakeFetcher::new());
        let store = Arc::new(MemorySnapshotStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let cache = RelayListCache::new(
            RelayListCacheConfig {
                bootstrap_relays: vec!["wss://indexer.example.com".to_string()],
                ..Default::default()
            },
            Arc::clone(&fetcher),
            store.clone(),
            clock.clone(),
        );
        Harness {
            fetcher,
            store,
            clock,
            cache,
        }
    }

    #[tokio::test]
    async fn test_resolves_and_parses_relay_lists() {
        let h = harness();
        let alice = Keys::generate();
        h.fetcher.add_events([relay_list(
            &alice,
            &[
                ("wss://alice-write.example.com", Some("write")),
                ("wss://alice-both.example.com", None),
                ("wss://alice-read.example.com", Some("read")),
                ("https://bogus.example.com", None),
            ],
            100,
        )]);

        let resolved = h.cache.resolve_many(&[alice.public_key()], false).await;
        let config = &resolved[&alice.public_key()];
        assert_eq!(
            config.write_relays,
            vec![
                "wss://alice-write.example.com",
                "wss://alice-both.example.com"
            ]
        );
        assert_eq!(
            config.read_relays,
            vec![
                "wss://alice-both.example.com",
                "wss://alice-read.example.com"
            ]
        );
        assert_eq!(config.updated_at, T0);
    }

    #[tokio::test]
    async fn test_newest_relay_list_wins() {
        let h = harness();
        let alice = Keys::generate();
        h.fetcher.add_events([
            relay_list(&alice, &[("wss://old.example.com", None)], 100),
            relay_list(&alice, &[("wss://new.example.com", None)], 200),
        ]);

        let resolved = h.cache.resolve_many(&[alice.public_key()], false).await;
        assert_eq!(
            resolved[&alice.public_key()].write_relays,
            vec!["wss://new.example.com"]
        );
    }

    #[tokio::test]
    async fn test_missing_list_cached_as_empty_sentinel() {
        let h = harness();
        let nobody = Keys::generate().public_key();

        let resolved = h.cache.resolve_many(&[nobody], false).await;
        assert!(resolved[&nobody].is_empty());
        assert_eq!(h.fetcher.calls().len(), 1);

        // Within the TTL the sentinel is served from memory.
        h.clock.advance_ms(60_000);
        let resolved = h.cache.resolve_many(&[nobody], false).await;
        assert!(resolved[&nobody].is_empty());
        assert_eq!(h.fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry_and_force_refresh() {
        let h = harness();
        let alice = Keys::generate();
        h.fetcher
            .add_events([relay_list(&alice, &[("wss://a.example.com", None)], 100)]);

        h.cache.resolve_many(&[alice.public_key()], false).await;
        h.cache.resolve_many(&[alice.public_key()], false).await;
        assert_eq!(h.fetcher.calls().len(), 1);

        h.cache.resolve_many(&[alice.public_key()], true).await;
        assert_eq!(h.fetcher.calls().len(), 2);

        h.clock.advance_ms(31 * 60 * 1000);
        h.cache.resolve_many(&[alice.public_key()], false).await;
        assert_eq!(h.fetcher.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_batches_respect_request_limit() {
        let h = harness();
        let authors: Vec<PublicKey> = (0..320).map(|_| Keys::generate().public_key()).collect();

        let resolved = h.cache.resolve_many(&authors, false).await;
        assert_eq!(resolved.len(), 320);

        let calls = h.fetcher.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| c.filter.authors.len() <= 150));
        assert!(
            calls
                .iter()
                .all(|c| c.filter.kinds == vec![Kind::RelayList])
        );
        assert!(
            calls
                .iter()
                .all(|c| c.relays == vec!["wss://indexer.example.com"])
        );
    }

    #[tokio::test]
    async fn test_network_failure_returns_partial_results() {
        let h = harness();
        let alice = Keys::generate();
        let bob = Keys::generate();
        h.fetcher
            .add_events([relay_list(&alice, &[("wss://a.example.com", None)], 100)]);

        h.cache.resolve_many(&[alice.public_key()], false).await;

        h.fetcher.set_offline(true);
        h.clock.advance_ms(31 * 60 * 1000);

        let resolved = h
            .cache
            .resolve_many(&[alice.public_key(), bob.public_key()], false)
            .await;

        // Alice falls back to her stale entry, Bob is simply absent.
        assert_eq!(
            resolved[&alice.public_key()].write_relays,
            vec!["wss://a.example.com"]
        );
        assert!(!resolved.contains_key(&bob.public_key()));
        // Failures are not cached as sentinels.
        assert!(h.cache.get(&bob.public_key()).is_none());
    }

    #[tokio::test]
    async fn test_failed_bootstrap_relay_is_logged_not_raised() {
        let h = harness();
        h.fetcher.script(
            "wss://indexer.example.com",
            Duration::ZERO,
            Reply::Fail,
        );
        let resolved = h
            .cache
            .resolve_many(&[Keys::generate().public_key()], false)
            .await;
        assert!(resolved.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let h = harness();
        let alice = Keys::generate();
        h.fetcher
            .add_events([relay_list(&alice, &[("wss://a.example.com", None)], 100)]);
        h.cache.resolve_many(&[alice.public_key()], false).await;
        assert!(h.store.load(SNAPSHOT_KEY).unwrap().is_some());

        // A second cache over the same store starts warm.
        let fetcher = Arc::new(FakeFetcher::new());
        let cache = RelayListCache::new(
            RelayListCacheConfig::default(),
            Arc::clone(&fetcher),
            h.store.clone(),
            h.clock.clone(),
        );
        let resolved = cache.resolve_many(&[alice.public_key()], false).await;
        assert_eq!(
            resolved[&alice.public_key()].write_relays,
            vec!["wss://a.example.com"]
        );
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_rejected_on_version_mismatch() {
        let h = harness();
        let alice = Keys::generate().public_key();
        let mut data = HashMap::new();
        data.insert(alice.to_hex(), RelayConfig::empty(alice, T0));
        let snapshot = RelayListSnapshot {
            version: SNAPSHOT_VERSION + 1,
            timestamp: T0,
            data,
        };
        h.store
            .save(SNAPSHOT_KEY, &serde_json::to_string(&snapshot).unwrap())
            .unwrap();

        assert_eq!(h.cache.load_snapshot(), 0);
        assert!(h.cache.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_rejected_when_too_old() {
        let h = harness();
        let alice = Keys::generate().public_key();
        let mut data = HashMap::new();
        data.insert(alice.to_hex(), RelayConfig::empty(alice, T0));
        let snapshot = RelayListSnapshot {
            version: SNAPSHOT_VERSION,
            timestamp: T0,
            data,
        };
        h.store
            .save(SNAPSHOT_KEY, &serde_json::to_string(&snapshot).unwrap())
            .unwrap();

        h.clock.advance_ms(25 * 3600 * 1000);
        assert_eq!(h.cache.load_snapshot(), 0);

        h.clock.set_ms(T0 + 3600 * 1000);
        assert_eq!(h.cache.load_snapshot(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_a_cache_miss() {
        let h = harness();
        h.store.save(SNAPSHOT_KEY, "{not json").unwrap();
        assert_eq!(h.cache.load_snapshot(), 0);

        let nobody = Keys::generate().public_key();
        let resolved = h.cache.resolve_many(&[nobody], false).await;
        assert!(resolved[&nobody].is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_input_authors_fetched_once() {
        let h = harness();
        let alice = Keys::generate().public_key();
        h.cache.resolve_many(&[alice, alice, alice], false).await;
        assert_eq!(h.fetcher.calls()[0].filter.authors, vec![alice]);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let h = harness();
        let alice = Keys::generate().public_key();
        let bob = Keys::generate().public_key();
        h.cache.resolve_many(&[alice, bob], false).await;
        assert_eq!(h.cache.len(), 2);

        h.cache.invalidate(&alice);
        assert!(h.cache.get(&alice).is_none());
        assert_eq!(h.cache.len(), 1);

        h.cache.persist().unwrap();
        assert!(h.store.load(SNAPSHOT_KEY).unwrap().is_some());

        h.cache.clear();
        assert!(h.cache.is_empty());
        assert!(h.store.load(SNAPSHOT_KEY).unwrap().is_none());
        assert_eq!(h.cache.load_snapshot(), 0);
    }
}
