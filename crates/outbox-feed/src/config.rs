//! Engine configuration loaded from environment variables.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use outbox_core::{
    DEFAULT_BOOTSTRAP_RELAYS, DEFAULT_FALLBACK_RELAYS, NormalizeOptions, normalize_relay_url_with_opts,
    parse_relay_url,
};

use crate::cache::{FollowListConfig, RelayListCacheConfig};
use crate::fetch::FetchOptions;
use crate::planner::PlanOptions;
use crate::relay::HealthConfig;
use crate::{Error, Result};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Relays queried for relay lists and follow lists.
    pub bootstrap_relays: Vec<String>,
    /// Relays used for authors without a usable relay list.
    pub fallback_relays: Vec<String>,
    /// Relays that are never planned or queried.
    pub blocked_relays: Vec<String>,
    /// Accept loopback and private-network relay URLs (local development).
    pub allow_local_relays: bool,

    /// Maximum relays in one plan.
    pub max_relays: usize,
    /// Maximum authors assigned to one relay.
    pub max_authors_per_relay: usize,
    /// Relays covering fewer new authors than this are deferred.
    pub min_authors_per_relay: usize,
    /// How many of an author's write relays are considered.
    pub max_relays_per_author: usize,

    /// Budget for one relay during feed fetches.
    pub per_relay_timeout: Duration,
    /// Budget for one feed fetch.
    pub global_timeout: Duration,
    /// Relays queried at once.
    pub concurrency: usize,
    /// Unique events after which no further relays are started.
    pub target_event_count: usize,
    /// Relays queried before the target may stop a fetch.
    pub min_relays_before_early_stop: usize,

    /// How long resolved relay lists are served from cache.
    pub relay_list_ttl: Duration,
    /// How long resolved follow lists are served from cache.
    pub follow_list_ttl: Duration,
    /// Persisted snapshots older than this are ignored.
    pub snapshot_max_age: Duration,
    /// Timeout for relay-list and follow-list requests.
    pub resolve_timeout: Duration,

    /// Consecutive failures before a relay is degraded.
    pub health_degraded_after: u32,
    /// Consecutive failures before a relay is dead.
    pub health_dead_after: u32,
    /// How long a dead relay is excluded.
    pub health_cooldown: Duration,

    /// Rank relays by coverage and health instead of coverage alone.
    pub adaptive: bool,
    /// SQLite file for the relay list snapshot (in-memory when unset).
    pub cache_db_path: Option<PathBuf>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        let health = HealthConfig::default();
        Self {
            bootstrap_relays: to_strings(DEFAULT_BOOTSTRAP_RELAYS),
            fallback_relays: to_strings(DEFAULT_FALLBACK_RELAYS),
            blocked_relays: Vec::new(),
            allow_local_relays: false,
            max_relays: 15,
            max_authors_per_relay: 50,
            min_authors_per_relay: 3,
            max_relays_per_author: 2,
            per_relay_timeout: Duration::from_millis(2500),
            global_timeout: Duration::from_millis(5000),
            concurrency: 6,
            target_event_count: 300,
            min_relays_before_early_stop: 3,
            relay_list_ttl: Duration::from_secs(30 * 60),
            follow_list_ttl: Duration::from_secs(5 * 60),
            snapshot_max_age: Duration::from_secs(24 * 3600),
            resolve_timeout: Duration::from_secs(5),
            health_degraded_after: health.degraded_after,
            health_dead_after: health.dead_after,
            health_cooldown: health.cooldown,
            adaptive: false,
            cache_db_path: None,
        }
    }
}

impl OutboxConfig {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional and falls back to [`OutboxConfig::default`]:
    /// - `OUTBOX_BOOTSTRAP_RELAYS`, `OUTBOX_FALLBACK_RELAYS`,
    ///   `OUTBOX_BLOCKED_RELAYS`: comma-separated relay URLs; an entry that
    ///   is not a usable relay URL is an error
    /// - `OUTBOX_ALLOW_LOCAL_RELAYS`: `true`/`1` to accept loopback and
    ///   private-network relays
    /// - `OUTBOX_MAX_RELAYS`, `OUTBOX_MAX_AUTHORS_PER_RELAY`,
    ///   `OUTBOX_MIN_AUTHORS_PER_RELAY`, `OUTBOX_MAX_RELAYS_PER_AUTHOR`
    /// - `OUTBOX_PER_RELAY_TIMEOUT_MS`, `OUTBOX_GLOBAL_TIMEOUT_MS`,
    ///   `OUTBOX_CONCURRENCY`, `OUTBOX_TARGET_EVENT_COUNT`,
    ///   `OUTBOX_MIN_RELAYS_BEFORE_EARLY_STOP`
    /// - `OUTBOX_RELAY_LIST_TTL_SECS`, `OUTBOX_FOLLOW_LIST_TTL_SECS`
    /// - `OUTBOX_HEALTH_DEGRADED_AFTER`, `OUTBOX_HEALTH_DEAD_AFTER`,
    ///   `OUTBOX_HEALTH_COOLDOWN_SECS`
    /// - `OUTBOX_ADAPTIVE`: `true`/`1` to enable health-aware ranking
    /// - `OUTBOX_CACHE_DB`: path of the SQLite snapshot store
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("OUTBOX_ALLOW_LOCAL_RELAYS") {
            config.allow_local_relays = env_flag(&v);
        }
        let opts = config.normalize_options();
        if let Some(relays) = env_relays("OUTBOX_BOOTSTRAP_RELAYS", &opts)? {
            config.bootstrap_relays = relays;
        }
        if let Some(relays) = env_relays("OUTBOX_FALLBACK_RELAYS", &opts)? {
            config.fallback_relays = relays;
        }
        if let Some(relays) = env_relays("OUTBOX_BLOCKED_RELAYS", &opts)? {
            config.blocked_relays = relays;
        }

        if let Some(v) = env_parse("OUTBOX_MAX_RELAYS")? {
            config.max_relays = v;
        }
        if let Some(v) = env_parse("OUTBOX_MAX_AUTHORS_PER_RELAY")? {
            config.max_authors_per_relay = v;
        }
        if let Some(v) = env_parse("OUTBOX_MIN_AUTHORS_PER_RELAY")? {
            config.min_authors_per_relay = v;
        }
        if let Some(v) = env_parse("OUTBOX_MAX_RELAYS_PER_AUTHOR")? {
            config.max_relays_per_author = v;
        }
        if let Some(ms) = env_parse("OUTBOX_PER_RELAY_TIMEOUT_MS")? {
            config.per_relay_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("OUTBOX_GLOBAL_TIMEOUT_MS")? {
            config.global_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = env_parse("OUTBOX_CONCURRENCY")? {
            config.concurrency = v;
        }
        if let Some(v) = env_parse("OUTBOX_TARGET_EVENT_COUNT")? {
            config.target_event_count = v;
        }
        if let Some(v) = env_parse("OUTBOX_MIN_RELAYS_BEFORE_EARLY_STOP")? {
            config.min_relays_before_early_stop = v;
        }
        if let Some(secs) = env_parse("OUTBOX_RELAY_LIST_TTL_SECS")? {
            config.relay_list_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("OUTBOX_FOLLOW_LIST_TTL_SECS")? {
            config.follow_list_ttl = Duration::from_secs(secs);
        }
        if let Some(v) = env_parse("OUTBOX_HEALTH_DEGRADED_AFTER")? {
            config.health_degraded_after = v;
        }
        if let Some(v) = env_parse("OUTBOX_HEALTH_DEAD_AFTER")? {
            config.health_dead_after = v;
        }
        if let Some(secs) = env_parse("OUTBOX_HEALTH_COOLDOWN_SECS")? {
            config.health_cooldown = Duration::from_secs(secs);
        }
        if let Ok(v) = std::env::var("OUTBOX_ADAPTIVE") {
            config.adaptive = env_flag(&v);
        }
        if let Ok(path) = std::env::var("OUTBOX_CACHE_DB")
            && !path.trim().is_empty()
        {
            config.cache_db_path = Some(PathBuf::from(path.trim()));
        }

        config.validate()?;

        tracing::info!(
            bootstrap = config.bootstrap_relays.len(),
            fallback = config.fallback_relays.len(),
            blocked = config.blocked_relays.len(),
            max_relays = config.max_relays,
            concurrency = config.concurrency,
            adaptive = config.adaptive,
            "outbox configuration loaded"
        );

        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_relays == 0 {
            return Err(Error::Config("max_relays must be at least 1".into()));
        }
        if self.max_authors_per_relay == 0 {
            return Err(Error::Config("max_authors_per_relay must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if self.health_dead_after < self.health_degraded_after {
            return Err(Error::Config(format!(
                "health_dead_after ({}) must not be below health_degraded_after ({})",
                self.health_dead_after, self.health_degraded_after
            )));
        }
        if self.bootstrap_relays.is_empty() {
            return Err(Error::Config("at least one bootstrap relay is required".into()));
        }
        Ok(())
    }

    /// URL normalization shared by every component.
    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions {
            allow_local: self.allow_local_relays,
            ..Default::default()
        }
    }

    /// Relay list cache settings.
    pub fn relay_list_config(&self) -> RelayListCacheConfig {
        RelayListCacheConfig {
            bootstrap_relays: self.bootstrap_relays.clone(),
            ttl: self.relay_list_ttl,
            max_snapshot_age: self.snapshot_max_age,
            fetch_timeout: self.resolve_timeout,
            normalize: self.normalize_options(),
            ..Default::default()
        }
    }

    /// Follow list resolver settings.
    pub fn follow_list_config(&self) -> FollowListConfig {
        FollowListConfig {
            bootstrap_relays: self.bootstrap_relays.clone(),
            ttl: self.follow_list_ttl,
            fetch_timeout: self.resolve_timeout,
            normalize: self.normalize_options(),
        }
    }

    /// Planner settings.
    pub fn plan_options(&self) -> PlanOptions {
        PlanOptions {
            max_relays: self.max_relays,
            max_authors_per_relay: self.max_authors_per_relay,
            min_authors_per_relay: self.min_authors_per_relay,
            max_relays_per_author: self.max_relays_per_author,
            fallback_relays: self.fallback_relays.clone(),
            blocked_relays: self.blocked_set(),
            normalize: self.normalize_options(),
        }
    }

    /// Orchestrator settings.
    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            per_relay_timeout: self.per_relay_timeout,
            global_timeout: self.global_timeout,
            concurrency: self.concurrency,
            target_event_count: self.target_event_count,
            min_relays_before_early_stop: self.min_relays_before_early_stop,
            blocked_relays: self.blocked_set(),
        }
    }

    /// Health tracker settings.
    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            degraded_after: self.health_degraded_after,
            dead_after: self.health_dead_after,
            cooldown: self.health_cooldown,
        }
    }

    fn blocked_set(&self) -> HashSet<String> {
        let opts = self.normalize_options();
        self.blocked_relays
            .iter()
            .map(|url| {
                normalize_relay_url_with_opts(url, &opts)
                    .ok()
                    .unwrap_or_else(|| url.clone())
            })
            .collect()
    }
}

fn to_strings(urls: &[&str]) -> Vec<String> {
    urls.iter().map(|s| s.to_string()).collect()
}

/// Parse a comma-separated relay list into normalized, deduplicated URLs.
///
/// Empty entries are ignored. Any other entry that does not normalize under
/// `opts` fails the whole list with [`outbox_core::Error::InvalidRelayUrl`].
pub fn parse_relay_csv(value: &str, opts: &NormalizeOptions) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut relays = Vec::new();
    for raw in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let url = parse_relay_url(raw, opts)?;
        if seen.insert(url.clone()) {
            relays.push(url);
        }
    }
    Ok(relays)
}

fn env_relays(key: &str, opts: &NormalizeOptions) -> Result<Option<Vec<String>>> {
    match std::env::var(key) {
        Ok(v) => parse_relay_csv(&v, opts).map(Some),
        Err(_) => Ok(None),
    }
}

fn env_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{}: {}", key, e))),
        _ => Ok(None),
    }
}
