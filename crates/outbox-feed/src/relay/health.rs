//! Per-relay health tracking.
//!
//! Every fetch the orchestrator runs ends in a success, a failure or a
//! timeout, and each outcome is reported here. Consecutive failures and
//! timeouts move a relay from healthy to degraded to dead; any success puts
//! it back to healthy. A dead relay is left out of planning until a cooldown
//! has passed since its last failure, after which it may be probed again.
//!
//! State lives in memory for the life of the process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock};

/// Health classification of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HealthState {
    /// Working, or never tried.
    #[default]
    Healthy,
    /// Failing but still queried.
    Degraded,
    /// Failing persistently; excluded until its cooldown passes.
    Dead,
}

impl HealthState {
    /// String representation for logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Dead => "dead",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds for the health state machine.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Consecutive failures or timeouts before a relay is degraded.
    pub degraded_after: u32,
    /// Consecutive failures or timeouts before a relay is dead.
    pub dead_after: u32,
    /// How long a dead relay stays ineligible after its last failure.
    pub cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_after: 2,
            dead_after: 5,
            cooldown: Duration::from_secs(5 * 60),
        }
    }
}

/// Everything known about one relay.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RelayHealthRecord {
    /// Relay URL.
    pub url: String,
    /// Current classification.
    pub state: HealthState,
    /// Failures and timeouts since the last success.
    pub consecutive_failures: u32,
    /// When the last failure or timeout happened (epoch ms).
    pub last_failure_at: Option<u64>,
    /// When a dead relay may be tried again (epoch ms).
    pub next_eligible_at: Option<u64>,
    /// Total successful fetches.
    pub successes: u64,
    /// Total failed fetches (excluding timeouts).
    pub failures: u64,
    /// Total timed-out fetches.
    pub timeouts: u64,
    /// Mean latency of successful fetches in milliseconds.
    pub avg_latency_ms: f64,
}

impl RelayHealthRecord {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// Number of fetches that reported an outcome.
    pub fn attempts(&self) -> u64 {
        self.successes + self.failures + self.timeouts
    }

    /// Fraction of fetches that succeeded, or `None` if never tried.
    pub fn success_rate(&self) -> Option<f64> {
        match self.attempts() {
            0 => None,
            n => Some(self.successes as f64 / n as f64),
        }
    }
}

/// Counts of tracked relays per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthStats {
    pub healthy: usize,
    pub degraded: usize,
    pub dead: usize,
}

impl HealthStats {
    /// Number of tracked relays.
    pub fn total(&self) -> usize {
        self.healthy + self.degraded + self.dead
    }
}

#[derive(Debug, Clone, Copy)]
enum Miss {
    Failure,
    Timeout,
}

/// Tracks the health of every relay the engine has queried.
pub struct HealthTracker {
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    records: Mutex<HashMap<String, RelayHealthRecord>>,
}

impl HealthTracker {
    /// Create a tracker using the system clock.
    pub fn new(config: HealthConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a tracker with an explicit clock.
    pub fn with_clock(config: HealthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Record a successful fetch.
    pub fn record_success(&self, url: &str, latency_ms: u64) {
        let mut records = self.records.lock();
        let record = records
            .entry(url.to_string())
            .or_insert_with(|| RelayHealthRecord::new(url));

        record.successes += 1;
        let n = record.successes as f64;
        record.avg_latency_ms += (latency_ms as f64 - record.avg_latency_ms) / n;

        record.consecutive_failures = 0;
        record.next_eligible_at = None;
        if record.state != HealthState::Healthy {
            tracing::info!(relay = %url, from = %record.state, "relay recovered");
            record.state = HealthState::Healthy;
            counter!("outbox_relay_health_transitions_total", "state" => "healthy").increment(1);
        }
    }

    /// Record a failed fetch.
    pub fn record_failure(&self, url: &str) {
        self.record_miss(url, Miss::Failure);
    }

    /// Record a fetch that hit its timeout.
    pub fn record_timeout(&self, url: &str) {
        self.record_miss(url, Miss::Timeout);
    }

    fn record_miss(&self, url: &str, miss: Miss) {
        let now = self.clock.now_ms();
        let mut records = self.records.lock();
        let record = records
            .entry(url.to_string())
            .or_insert_with(|| RelayHealthRecord::new(url));

        match miss {
            Miss::Failure => record.failures += 1,
            Miss::Timeout => record.timeouts += 1,
        }
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        record.last_failure_at = Some(now);

        let next = if record.consecutive_failures >= self.config.dead_after {
            HealthState::Dead
        } else if record.consecutive_failures >= self.config.degraded_after {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        if next == HealthState::Dead {
            // Every further failure re-arms the cooldown.
            record.next_eligible_at = Some(now + self.config.cooldown.as_millis() as u64);
        }

        if next != record.state {
            tracing::warn!(
                relay = %url,
                from = %record.state,
                to = %next,
                consecutive_failures = record.consecutive_failures,
                "relay health changed"
            );
            record.state = next;
            counter!("outbox_relay_health_transitions_total", "state" => next.as_str())
                .increment(1);
        }
    }

    /// Current classification of `url`. Unknown relays are healthy.
    pub fn classify(&self, url: &str) -> HealthState {
        self.records
            .lock()
            .get(url)
            .map(|r| r.state)
            .unwrap_or_default()
    }

    /// Whether `url` may be used in a plan.
    ///
    /// Healthy and degraded relays always are. A dead relay becomes eligible
    /// again once its cooldown has elapsed.
    pub fn is_eligible(&self, url: &str) -> bool {
        let records = self.records.lock();
        match records.get(url) {
            Some(record) => self.eligible(record, self.clock.now_ms()),
            None => true,
        }
    }

    /// Whether `url` is dead but past its cooldown.
    pub fn is_recovery_due(&self, url: &str) -> bool {
        let now = self.clock.now_ms();
        self.records.lock().get(url).is_some_and(|r| {
            r.state == HealthState::Dead && r.next_eligible_at.is_some_and(|at| now >= at)
        })
    }

    fn eligible(&self, record: &RelayHealthRecord, now: u64) -> bool {
        match record.state {
            HealthState::Healthy | HealthState::Degraded => true,
            HealthState::Dead => record.next_eligible_at.is_some_and(|at| now >= at),
        }
    }

    /// Keep only the eligible relays, preserving order.
    pub fn filter_healthy_relays<S: AsRef<str>>(&self, urls: &[S]) -> Vec<String> {
        let now = self.clock.now_ms();
        let records = self.records.lock();
        urls.iter()
            .map(AsRef::as_ref)
            .filter(|url| records.get(*url).is_none_or(|r| self.eligible(r, now)))
            .map(str::to_string)
            .collect()
    }

    /// The record for `url`, if it has ever reported an outcome.
    pub fn record(&self, url: &str) -> Option<RelayHealthRecord> {
        self.records.lock().get(url).cloned()
    }

    /// All records, sorted by URL.
    pub fn snapshot(&self) -> Vec<RelayHealthRecord> {
        let mut records: Vec<_> = self.records.lock().values().cloned().collect();
        records.sort_by(|a, b| a.url.cmp(&b.url));
        records
    }

    /// Count relays per state.
    pub fn stats(&self) -> HealthStats {
        let mut stats = HealthStats::default();
        for record in self.records.lock().values() {
            match record.state {
                HealthState::Healthy => stats.healthy += 1,
                HealthState::Degraded => stats.degraded += 1,
                HealthState::Dead => stats.dead += 1,
            }
        }
        stats
    }

    /// Forget everything about `url`.
    pub fn reset(&self, url: &str) {
        if self.records.lock().remove(url).is_some() {
            tracing::info!(relay = %url, "relay health reset");
        }
    }

    /// Forget everything.
    pub fn reset_all(&self) {
        let mut records = self.records.lock();
        tracing::info!(relays = records.len(), "relay health reset for all relays");
        records.clear();
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}
