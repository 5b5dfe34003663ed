//! Relay quality scoring computation.
//!
//! This module computes a quality score for a relay based on:
//! - Reliability (fraction of fetches that succeeded)
//! - Speed (mean latency relative to the median of all scored relays)
//! - Current health state

use super::health::{HealthState, RelayHealthRecord};

/// Weight for reliability in the composite score.
const RELIABILITY_WEIGHT: f64 = 0.7;

/// Weight for speed in the composite score.
const SPEED_WEIGHT: f64 = 0.3;

/// Cap for normalized speed (prevents one very fast relay from dominating).
const SPEED_CAP: f64 = 2.0;

/// Assumed success rate for relays that have never been queried.
const UNTESTED_SUCCESS_PRIOR: f64 = 0.75;

/// Multiplier applied to degraded relays.
const DEGRADED_PENALTY: f64 = 0.5;

/// Multiplier applied to dead relays that are due a recovery probe.
const DEAD_PENALTY: f64 = 0.25;

/// Stats used for score computation.
#[derive(Debug, Clone, Default)]
pub struct RelayStatsForScoring {
    /// Fraction of fetches that succeeded, `None` if never queried.
    pub success_rate: Option<f64>,
    /// Mean latency of successful fetches in milliseconds, `None` if none.
    pub avg_latency_ms: Option<f64>,
    /// Current health state.
    pub state: HealthState,
}

impl From<&RelayHealthRecord> for RelayStatsForScoring {
    fn from(record: &RelayHealthRecord) -> Self {
        Self {
            success_rate: record.success_rate(),
            avg_latency_ms: (record.successes > 0).then_some(record.avg_latency_ms),
            state: record.state,
        }
    }
}

/// Compute the quality score for a single relay.
///
/// # Arguments
///
/// * `stats` - The relay's stats for scoring
/// * `median_latency_ms` - Median latency across scored relays (for normalization)
///
/// # Returns
///
/// A composite score where higher is better. A never-queried healthy relay
/// scores `0.75 * 0.7 + 1.0 * 0.3 = 0.825`.
pub fn compute_score(stats: &RelayStatsForScoring, median_latency_ms: f64) -> f64 {
    let reliability = stats
        .success_rate
        .unwrap_or(UNTESTED_SUCCESS_PRIOR)
        .clamp(0.0, 1.0);

    // Faster than the median scores above 1.0, capped at 2x
    let speed = match stats.avg_latency_ms {
        Some(latency) if median_latency_ms > 0.0 => {
            (median_latency_ms / latency.max(1.0)).min(SPEED_CAP)
        }
        _ => 1.0,
    };

    let raw_score = (reliability * RELIABILITY_WEIGHT) + (speed * SPEED_WEIGHT);

    match stats.state {
        HealthState::Healthy => raw_score,
        HealthState::Degraded => raw_score * DEGRADED_PENALTY,
        HealthState::Dead => raw_score * DEAD_PENALTY,
    }
}

/// Compute the median of a slice of values.
pub fn compute_median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mid = values.len() / 2;
    if values.len().is_multiple_of(2) {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untested_relay_gets_neutral_score() {
        let score = compute_score(&RelayStatsForScoring::default(), 200.0);

        // Expected: (0.75 * 0.7) + (1.0 * 0.3) = 0.525 + 0.3 = 0.825
        assert!((score - 0.825).abs() < 0.001);
    }

    #[test]
    fn test_compute_score_at_median() {
        let stats = RelayStatsForScoring {
            success_rate: Some(0.9),
            avg_latency_ms: Some(200.0),
            state: HealthState::Healthy,
        };

        // Expected: (0.9 * 0.7) + (1.0 * 0.3) = 0.63 + 0.3 = 0.93
        assert!((compute_score(&stats, 200.0) - 0.93).abs() < 0.001);
    }

    #[test]
    fn test_speed_is_capped() {
        let stats = RelayStatsForScoring {
            success_rate: Some(1.0),
            avg_latency_ms: Some(10.0), // 20x faster than median, capped at 2x
            state: HealthState::Healthy,
        };

        // Expected: (1.0 * 0.7) + (2.0 * 0.3) = 1.3
        assert!((compute_score(&stats, 200.0) - 1.3).abs() < 0.001);
    }

    #[test]
    fn test_unhealthy_states_are_penalized() {
        let healthy = RelayStatsForScoring {
            success_rate: Some(0.5),
            avg_latency_ms: Some(400.0),
            state: HealthState::Healthy,
        };
        let degraded = RelayStatsForScoring {
            state: HealthState::Degraded,
            ..healthy.clone()
        };
        let dead = RelayStatsForScoring {
            state: HealthState::Dead,
            ..healthy.clone()
        };

        let h = compute_score(&healthy, 200.0);
        assert!((compute_score(&degraded, 200.0) - h * 0.5).abs() < 0.001);
        assert!((compute_score(&dead, 200.0) - h * 0.25).abs() < 0.001);
    }

    #[test]
    fn test_stats_from_record() {
        let record = RelayHealthRecord {
            url: "wss://a.example.com".into(),
            successes: 3,
            failures: 1,
            avg_latency_ms: 150.0,
            ..Default::default()
        };
        let stats = RelayStatsForScoring::from(&record);
        assert_eq!(stats.success_rate, Some(0.75));
        assert_eq!(stats.avg_latency_ms, Some(150.0));

        let never_succeeded = RelayHealthRecord {
            failures: 2,
            ..Default::default()
        };
        assert_eq!(
            RelayStatsForScoring::from(&never_succeeded).avg_latency_ms,
            None
        );
    }

    #[test]
    fn test_compute_median() {
        assert!((compute_median(&mut [1.0, 2.0, 3.0]) - 2.0).abs() < 0.001);
        assert!((compute_median(&mut [1.0, 2.0, 3.0, 4.0]) - 2.5).abs() < 0.001);
        assert!((compute_median(&mut []) - 0.0).abs() < 0.001);
        assert!((compute_median(&mut [5.0]) - 5.0).abs() < 0.001);
    }
}
