//! Read-only diagnostic snapshots for the in-process operator surface.
//!
//! Two structs, both serializable and built on demand: a point-in-time
//! [`GatewaySnapshot`] (latest BMS sample, CVL limits, energy counters and
//! publisher metrics) and a [`GatewayMetrics`] rollup combining poll and
//! publish counters. Neither is served over a network listener — whatever
//! operator-facing collaborator eventually exists calls these by method,
//! the same way the rest of the in-process API surface is consumed.

use serde::Serialize;

use crate::can_bus::orchestrator::Metrics as PublisherMetrics;
use crate::cache::poller::PollMetrics;

/// Combined poll + publish counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GatewayMetrics {
    pub poll_successes: u64,
    pub poll_failures: u64,
    pub publish_total: u64,
    pub publish_successful: u64,
    pub publish_failed: u64,
    pub publish_throttled: u64,
    pub breaker_trips: u64,
    pub cache_hit_rate: f64,
}

impl GatewayMetrics {
    pub fn combine(poll: PollMetrics, publish: PublisherMetrics) -> Self {
        let cache_total = publish.cache_hits + publish.cache_misses;
        let cache_hit_rate = if cache_total == 0 { 0.0 } else { publish.cache_hits as f64 / cache_total as f64 };
        Self {
            poll_successes: poll.successes,
            poll_failures: poll.failures,
            publish_total: publish.total,
            publish_successful: publish.successful,
            publish_failed: publish.failed,
            publish_throttled: publish.throttled,
            breaker_trips: publish.breaker_trips,
            cache_hit_rate,
        }
    }
}

/// Latest BMS sample, CVL state and energy counters, plus the publisher's
/// metrics rollup at the moment the snapshot was taken.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GatewaySnapshot {
    pub ts_ms: u64,
    pub soc_pct: f32,
    pub soh_pct: f32,
    pub pack_voltage_v: f32,
    pub pack_current_a: f32,
    pub min_cell_mv: u16,
    pub max_cell_mv: u16,
    pub cvl_v: f32,
    pub ccl_a: f32,
    pub dcl_a: f32,
    pub charged_wh: f64,
    pub discharged_wh: f64,
    pub metrics: GatewayMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hit_rate_is_zero_with_no_samples() {
        let m = GatewayMetrics::combine(PollMetrics::default(), PublisherMetrics::default());
        assert_eq!(m.cache_hit_rate, 0.0);
    }

    #[test]
    fn cache_hit_rate_reflects_hits_over_total() {
        let publish = PublisherMetrics { cache_hits: 3, cache_misses: 1, ..Default::default() };
        let m = GatewayMetrics::combine(PollMetrics::default(), publish);
        assert_eq!(m.cache_hit_rate, 0.75);
    }

    #[test]
    fn combine_carries_poll_and_publish_counters_through() {
        let poll = PollMetrics { successes: 10, failures: 2 };
        let publish = PublisherMetrics { total: 5, successful: 4, failed: 1, throttled: 0, breaker_trips: 0, ..Default::default() };
        let m = GatewayMetrics::combine(poll, publish);
        assert_eq!(m.poll_successes, 10);
        assert_eq!(m.poll_failures, 2);
        assert_eq!(m.publish_total, 5);
        assert_eq!(m.publish_successful, 4);
        assert_eq!(m.publish_failed, 1);
    }
}
