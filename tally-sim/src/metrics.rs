//! Latency and outcome metrics for simulation runs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Metrics collected over one run
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    /// Per-call latencies in microseconds
    pub latencies_us: Vec<u64>,
    /// Call outcomes by label
    pub outcomes: BTreeMap<String, u64>,
}

/// Summary statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_calls: usize,
    pub min_latency_us: u64,
    pub avg_latency_us: f64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub max_latency_us: u64,
}

/// Full metrics export format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsExport {
    pub scenario: String,
    pub outcomes: BTreeMap<String, u64>,
    pub summary: MetricsSummary,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, latency: Duration, outcome: &str) {
        self.latencies_us.push(latency.as_micros() as u64);
        *self.outcomes.entry(outcome.to_string()).or_insert(0) += 1;
    }

    pub fn outcome(&self, label: &str) -> u64 {
        self.outcomes.get(label).copied().unwrap_or(0)
    }

    /// Merge another collector into this one
    pub fn absorb(&mut self, other: Metrics) {
        self.latencies_us.extend(other.latencies_us);
        for (label, count) in other.outcomes {
            *self.outcomes.entry(label).or_insert(0) += count;
        }
    }

    /// Nearest-rank percentile over sorted values
    fn percentile(sorted: &[u64], p: f64) -> u64 {
        if sorted.is_empty() {
            return 0;
        }
        let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        sorted[rank.clamp(1, sorted.len()) - 1]
    }

    pub fn summary(&self) -> MetricsSummary {
        let mut sorted = self.latencies_us.clone();
        sorted.sort_unstable();

        let avg_latency_us = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<u64>() as f64 / sorted.len() as f64
        };

        MetricsSummary {
            total_calls: sorted.len(),
            min_latency_us: sorted.first().copied().unwrap_or(0),
            avg_latency_us,
            p50_latency_us: Self::percentile(&sorted, 50.0),
            p95_latency_us: Self::percentile(&sorted, 95.0),
            max_latency_us: sorted.last().copied().unwrap_or(0),
        }
    }

    pub fn export(&self, scenario: &str) -> MetricsExport {
        MetricsExport {
            scenario: scenario.to_string(),
            outcomes: self.outcomes.clone(),
            summary: self.summary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_basic() {
        let mut metrics = Metrics::new();
        metrics.record(Duration::from_micros(100), "accepted");
        metrics.record(Duration::from_micros(200), "accepted");
        metrics.record(Duration::from_micros(300), "duplicate");

        let summary = metrics.summary();
        assert_eq!(summary.total_calls, 3);
        assert_eq!(summary.min_latency_us, 100);
        assert_eq!(summary.max_latency_us, 300);
        assert!((summary.avg_latency_us - 200.0).abs() < 1.0);
        assert_eq!(metrics.outcome("accepted"), 2);
        assert_eq!(metrics.outcome("missing"), 0);
    }

    #[test]
    fn test_percentiles() {
        let mut metrics = Metrics::new();
        for i in 1..=100 {
            metrics.record(Duration::from_micros(i), "accepted");
        }

        let summary = metrics.summary();
        assert_eq!(summary.p50_latency_us, 50);
        assert_eq!(summary.p95_latency_us, 95);
    }

    #[test]
    fn test_absorb_merges_outcomes() {
        let mut a = Metrics::new();
        a.record(Duration::from_micros(1), "accepted");
        let mut b = Metrics::new();
        b.record(Duration::from_micros(2), "accepted");
        b.record(Duration::from_micros(3), "unavailable");

        a.absorb(b);
        assert_eq!(a.latencies_us.len(), 3);
        assert_eq!(a.outcome("accepted"), 2);
        assert_eq!(a.export("x").summary.total_calls, 3);
    }
}
