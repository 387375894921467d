use std::time::Duration;

use super::types::{LatencyStats, LatencySummary};

/// Accumulates the per-token latency series of one query.
///
/// Statistics are recomputed over the full history on every call; a query
/// produces at most a few hundred samples.
#[derive(Debug, Clone, Default)]
pub struct MetricsAggregator {
    samples: Vec<f64>,
}

impl MetricsAggregator {
    /// Empty series
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty series with room for `capacity` samples
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    /// Append one latency sample in milliseconds
    pub fn record(&mut self, latency_ms: f64) {
        self.samples.push(latency_ms);
    }

    /// Append one latency sample
    pub fn record_duration(&mut self, latency: Duration) {
        self.record(latency.as_secs_f64() * 1000.0);
    }

    /// Number of samples recorded
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True before the first sample
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Raw samples in milliseconds, in arrival order
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Forget every sample
    pub fn reset(&mut self) {
        self.samples.clear();
    }

    /// Unrounded statistics over everything recorded so far
    pub fn stats(&self) -> Option<LatencyStats> {
        summarize(&self.samples)
    }
}

/// Compute latency statistics for an ordered series of samples (ms).
///
/// The first sample is reported as `first` and excluded from every
/// aggregate. An empty series yields `None`; a single sample yields stats
/// without a summary.
pub fn summarize(samples: &[f64]) -> Option<LatencyStats> {
    let (&first, rest) = samples.split_first()?;
    let current = *samples.last()?;

    Some(LatencyStats {
        first,
        current,
        summary: summarize_steady_state(rest),
    })
}

fn summarize_steady_state(samples: &[f64]) -> Option<LatencySummary> {
    if samples.is_empty() {
        return None;
    }

    let count = samples.len();
    let mean = samples.iter().sum::<f64>() / count as f64;
    let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let median = if count % 2 == 0 {
        (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
    } else {
        sorted[count / 2]
    };

    Some(LatencySummary {
        count,
        mean,
        median,
        min: sorted[0],
        max: sorted[count - 1],
        std_dev: variance.sqrt(),
    })
}
