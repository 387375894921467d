use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-token latency statistics, in milliseconds.
///
/// `first` carries the prompt-processing cost and is kept out of `summary`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    /// Latency of the first token
    pub first: f64,
    /// Latency of the most recent token
    pub current: f64,
    /// Aggregates over every sample after the first; `None` for one-token runs
    pub summary: Option<LatencySummary>,
}

/// Aggregates over the samples that follow the first one
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    /// Samples aggregated (all but the first)
    pub count: usize,
    /// Arithmetic mean
    pub mean: f64,
    /// Median; the mean of the two central values for even counts
    pub median: f64,
    /// Smallest sample
    pub min: f64,
    /// Largest sample
    pub max: f64,
    /// Population standard deviation
    pub std_dev: f64,
}

pub(crate) fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

impl LatencyStats {
    /// Copy with every value rounded to one decimal place
    pub fn rounded(&self) -> Self {
        Self {
            first: round_tenth(self.first),
            current: round_tenth(self.current),
            summary: self.summary.map(|s| LatencySummary {
                count: s.count,
                mean: round_tenth(s.mean),
                median: round_tenth(s.median),
                min: round_tenth(s.min),
                max: round_tenth(s.max),
                std_dev: round_tenth(s.std_dev),
            }),
        }
    }

    /// Throughput implied by the mean steady-state latency
    pub fn tokens_per_second(&self) -> Option<f64> {
        self.summary
            .filter(|s| s.mean > 0.0)
            .map(|s| 1000.0 / s.mean)
    }
}

impl fmt::Display for LatencyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.rounded();
        writeln!(f, "CURR:   {:.1}", stats.current)?;
        if let Some(summary) = stats.summary {
            writeln!(f, "MEAN:   {:.1}", summary.mean)?;
            writeln!(f, "MEDIAN: {:.1}", summary.median)?;
            writeln!(f, "MIN:    {:.1}", summary.min)?;
            writeln!(f, "MAX:    {:.1}", summary.max)?;
            writeln!(f, "STD:    {:.1}", summary.std_dev)?;
        }
        writeln!(f, "FIRST:    {:.1}", stats.first)?;
        write!(f, "(in ms/Token)")
    }
}

/// Totals for one session across all of its queries
#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    /// Time since the session was built
    pub uptime: Duration,
    /// Queries that entered `Running`
    pub queries_started: usize,
    /// Queries whose token stream ended on its own
    pub queries_completed: usize,
    /// Queries ended by cancellation
    pub queries_cancelled: usize,
    /// Queries ended by an engine error
    pub queries_failed: usize,
    /// Tokens kept across all queries
    pub total_tokens: usize,
    /// Mean steady-state latency of the last query that produced a summary
    pub last_mean_latency_ms: Option<f64>,
}
