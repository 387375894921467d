//! Token latency statistics and session counters

mod aggregator;
mod collector;
mod types;

pub use aggregator::{summarize, MetricsAggregator};
pub use collector::QueryCounters;
pub use types::{LatencyStats, LatencySummary, SessionMetrics};

/// Initial capacity of a query's latency series
pub(crate) const EXPECTED_TOKENS_PER_QUERY: usize = 256;
