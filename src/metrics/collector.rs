use std::time::Instant;

use parking_lot::Mutex;

use super::types::{LatencyStats, SessionMetrics};
use crate::types::QueryStatus;

/// Collects per-session query totals
#[derive(Debug)]
pub struct QueryCounters {
    state: Mutex<CounterState>,
    start_time: Instant,
}

#[derive(Debug, Default)]
struct CounterState {
    started: usize,
    completed: usize,
    cancelled: usize,
    failed: usize,
    total_tokens: usize,
    last_mean_latency_ms: Option<f64>,
}

impl QueryCounters {
    /// Zeroed counters; uptime starts now
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CounterState::default()),
            start_time: Instant::now(),
        }
    }

    /// Count a query that entered `Running`
    pub fn record_started(&self) {
        self.state.lock().started += 1;
    }

    /// Record how a query ended and how many tokens it kept
    pub fn record_finished(&self, status: QueryStatus, tokens: usize, stats: Option<&LatencyStats>) {
        let mut state = self.state.lock();
        match status {
            QueryStatus::Completed => state.completed += 1,
            QueryStatus::Cancelled => state.cancelled += 1,
            QueryStatus::Failed => state.failed += 1,
        }
        state.total_tokens += tokens;

        if let Some(summary) = stats.and_then(|s| s.summary) {
            state.last_mean_latency_ms = Some(summary.mean);
        }
    }

    /// Current totals
    pub fn snapshot(&self) -> SessionMetrics {
        let state = self.state.lock();
        SessionMetrics {
            uptime: self.start_time.elapsed(),
            queries_started: state.started,
            queries_completed: state.completed,
            queries_cancelled: state.cancelled,
            queries_failed: state.failed,
            total_tokens: state.total_tokens,
            last_mean_latency_ms: state.last_mean_latency_ms,
        }
    }
}

impl Default for QueryCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::summarize;

    #[test]
    fn test_outcome_tracking() {
        let counters = QueryCounters::new();

        counters.record_started();
        counters.record_finished(QueryStatus::Completed, 4, summarize(&[9.0, 2.0, 4.0]).as_ref());
        counters.record_started();
        counters.record_finished(QueryStatus::Cancelled, 1, None);
        counters.record_started();
        counters.record_finished(QueryStatus::Failed, 0, None);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.queries_started, 3);
        assert_eq!(snapshot.queries_completed, 1);
        assert_eq!(snapshot.queries_cancelled, 1);
        assert_eq!(snapshot.queries_failed, 1);
        assert_eq!(snapshot.total_tokens, 5);
        assert_eq!(snapshot.last_mean_latency_ms, Some(3.0));
    }
}
