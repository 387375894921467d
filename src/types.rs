//! Common type definitions used throughout the session layer

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::metrics::LatencyStats;

/// Identifier of one query, unique within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueryId(u64);

impl QueryId {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    /// Numeric value, increasing per session
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Life-cycle phase of a [`QuerySession`](crate::QuerySession)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryPhase {
    /// No query running
    Idle,
    /// A generation loop is active
    Running,
}

/// How a query terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryStatus {
    /// The engine's token stream ended on its own
    Completed,
    /// A caller requested early termination
    Cancelled,
    /// The engine raised an error mid-stream
    Failed,
}

/// Ordered `(text, metrics)` update published to presentation sinks.
///
/// Within one query each snapshot's `text` extends the previous one.
#[derive(Debug, Clone, Serialize)]
pub struct QuerySnapshot {
    /// Query that produced this snapshot
    pub query_id: QueryId,
    /// Prompt the query was issued with
    pub prompt: Arc<str>,
    /// Text generated so far, in engine order
    pub text: String,
    /// Tokens appended so far
    pub token_count: usize,
    /// Latency statistics, present once two samples exist
    pub metrics: Option<LatencyStats>,
}

impl QuerySnapshot {
    /// Render the prompt and response the way a chat display shows them
    pub fn transcript(&self, assistant_label: &str) -> String {
        format!(
            "Prompt: {}\n\n{}:  \n{}",
            self.prompt, assistant_label, self.text
        )
    }
}

/// Final result of a query that did not fail
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    /// Query this outcome belongs to
    pub query_id: QueryId,
    /// How the query ended
    pub status: QueryStatus,
    /// Everything generated before the query ended
    pub text: String,
    /// Tokens in `text`
    pub token_count: usize,
    /// Statistics as of the last kept token
    pub metrics: Option<LatencyStats>,
}

impl QueryOutcome {
    /// True when the query was cut short by cancellation
    pub fn is_cancelled(&self) -> bool {
        self.status == QueryStatus::Cancelled
    }
}
