//! LLM Query Session - single-flight orchestration of streaming LLM queries
//!
//! A [`QuerySession`] wraps a token-generating [`GenerationEngine`]. Each query
//! supersedes the one before it: the running query is cancelled and drained
//! before the next starts. Tokens are pulled on the blocking thread pool, and
//! growing-text snapshots with per-token latency statistics are delivered to
//! subscribers on a dedicated presentation thread.
//!
//! ```no_run
//! use llm_query_session::{
//!     engine::scripted::ScriptedEngine, GenerateOptions, ModelOptions, QuerySession, QuerySnapshot,
//! };
//!
//! # async fn run() -> llm_query_session::Result<()> {
//! let session = QuerySession::builder(ScriptedEngine::from_text("Hello there")).build()?;
//! session.load_model(ModelOptions::default(), GenerateOptions::default(), "13q4.gguf")?;
//!
//! let _subscription = session.subscribe(|snapshot: &QuerySnapshot| println!("{}", snapshot.text));
//! let outcome = session.query("Say hello").await?;
//! println!("{:?}: {}", outcome.status, outcome.text);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod types;

mod publish;
mod session;
mod utils;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-exports for public API
pub use config::{
    GenerateOptions, LogLevel, Mirostat, ModelOptions, MonitoringConfig, PublishConfig,
    SessionConfig,
};
pub use engine::{GenerationEngine, GenerationSession, ModelHandle, TokenStream};
pub use error::{GenerationError, LoadError, Result, ServiceError};
pub use metrics::{LatencyStats, LatencySummary, MetricsAggregator, SessionMetrics};
pub use publish::{Subscription, SubscriptionId, TextUpdateSink};
pub use session::{QueryDrain, QuerySession, SessionBuilder};
pub use types::{QueryId, QueryOutcome, QueryPhase, QuerySnapshot, QueryStatus};
pub use utils::{setup_logging, LogConfig};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_numbers() {
        assert!(!VERSION.is_empty());
    }
}
