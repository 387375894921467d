use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use super::scope::CancellationScope;
use crate::{
    engine::GenerationSession,
    error::GenerationError,
    metrics::{LatencyStats, MetricsAggregator, EXPECTED_TOKENS_PER_QUERY},
    publish::SnapshotPublisher,
    types::{QuerySnapshot, QueryStatus},
};

/// What one pass of the generation loop produced
pub(crate) struct GenerationRun {
    pub(crate) status: QueryStatus,
    pub(crate) text: String,
    pub(crate) token_count: usize,
    pub(crate) metrics: Option<LatencyStats>,
    pub(crate) error: Option<GenerationError>,
}

/// Drain the engine's token stream on the calling (blocking) thread.
///
/// The cancellation signal is checked after every pull; a token that arrives
/// after cancellation is discarded, everything appended before it is kept.
/// Latency excludes the time spent handing the snapshot over.
pub(crate) fn run_generation<S: GenerationSession>(
    session: S,
    prompt: Arc<str>,
    scope: &CancellationScope,
    publisher: &SnapshotPublisher,
) -> GenerationRun {
    let query_id = scope.id();
    let mut tokens = session.generate(&prompt, scope.token().clone());

    let mut text = String::new();
    let mut token_count = 0;
    let mut aggregator = MetricsAggregator::with_capacity(EXPECTED_TOKENS_PER_QUERY);
    let mut metrics = None;
    let mut started = Instant::now();

    let (status, error) = loop {
        let next = tokens.next();
        let latency = started.elapsed();

        if scope.is_cancelled() {
            debug!(%query_id, tokens = token_count, "Query cancelled");
            break (QueryStatus::Cancelled, None);
        }

        match next {
            None => break (QueryStatus::Completed, None),
            Some(Err(error)) => {
                warn!(%query_id, tokens = token_count, error = %error, "Token stream failed");
                break (QueryStatus::Failed, Some(error));
            }
            Some(Ok(token)) => {
                trace!(%query_id, token = %token, "Token");
                text.push_str(&token);
                token_count += 1;

                aggregator.record_duration(latency);
                if aggregator.len() >= 2 {
                    metrics = aggregator.stats();
                }

                publisher.publish(QuerySnapshot {
                    query_id,
                    prompt: Arc::clone(&prompt),
                    text: text.clone(),
                    token_count,
                    metrics,
                });
                started = Instant::now();
            }
        }
    };

    // Release engine resources before the scope reports the loop as exited.
    drop(tokens);

    GenerationRun {
        status,
        text,
        token_count,
        metrics,
        error,
    }
}
