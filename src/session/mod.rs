//! Single-flight query orchestration
//!
//! A [`QuerySession`] owns at most one running query. Issuing a new query
//! first cancels the running one and waits for its generation loop to exit,
//! so two loops never pull from the engine at the same time and the text of
//! one query never leaks into the next.
//!
//! The generation loop runs on the blocking thread pool (the compute
//! context). Snapshots travel over a bounded channel to one presentation
//! thread, which is the only place sinks are called from.

mod builder;
mod generation;
mod scope;

pub use builder::SessionBuilder;
pub use scope::QueryDrain;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{error, info, info_span, warn};

use crate::{
    config::{GenerateOptions, ModelOptions, SessionConfig},
    engine::{GenerationEngine, ModelHandle},
    error::{Result, ServiceError},
    metrics::{LatencyStats, QueryCounters, SessionMetrics},
    publish::{SinkRegistry, SnapshotPublisher, Subscription, SubscriptionId, TextUpdateSink},
    types::{QueryOutcome, QueryPhase, QuerySnapshot, QueryStatus},
};

use generation::run_generation;
use scope::{CancellationScope, SessionState};

/// Orchestrates queries against one engine and one loaded model
pub struct QuerySession<E: GenerationEngine> {
    inner: Arc<SessionInner<E>>,
}

struct SessionInner<E: GenerationEngine> {
    engine: E,
    config: SessionConfig,
    loaded: RwLock<Option<LoadedModel<E::Model>>>,
    state: Arc<Mutex<SessionState>>,
    /// Serialises the cancel-then-install step of concurrent `query` calls
    gate: tokio::sync::Mutex<()>,
    registry: Arc<SinkRegistry>,
    publisher: Arc<SnapshotPublisher>,
    counters: Option<QueryCounters>,
}

struct LoadedModel<M> {
    handle: ModelHandle<M>,
    generate_options: GenerateOptions,
}

impl<E: GenerationEngine> Clone for QuerySession<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: GenerationEngine> QuerySession<E> {
    /// Create a new session builder
    pub fn builder(engine: E) -> SessionBuilder<E> {
        SessionBuilder::new(engine)
    }

    pub(crate) fn new(engine: E, config: SessionConfig) -> Result<Self> {
        let registry = Arc::new(SinkRegistry::new());
        let publisher = SnapshotPublisher::spawn(&config.publish, Arc::clone(&registry))?;
        let counters = config.monitoring.enable_metrics.then(QueryCounters::new);

        Ok(Self {
            inner: Arc::new(SessionInner {
                engine,
                config,
                loaded: RwLock::new(None),
                state: Arc::new(Mutex::new(SessionState::new())),
                gate: tokio::sync::Mutex::new(()),
                registry,
                publisher: Arc::new(publisher),
                counters,
            }),
        })
    }

    /// Configuration the session was built with
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// The engine queries are run against
    pub fn engine(&self) -> &E {
        &self.inner.engine
    }

    /// Load a model and remember the sampling options for later queries.
    ///
    /// On failure the previously loaded model, if any, stays in place.
    pub fn load_model(
        &self,
        model_options: ModelOptions,
        generate_options: GenerateOptions,
        path: impl AsRef<Path>,
    ) -> Result<()> {
        let path = self.inner.config.resolve_model_path(path);
        let started = Instant::now();

        let model = self
            .inner
            .engine
            .load(&path, &model_options)
            .map_err(|e| {
                warn!(path = %path.display(), error = %e, "Model load failed");
                e
            })?;

        let load_time = started.elapsed();
        info!(
            path = %path.display(),
            elapsed_ms = load_time.as_millis() as u64,
            "Model loaded"
        );

        *self.inner.loaded.write() = Some(LoadedModel {
            handle: ModelHandle::new(model, path, model_options, load_time),
            generate_options,
        });
        Ok(())
    }

    /// Handle of the currently loaded model
    pub fn model(&self) -> Option<ModelHandle<E::Model>> {
        self.inner.loaded.read().as_ref().map(|l| l.handle.clone())
    }

    /// Run a query to completion, cancellation or failure.
    ///
    /// Any running query is cancelled and drained first. Snapshots are
    /// delivered to subscribers before this returns. A cancelled query is not
    /// an error: its partial text comes back with [`QueryStatus::Cancelled`].
    pub async fn query(&self, prompt: impl Into<String>) -> Result<QueryOutcome> {
        let prompt: Arc<str> = Arc::from(prompt.into());
        let inner = &self.inner;

        let (scope, session) = {
            let _gate = inner.gate.lock().await;
            self.cancel().await;

            let session = {
                let loaded = inner.loaded.read();
                let loaded = loaded.as_ref().ok_or(ServiceError::ModelNotLoaded)?;
                inner
                    .engine
                    .create_session(&loaded.handle, &loaded.generate_options)
            };
            (CancellationScope::begin(&inner.state)?, session)
        };

        let query_id = scope.id();
        if let Some(counters) = &inner.counters {
            counters.record_started();
        }
        info!(%query_id, prompt_len = prompt.len(), "Query started");

        // Dropping this future before the run ends cancels the run.
        let cancel_on_drop = scope.token().clone().drop_guard();

        let run_inner = Arc::clone(inner);
        let (flush_tx, flushed) = oneshot::channel();
        let joined = tokio::task::spawn_blocking(move || {
            let mut scope = scope;
            let span = info_span!("query", id = %scope.id());
            let _enter = span.enter();

            let run = run_generation(session, prompt, &scope, &run_inner.publisher);
            scope.set_status(run.status);
            run_inner.record_finished(run.status, run.token_count, run.metrics.as_ref());
            run_inner.publisher.flush(flush_tx);
            run
        })
        .await;

        let run = match joined {
            Ok(run) => run,
            Err(e) => {
                error!(%query_id, error = %e, "Generation task failed");
                inner.record_finished(QueryStatus::Failed, 0, None);
                return Err(ServiceError::TaskFailed {
                    message: e.to_string(),
                });
            }
        };

        // Resolves once the presentation side has shown everything this query produced.
        let _ = flushed.await;
        cancel_on_drop.disarm();

        if let Some(source) = run.error {
            return Err(ServiceError::Generation {
                query_id,
                partial_text: run.text,
                source,
            });
        }

        info!(
            %query_id,
            status = ?run.status,
            tokens = run.token_count,
            mean_ms = ?run.metrics.and_then(|m| m.summary).map(|s| s.mean),
            "Query finished"
        );

        Ok(QueryOutcome {
            query_id,
            status: run.status,
            text: run.text,
            token_count: run.token_count,
            metrics: run.metrics,
        })
    }

    /// Signal the running query, if any, and return a future that completes
    /// once its generation loop has exited.
    pub fn cancel(&self) -> QueryDrain {
        QueryDrain::new(self.inner.state.lock().request_cancel())
    }

    /// Cancel the running query and wait for it to drain; a no-op when idle
    pub async fn cancel_query(&self) {
        self.cancel().await;
    }

    /// `Running` while a generation loop is active
    pub fn phase(&self) -> QueryPhase {
        self.inner.state.lock().phase()
    }

    /// How the most recent query ended
    pub fn last_status(&self) -> Option<QueryStatus> {
        self.inner.state.lock().last_status()
    }

    /// The snapshot currently on display
    pub fn last_snapshot(&self) -> Option<QuerySnapshot> {
        self.inner.publisher.latest()
    }

    /// Session counters, when metrics are enabled
    pub fn stats(&self) -> Option<SessionMetrics> {
        self.inner.counters.as_ref().map(QueryCounters::snapshot)
    }

    /// Register a sink; it stays subscribed while the returned guard lives
    pub fn subscribe<S: TextUpdateSink + 'static>(&self, sink: S) -> Subscription {
        self.subscribe_shared(Arc::new(sink))
    }

    /// Register a sink that is also held elsewhere
    pub fn subscribe_shared(&self, sink: Arc<dyn TextUpdateSink>) -> Subscription {
        let id = self.inner.registry.insert(sink);
        Subscription::new(id, &self.inner.registry)
    }

    /// Remove a sink registered through a detached [`Subscription`]
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.registry.remove(id)
    }

    /// Number of registered sinks
    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Cancel any running query, deliver outstanding snapshots and stop the
    /// presentation thread. Queries issued afterwards still run but publish
    /// nothing.
    pub async fn shutdown(&self) {
        self.cancel_query().await;

        let publisher = Arc::clone(&self.inner.publisher);
        if let Err(e) = tokio::task::spawn_blocking(move || publisher.shutdown()).await {
            warn!(error = %e, "Presentation shutdown failed");
        }

        if let Some(snapshot) = self.last_snapshot() {
            info!(
                transcript = %snapshot.transcript(&self.inner.config.assistant_label),
                "Final transcript"
            );
        }
    }
}

impl<E: GenerationEngine> SessionInner<E> {
    fn record_finished(&self, status: QueryStatus, tokens: usize, stats: Option<&LatencyStats>) {
        if let Some(counters) = &self.counters {
            counters.record_finished(status, tokens, stats);
        }
    }
}
