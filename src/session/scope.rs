use std::future::IntoFuture;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::{Result, ServiceError},
    types::{QueryId, QueryPhase, QueryStatus},
};

/// Shared state machine of a session: `Idle -> Running -> Idle`
#[derive(Debug)]
pub(crate) struct SessionState {
    phase: QueryPhase,
    active: Option<ActiveQuery>,
    next_id: u64,
    last_status: Option<QueryStatus>,
}

#[derive(Debug)]
struct ActiveQuery {
    id: QueryId,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl SessionState {
    pub(crate) fn new() -> Self {
        Self {
            phase: QueryPhase::Idle,
            active: None,
            next_id: 0,
            last_status: None,
        }
    }

    pub(crate) fn phase(&self) -> QueryPhase {
        self.phase
    }

    pub(crate) fn last_status(&self) -> Option<QueryStatus> {
        self.last_status
    }

    fn transition(&mut self, to: QueryPhase) -> Result<()> {
        match (self.phase, to) {
            (QueryPhase::Idle, QueryPhase::Running) | (QueryPhase::Running, QueryPhase::Idle) => {
                debug!(from = ?self.phase, to = ?to, "Session transition");
                self.phase = to;
                Ok(())
            }
            (from, to) => Err(ServiceError::InvalidTransition { from, to }),
        }
    }

    /// Signal the live scope, if any, and hand back its completion flag
    pub(crate) fn request_cancel(&self) -> Option<watch::Receiver<bool>> {
        let active = self.active.as_ref()?;
        if !active.cancel.is_cancelled() {
            debug!(query_id = %active.id, "Cancellation requested");
            active.cancel.cancel();
        }
        Some(active.done.clone())
    }

    fn finish(&mut self, id: QueryId, status: QueryStatus) {
        if self.active.as_ref().map(|a| a.id) != Some(id) {
            return;
        }
        self.active = None;
        self.last_status = Some(status);
        if let Err(e) = self.transition(QueryPhase::Idle) {
            debug!(error = %e, "Ignoring transition on finish");
        }
    }
}

/// The one in-flight query of a session.
///
/// Dropping the scope releases it unconditionally, records the terminal
/// status and wakes every [`QueryDrain`] waiting on it.
pub(crate) struct CancellationScope {
    id: QueryId,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
    state: Arc<Mutex<SessionState>>,
    status: QueryStatus,
}

impl CancellationScope {
    /// Install a new scope; only permitted while the session is idle
    pub(crate) fn begin(state: &Arc<Mutex<SessionState>>) -> Result<Self> {
        let mut guard = state.lock();
        guard.transition(QueryPhase::Running)?;

        guard.next_id += 1;
        let id = QueryId::new(guard.next_id);
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        guard.active = Some(ActiveQuery {
            id,
            cancel: cancel.clone(),
            done: done_rx,
        });

        Ok(Self {
            id,
            cancel,
            done: done_tx,
            state: Arc::clone(state),
            status: QueryStatus::Failed,
        })
    }

    pub(crate) fn id(&self) -> QueryId {
        self.id
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Status recorded on release; defaults to `Failed`
    pub(crate) fn set_status(&mut self, status: QueryStatus) {
        self.status = status;
    }
}

impl Drop for CancellationScope {
    fn drop(&mut self) {
        self.state.lock().finish(self.id, self.status);
        self.done.send_replace(true);
    }
}

/// Completes once the query that was running at cancellation time has exited.
///
/// Resolves immediately when the session was idle.
#[must_use = "a QueryDrain does nothing unless awaited"]
#[derive(Debug)]
pub struct QueryDrain {
    done: Option<watch::Receiver<bool>>,
}

impl QueryDrain {
    pub(crate) fn new(done: Option<watch::Receiver<bool>>) -> Self {
        Self { done }
    }

    /// True when there was nothing to cancel
    pub fn is_idle(&self) -> bool {
        self.done.is_none()
    }

    /// Wait for the drained query to exit
    pub async fn wait(self) {
        if let Some(mut done) = self.done {
            // A dropped sender also means the scope is gone.
            let _ = done.wait_for(|finished| *finished).await;
        }
    }
}

impl IntoFuture for QueryDrain {
    type Output = ();
    type IntoFuture = BoxFuture<'static, ()>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait().boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_scope_life_cycle() {
        let state = Arc::new(Mutex::new(SessionState::new()));

        let mut scope = CancellationScope::begin(&state).unwrap();
        assert_eq!(scope.id(), QueryId::new(1));
        assert_eq!(state.lock().phase(), QueryPhase::Running);

        scope.set_status(QueryStatus::Completed);
        drop(scope);

        let guard = state.lock();
        assert_eq!(guard.phase(), QueryPhase::Idle);
        assert_eq!(guard.last_status(), Some(QueryStatus::Completed));
        assert!(guard.request_cancel().is_none());
    }

    #[test]
    fn test_second_scope_rejected_while_running() {
        let state = Arc::new(Mutex::new(SessionState::new()));
        let _scope = CancellationScope::begin(&state).unwrap();

        assert!(matches!(
            CancellationScope::begin(&state),
            Err(ServiceError::InvalidTransition {
                from: QueryPhase::Running,
                to: QueryPhase::Running
            })
        ));
    }

    #[test]
    fn test_released_as_failed_by_default() {
        let state = Arc::new(Mutex::new(SessionState::new()));
        drop(CancellationScope::begin(&state).unwrap());
        assert_eq!(state.lock().last_status(), Some(QueryStatus::Failed));
        assert_eq!(state.lock().phase(), QueryPhase::Idle);
    }

    #[tokio::test]
    async fn test_drain_waits_for_release() {
        let state = Arc::new(Mutex::new(SessionState::new()));
        let scope = CancellationScope::begin(&state).unwrap();

        let drain = QueryDrain::new(state.lock().request_cancel());
        assert!(!drain.is_idle());
        assert!(scope.is_cancelled());

        let waiter = tokio::spawn(drain.into_future());
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(scope);
        tokio_test::assert_ok!(waiter.await);
        assert_eq!(state.lock().phase(), QueryPhase::Idle);
    }

    #[tokio::test]
    async fn test_idle_drain_resolves_immediately() {
        QueryDrain::new(None).await;
        QueryDrain::new(None).wait().await;
    }
}
