use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::types::QuerySnapshot;

/// Presentation-side subscriber.
///
/// Sinks are only ever invoked from the session's presentation dispatcher,
/// one snapshot at a time, in production order.
pub trait TextUpdateSink: Send + Sync {
    /// Called with every delivered snapshot
    fn on_update(&self, snapshot: &QuerySnapshot);
}

impl<F> TextUpdateSink for F
where
    F: Fn(&QuerySnapshot) + Send + Sync,
{
    fn on_update(&self, snapshot: &QuerySnapshot) {
        self(snapshot)
    }
}

/// Identifies one registered sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Registered sinks, keyed by subscription order
#[derive(Default)]
pub(crate) struct SinkRegistry {
    sinks: DashMap<SubscriptionId, Arc<dyn TextUpdateSink>>,
    next_id: AtomicU64,
}

impl SinkRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, sink: Arc<dyn TextUpdateSink>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks.insert(id, sink);
        id
    }

    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        self.sinks.remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Deliver to every sink in subscription order.
    ///
    /// The sinks are cloned out first so a sink may unsubscribe from inside
    /// its own callback.
    pub(crate) fn notify(&self, snapshot: &QuerySnapshot) {
        let mut sinks: Vec<(SubscriptionId, Arc<dyn TextUpdateSink>)> = self
            .sinks
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        sinks.sort_by_key(|(id, _)| *id);

        for (_, sink) in sinks {
            sink.on_update(snapshot);
        }
    }
}

/// Keeps a sink subscribed for as long as it is alive
#[must_use = "dropping a Subscription unsubscribes its sink"]
pub struct Subscription {
    id: SubscriptionId,
    registry: Weak<SinkRegistry>,
    detached: bool,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, registry: &Arc<SinkRegistry>) -> Self {
        Self {
            id,
            registry: Arc::downgrade(registry),
            detached: false,
        }
    }

    /// Identifier of the guarded sink
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Keep the sink registered after this guard is dropped; remove it later
    /// with [`QuerySession::unsubscribe`](crate::QuerySession::unsubscribe)
    pub fn detach(mut self) -> SubscriptionId {
        self.detached = true;
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("detached", &self.detached)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueryId;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn snapshot(text: &str) -> QuerySnapshot {
        QuerySnapshot {
            query_id: QueryId::new(1),
            prompt: Arc::from("p"),
            text: text.to_string(),
            token_count: 1,
            metrics: None,
        }
    }

    #[test]
    fn test_guard_unsubscribes_on_drop() {
        let registry = Arc::new(SinkRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink_seen = Arc::clone(&seen);
        let id = registry.insert(Arc::new(move |s: &QuerySnapshot| {
            sink_seen.lock().push(s.text.clone());
        }));
        let guard = Subscription::new(id, &registry);

        registry.notify(&snapshot("a"));
        drop(guard);
        registry.notify(&snapshot("ab"));

        assert_eq!(*seen.lock(), vec!["a".to_string()]);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_detached_subscription_survives() {
        let registry = Arc::new(SinkRegistry::new());
        let id = registry.insert(Arc::new(|_: &QuerySnapshot| {}));
        let detached = Subscription::new(id, &registry).detach();

        assert_eq!(detached, id);
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
    }

    #[test]
    fn test_notify_in_subscription_order() {
        let registry = Arc::new(SinkRegistry::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            registry.insert(Arc::new(move |_: &QuerySnapshot| order.lock().push(label)));
        }

        registry.notify(&snapshot("x"));
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }
}
