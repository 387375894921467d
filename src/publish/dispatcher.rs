// Location: src/publish/dispatcher.rs

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::subscription::SinkRegistry;
use crate::{
    config::PublishConfig,
    error::{Result, ServiceError},
    types::QuerySnapshot,
};

enum PublishMessage {
    Snapshot(QuerySnapshot),
    /// Acknowledged once everything sent before it has been delivered
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Hands snapshots from the compute side to a single presentation thread.
///
/// The compute side only ever enqueues; the presentation thread decides
/// when sinks see an update, optionally coalescing bursts.
pub(crate) struct SnapshotPublisher {
    tx: Sender<PublishMessage>,
    latest: Arc<RwLock<Option<QuerySnapshot>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SnapshotPublisher {
    pub(crate) fn spawn(config: &PublishConfig, registry: Arc<SinkRegistry>) -> Result<Self> {
        let (tx, rx) = bounded(config.channel_capacity);
        let latest = Arc::new(RwLock::new(None));

        let dispatcher = Dispatcher {
            rx,
            registry,
            latest: Arc::clone(&latest),
            coalesce: config.coalesce_interval(),
            pending: None,
            last_delivery: None,
        };

        let worker = thread::Builder::new()
            .name("presentation".into())
            .spawn(move || dispatcher.run())
            .map_err(|e| ServiceError::TaskFailed {
                message: format!("failed to spawn presentation thread: {}", e),
            })?;

        Ok(Self {
            tx,
            latest,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue a snapshot; blocks while the channel is full
    pub(crate) fn publish(&self, snapshot: QuerySnapshot) {
        if self.tx.send(PublishMessage::Snapshot(snapshot)).is_err() {
            debug!("Presentation dispatcher stopped; snapshot dropped");
        }
    }

    /// Enqueue a flush marker; `ack` fires once all earlier snapshots are delivered
    pub(crate) fn flush(&self, ack: oneshot::Sender<()>) {
        // A closed channel drops `ack`, which wakes the waiter as well.
        let _ = self.tx.send(PublishMessage::Flush(ack));
    }

    /// The snapshot most recently handed to sinks
    pub(crate) fn latest(&self) -> Option<QuerySnapshot> {
        self.latest.read().clone()
    }

    /// Deliver what is pending and stop the presentation thread
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(PublishMessage::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("Presentation thread panicked");
            }
        }
    }
}

impl Drop for SnapshotPublisher {
    fn drop(&mut self) {
        let _ = self.tx.try_send(PublishMessage::Shutdown);
    }
}

struct Dispatcher {
    rx: Receiver<PublishMessage>,
    registry: Arc<SinkRegistry>,
    latest: Arc<RwLock<Option<QuerySnapshot>>>,
    coalesce: Option<Duration>,
    pending: Option<QuerySnapshot>,
    last_delivery: Option<Instant>,
}

impl Dispatcher {
    fn run(mut self) {
        debug!("Presentation dispatcher started");

        loop {
            let message = match self.next_deadline() {
                Some(wait) => match self.rx.recv_timeout(wait) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => {
                        self.deliver_pending();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.rx.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };

            match message {
                PublishMessage::Snapshot(snapshot) => self.accept(snapshot),
                PublishMessage::Flush(ack) => {
                    self.deliver_pending();
                    let _ = ack.send(());
                }
                PublishMessage::Shutdown => break,
            }
        }

        self.deliver_pending();
        debug!("Presentation dispatcher stopped");
    }

    /// How long to wait before a pending snapshot is due
    fn next_deadline(&self) -> Option<Duration> {
        let interval = self.coalesce?;
        self.pending.as_ref()?;
        let since = self.last_delivery.map(|t| t.elapsed()).unwrap_or(interval);
        Some(interval.saturating_sub(since))
    }

    fn accept(&mut self, snapshot: QuerySnapshot) {
        let Some(interval) = self.coalesce else {
            self.deliver(snapshot);
            return;
        };

        // A query's final snapshot is never swallowed by the next query's first.
        if let Some(pending) = &self.pending {
            if pending.query_id != snapshot.query_id {
                self.deliver_pending();
            }
        }

        let due = self
            .last_delivery
            .map_or(true, |t| t.elapsed() >= interval);
        if due {
            self.pending = None;
            self.deliver(snapshot);
        } else {
            self.pending = Some(snapshot);
        }
    }

    fn deliver_pending(&mut self) {
        if let Some(snapshot) = self.pending.take() {
            self.deliver(snapshot);
        }
    }

    fn deliver(&mut self, snapshot: QuerySnapshot) {
        let registry = &self.registry;
        if panic::catch_unwind(AssertUnwindSafe(|| registry.notify(&snapshot))).is_err() {
            warn!(query_id = %snapshot.query_id, "Text update sink panicked");
        }
        *self.latest.write() = Some(snapshot);
        self.last_delivery = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueryId;
    use pretty_assertions::assert_eq;

    fn snapshot(query: u64, text: &str) -> QuerySnapshot {
        QuerySnapshot {
            query_id: QueryId::new(query),
            prompt: Arc::from("p"),
            text: text.to_string(),
            token_count: text.len(),
            metrics: None,
        }
    }

    fn recording_registry() -> (Arc<SinkRegistry>, Arc<Mutex<Vec<String>>>) {
        let registry = Arc::new(SinkRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        registry.insert(Arc::new(move |s: &QuerySnapshot| {
            sink_seen.lock().push(s.text.clone());
        }));
        (registry, seen)
    }

    #[tokio::test]
    async fn test_delivers_every_snapshot_in_order() {
        let (registry, seen) = recording_registry();
        let publisher = SnapshotPublisher::spawn(&PublishConfig::default(), registry).unwrap();

        for text in ["a", "ab", "abc"] {
            publisher.publish(snapshot(1, text));
        }
        let (ack, flushed) = oneshot::channel();
        publisher.flush(ack);
        flushed.await.unwrap();

        assert_eq!(*seen.lock(), vec!["a", "ab", "abc"]);
        assert_eq!(publisher.latest().unwrap().text, "abc");
        publisher.shutdown();
    }

    #[tokio::test]
    async fn test_coalesces_bursts() {
        let (registry, seen) = recording_registry();
        let config = PublishConfig {
            channel_capacity: 16,
            coalesce_interval_ms: Some(10_000),
        };
        let publisher = SnapshotPublisher::spawn(&config, registry).unwrap();

        for text in ["a", "ab", "abc", "abcd"] {
            publisher.publish(snapshot(1, text));
        }
        publisher.publish(snapshot(2, "x"));
        let (ack, flushed) = oneshot::channel();
        publisher.flush(ack);
        flushed.await.unwrap();

        // First snapshot goes out at once; the rest of query 1 collapses into
        // its last one, which is delivered before query 2 starts.
        assert_eq!(*seen.lock(), vec!["a", "abcd", "x"]);
        publisher.shutdown();
    }

    #[tokio::test]
    async fn test_flush_after_shutdown_resolves() {
        let (registry, _) = recording_registry();
        let publisher = SnapshotPublisher::spawn(&PublishConfig::default(), registry).unwrap();
        publisher.shutdown();

        let (ack, flushed) = oneshot::channel();
        publisher.flush(ack);
        assert!(flushed.await.is_err());
    }

    #[tokio::test]
    async fn test_panicking_sink_does_not_stop_delivery() {
        let registry = Arc::new(SinkRegistry::new());
        registry.insert(Arc::new(|s: &QuerySnapshot| {
            if s.text == "boom" {
                panic!("sink failure");
            }
        }));
        let publisher = SnapshotPublisher::spawn(&PublishConfig::default(), registry).unwrap();

        publisher.publish(snapshot(1, "boom"));
        publisher.publish(snapshot(1, "boom!"));
        let (ack, flushed) = oneshot::channel();
        publisher.flush(ack);
        flushed.await.unwrap();

        assert_eq!(publisher.latest().unwrap().text, "boom!");
        publisher.shutdown();
    }
}
