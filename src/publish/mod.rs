//! Delivery of query snapshots to presentation-side subscribers

mod dispatcher;
mod subscription;

pub(crate) use dispatcher::SnapshotPublisher;
pub(crate) use subscription::SinkRegistry;
pub use subscription::{Subscription, SubscriptionId, TextUpdateSink};
