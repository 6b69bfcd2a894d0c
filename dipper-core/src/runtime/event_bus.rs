//! Topic-based pub/sub bus
//!
//! Distributes market snapshots, fills, and shutdown notices to loosely
//! coupled consumers (telemetry, notifiers). Callbacks run outside the
//! subscriber lock so a slow consumer cannot deadlock a publisher.

use crate::engine::pnl::FillEvent;
use crate::market::MarketSnapshot;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub const TOPIC_SNAPSHOTS: &str = "drop.snapshots";
pub const TOPIC_FILLS: &str = "fills";
pub const TOPIC_SHUTDOWN: &str = "shutdown";

/// Events carried on the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Snapshot(MarketSnapshot),
    Fill(FillEvent),
    Shutdown { reason: String },
}

type Callback = Arc<dyn Fn(&BusEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<String, Vec<Callback>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str, callback: impl Fn(&BusEvent) + Send + Sync + 'static) {
        let mut subs = self.subscribers.lock();
        subs.entry(topic.to_string())
            .or_default()
            .push(Arc::new(callback));
        debug!(topic, "bus subscription added");
    }

    /// Bounded channel subscription for consumers on other threads
    /// (dashboards, notifiers). A full channel drops the event rather than
    /// blocking the publisher.
    pub fn subscribe_channel(
        &self,
        topic: &str,
        capacity: usize,
    ) -> crossbeam::channel::Receiver<BusEvent> {
        let (tx, rx) = crossbeam::channel::bounded(capacity);
        self.subscribe(topic, move |event| {
            let _ = tx.try_send(event.clone());
        });
        rx
    }

    pub fn publish(&self, topic: &str, event: &BusEvent) {
        let callbacks: Vec<Callback> = {
            let subs = self.subscribers.lock();
            subs.get(topic).cloned().unwrap_or_default()
        };
        for cb in callbacks {
            cb(event);
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .lock()
            .get(topic)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = count.clone();
            bus.subscribe(TOPIC_SHUTDOWN, move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        bus.publish(
            TOPIC_SHUTDOWN,
            &BusEvent::Shutdown {
                reason: "test".to_string(),
            },
        );
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_channel_subscription_bounded() {
        let bus = EventBus::new();
        let rx = bus.subscribe_channel(TOPIC_SHUTDOWN, 1);

        let event = BusEvent::Shutdown {
            reason: "one".to_string(),
        };
        bus.publish(TOPIC_SHUTDOWN, &event);
        // Channel full: the second publish is dropped, not blocking
        bus.publish(TOPIC_SHUTDOWN, &event);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_topics_are_isolated() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(TOPIC_FILLS, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(
            TOPIC_SHUTDOWN,
            &BusEvent::Shutdown {
                reason: "other".to_string(),
            },
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count(TOPIC_FILLS), 1);
    }
}
