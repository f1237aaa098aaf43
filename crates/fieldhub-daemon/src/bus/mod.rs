//! In-process topic-keyed publish/subscribe bus.
//!
//! Every ingress publishes here and every consumer drains its own
//! [`Subscription`]. Each subscription owns an independent bounded queue,
//! so one slow consumer can neither block the publisher nor starve the
//! other consumers: when a queue is full the message is dropped for that
//! subscriber alone and counted.
//!
//! Messages published from a single task are delivered to each subscriber
//! in publish order. Across publishers the order is unspecified.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::mpsc;
use tracing::warn;

use fieldhub_core::Metrics;

use crate::message::{Msg, Topic};

/// A message paired with the topic it was published under.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: Topic,
    pub msg: Msg,
}

/// Which topics a subscription wants.
#[derive(Debug, Clone)]
enum TopicFilter {
    All,
    Only(HashSet<Topic>),
}

impl TopicFilter {
    fn matches(&self, topic: Topic) -> bool {
        match self {
            Self::All => true,
            Self::Only(set) => set.contains(&topic),
        }
    }
}

struct SubEntry {
    filter: TopicFilter,
    tx: mpsc::Sender<Envelope>,
}

struct BusInner {
    subs: RwLock<HashMap<u64, SubEntry>>,
    next_id: AtomicU64,
    capacity: usize,
    metrics: Arc<Metrics>,
}

/// Cloneable handle to the daemon's message bus.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Create a bus whose subscriptions buffer up to `capacity` messages.
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subs: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                capacity,
                metrics,
            }),
        }
    }

    /// Subscribe to the given topics.
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        self.add(TopicFilter::Only(topics.iter().copied().collect()))
    }

    /// Subscribe to every topic.
    pub fn subscribe_all(&self) -> Subscription {
        self.add(TopicFilter::All)
    }

    fn add(&self, filter: TopicFilter) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subs) = self.inner.subs.write() {
            subs.insert(id, SubEntry { filter, tx });
        }
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Publish a message under a topic.
    ///
    /// Never blocks: a subscriber whose queue is full simply misses this
    /// message (logged and counted).
    pub fn publish(&self, topic: Topic, msg: Msg) {
        let mut closed = Vec::new();
        if let Ok(subs) = self.inner.subs.read() {
            for (id, entry) in subs.iter() {
                if !entry.filter.matches(topic) {
                    continue;
                }
                match entry.tx.try_send(Envelope {
                    topic,
                    msg: msg.clone(),
                }) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.inner.metrics.incr_messages_dropped();
                        warn!(%topic, subscriber = id, "Subscriber queue full, dropping message");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        if !closed.is_empty() {
            if let Ok(mut subs) = self.inner.subs.write() {
                for id in closed {
                    subs.remove(&id);
                }
            }
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subs.read().map(|s| s.len()).unwrap_or(0)
    }
}

/// A subscriber's end of the bus.
///
/// Dropping the subscription unsubscribes it. `recv` returning `None` is
/// the clean end-of-stream signal (every `Bus` handle has been dropped).
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Envelope>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Receive the next matching message.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            if let Ok(mut subs) = inner.subs.write() {
                subs.remove(&self.id);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_bus(capacity: usize) -> Bus {
        Bus::new(capacity, Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn routes_by_topic() {
        let bus = test_bus(16);
        let mut conn_only = bus.subscribe(&[Topic::CONNECT]);

        bus.publish(Topic::GPS, Msg::now("SG-0000000000AA", "G,fix"));
        bus.publish(Topic::CONNECT, Msg::now("SG-0000000000AA", ""));

        let envelope = conn_only.recv().await.unwrap();
        assert_eq!(envelope.topic, Topic::CONNECT);
    }

    #[tokio::test]
    async fn wildcard_receives_every_topic() {
        let bus = test_bus(16);
        let mut all = bus.subscribe_all();

        bus.publish(Topic::GPS, Msg::now("SG-0000000000AA", "G,fix"));
        bus.publish(Topic::TAG_DETECTED, Msg::now("SG-0000000000AA", "p,tag"));

        assert_eq!(all.recv().await.unwrap().topic, Topic::GPS);
        assert_eq!(all.recv().await.unwrap().topic, Topic::TAG_DETECTED);
    }

    #[tokio::test]
    async fn single_publisher_order_is_preserved() {
        let bus = test_bus(128);
        let mut all = bus.subscribe_all();

        for i in 0..100 {
            bus.publish(Topic::GPS, Msg::now("SG-0000000000AA", format!("G,{i}")));
        }
        for i in 0..100 {
            let envelope = all.recv().await.unwrap();
            assert_eq!(envelope.msg.text, format!("G,{i}"));
        }
    }

    #[tokio::test]
    async fn overflow_drops_without_blocking_publisher() {
        let metrics = Arc::new(Metrics::new());
        let bus = Bus::new(4, Arc::clone(&metrics));
        let mut slow = bus.subscribe_all();

        for i in 0..10 {
            bus.publish(Topic::GPS, Msg::now("SG-0000000000AA", format!("G,{i}")));
        }

        // The first 4 arrive in order, the rest were dropped.
        for i in 0..4 {
            assert_eq!(slow.recv().await.unwrap().msg.text, format!("G,{i}"));
        }
        assert_eq!(metrics.messages_dropped(), 6);
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let bus = test_bus(16);
        let sub = bus.subscribe_all();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn bus_drop_signals_end_of_stream() {
        let bus = test_bus(16);
        let mut all = bus.subscribe_all();
        bus.publish(Topic::GPS, Msg::now("SG-0000000000AA", "G,fix"));
        drop(bus);

        // Buffered message still arrives, then clean end-of-stream.
        assert!(all.recv().await.is_some());
        assert!(all.recv().await.is_none());
    }
}
