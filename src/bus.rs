use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::warn;

/// Topic-addressed publish/subscribe fan-out. Each subscriber holds an
/// independent broadcast receiver; there is no persistence or replay —
/// events published while nobody listens on a topic are dropped.
pub struct ChangeBus<T> {
    topics: DashMap<String, broadcast::Sender<T>>,
    capacity: usize,
}

impl<T: Clone + Send + 'static> ChangeBus<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            topics: DashMap::new(),
            capacity,
        })
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<T> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish to all current subscribers of `topic`. Returns the number of
    /// subscribers the payload was delivered to.
    pub fn publish(&self, topic: &str, payload: T) -> usize {
        self.sender(topic).send(payload).unwrap_or(0)
    }

    pub fn subscribe(&self, topic: &str) -> BusSubscription<T> {
        BusSubscription {
            topic: topic.to_string(),
            rx: Some(self.sender(topic).subscribe()),
        }
    }
}

/// One subscriber's stream of payloads. [`BusSubscription::close`] (or
/// dropping the handle) releases the underlying receiver immediately; no
/// further payloads are delivered after close.
pub struct BusSubscription<T> {
    topic: String,
    rx: Option<broadcast::Receiver<T>>,
}

impl<T: Clone + Send + 'static> BusSubscription<T> {
    /// Next payload, or `None` once the subscription is closed. A slow
    /// subscriber that lags behind the channel capacity skips the missed
    /// payloads and keeps receiving — delivery is at-most-once per payload.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(topic = %self.topic, missed, "bus subscriber lagged, skipping");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn close(&mut self) {
        self.rx = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let bus: Arc<ChangeBus<u32>> = ChangeBus::new(16);
        let mut a = bus.subscribe("t");
        let mut b = bus.subscribe("t");

        assert_eq!(bus.publish("t", 7), 2);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let bus: Arc<ChangeBus<u32>> = ChangeBus::new(16);
        let mut a = bus.subscribe("a");

        bus.publish("b", 1);
        bus.publish("a", 2);
        assert_eq!(a.recv().await, Some(2));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus: Arc<ChangeBus<u32>> = ChangeBus::new(16);
        assert_eq!(bus.publish("t", 1), 0);

        // A later subscriber must not see the earlier payload.
        let mut sub = bus.subscribe("t");
        bus.publish("t", 2);
        assert_eq!(sub.recv().await, Some(2));
    }

    #[tokio::test]
    async fn close_releases_the_receiver_immediately() {
        let bus: Arc<ChangeBus<u32>> = ChangeBus::new(16);
        let mut sub = bus.subscribe("t");
        assert_eq!(bus.publish("t", 1), 1);

        sub.close();

        // The receiver is gone: publishes reach nobody and recv yields
        // nothing, even for the payload sent before close.
        assert_eq!(bus.publish("t", 2), 0);
        assert_eq!(sub.recv().await, None);
    }
}
