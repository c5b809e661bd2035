use std::collections::{HashSet, VecDeque};
use std::future::Future;

use crate::bus::{BusSubscription, ChangeBus};
use crate::error::Result;

/// Derives the partition key a payload belongs to. One bus topic carries
/// events for many independent partitions; a subscriber is scoped to the
/// keys it observed in its snapshot, or to the key of its first live payload.
pub type RestrictFn<P> = Box<dyn Fn(&P) -> String + Send>;

pub type FilterFn<P> = Box<dyn Fn(&P) -> bool + Send>;

/// Builder for a [`LiveQuery`]: an optional snapshot initializer composed
/// with a restricted, filtered live tail of one bus topic.
///
/// Filter predicates must be fully constructed (and any caller input
/// validated) before subscribing — a bad filter rejects the subscription at
/// setup, never per event.
pub struct LiveQueryBuilder<P> {
    restrict: Option<RestrictFn<P>>,
    filter: Option<FilterFn<P>>,
}

impl<P: Clone + Send + 'static> LiveQueryBuilder<P> {
    pub fn new() -> Self {
        Self {
            restrict: None,
            filter: None,
        }
    }

    pub fn restrict(mut self, f: impl Fn(&P) -> String + Send + 'static) -> Self {
        self.restrict = Some(Box::new(f));
        self
    }

    pub fn filter(mut self, f: impl Fn(&P) -> bool + Send + 'static) -> Self {
        self.filter = Some(Box::new(f));
        self
    }

    /// Subscribe with no initial snapshot. The restriction key, if any, is
    /// fixed by the first live payload.
    pub fn subscribe(self, bus: &ChangeBus<P>, topic: &str) -> LiveQuery<P> {
        LiveQuery {
            pending: VecDeque::new(),
            sub: bus.subscribe(topic),
            restrict: self.restrict,
            restrictions: HashSet::new(),
            filter: self.filter,
            closed: false,
        }
    }

    /// Run the snapshot initializer to completion, then subscribe to the
    /// live topic. Snapshot batches are forwarded before any live payload,
    /// and every restriction key observable in them is captured up front.
    pub async fn subscribe_with_snapshot<F, Fut>(
        self,
        bus: &ChangeBus<P>,
        topic: &str,
        init: F,
    ) -> Result<LiveQuery<P>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Vec<P>>>>,
    {
        let batches = init().await?;

        let mut restrictions = HashSet::new();
        if let Some(restrict) = &self.restrict {
            for payload in batches.iter().flatten() {
                restrictions.insert(restrict(payload));
            }
        }

        Ok(LiveQuery {
            pending: batches.into_iter().collect(),
            sub: bus.subscribe(topic),
            restrict: self.restrict,
            restrictions,
            filter: self.filter,
            closed: false,
        })
    }
}

impl<P: Clone + Send + 'static> Default for LiveQueryBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's merged stream: queued snapshot batches first, then
/// singleton batches from the live tail. [`LiveQuery::close`] unwinds
/// synchronously — the bus subscription stops accepting payloads and every
/// subsequent `next_batch` returns `None`.
pub struct LiveQuery<P> {
    pending: VecDeque<Vec<P>>,
    sub: BusSubscription<P>,
    restrict: Option<RestrictFn<P>>,
    restrictions: HashSet<String>,
    filter: Option<FilterFn<P>>,
    closed: bool,
}

impl<P: Clone + Send + 'static> LiveQuery<P> {
    pub async fn next_batch(&mut self) -> Option<Vec<P>> {
        if self.closed {
            return None;
        }
        if let Some(batch) = self.pending.pop_front() {
            return Some(batch);
        }

        loop {
            let payload = self.sub.recv().await?;

            if let Some(restrict) = &self.restrict {
                let key = restrict(&payload);
                if self.restrictions.is_empty() {
                    // No key fixed yet: this first payload decides the
                    // partition this subscriber is scoped to.
                    self.restrictions.insert(key);
                } else if !self.restrictions.contains(&key) {
                    continue;
                }
            }

            if let Some(filter) = &self.filter {
                if !filter(&payload) {
                    continue;
                }
            }

            return Some(vec![payload]);
        }
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.sub.close();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Event {
        network: String,
        value: u32,
    }

    fn ev(network: &str, value: u32) -> Event {
        Event {
            network: network.to_string(),
            value,
        }
    }

    async fn assert_silent(lq: &mut LiveQuery<Event>) {
        let res = tokio::time::timeout(Duration::from_millis(50), lq.next_batch()).await;
        assert!(res.is_err(), "expected no batch, got {res:?}");
    }

    #[tokio::test]
    async fn snapshot_then_filtered_live_tail() {
        let bus: Arc<ChangeBus<Event>> = ChangeBus::new(16);

        let mut lq = LiveQueryBuilder::new()
            .filter(|e: &Event| e.value % 2 == 1)
            .subscribe_with_snapshot(&bus, "t", || async {
                Ok(vec![vec![ev("x", 1), ev("x", 2)]])
            })
            .await
            .unwrap();

        // Snapshot batches are forwarded unfiltered, exactly once.
        assert_eq!(lq.next_batch().await.unwrap(), vec![ev("x", 1), ev("x", 2)]);

        bus.publish("t", ev("x", 3)); // passes filter
        bus.publish("t", ev("x", 4)); // dropped
        bus.publish("t", ev("x", 5)); // passes filter

        assert_eq!(lq.next_batch().await.unwrap(), vec![ev("x", 3)]);
        assert_eq!(lq.next_batch().await.unwrap(), vec![ev("x", 5)]);
    }

    #[tokio::test]
    async fn restriction_key_fixed_by_first_live_payload() {
        let bus: Arc<ChangeBus<Event>> = ChangeBus::new(16);

        let mut a = LiveQueryBuilder::new()
            .restrict(|e: &Event| e.network.clone())
            .subscribe(&bus, "t");

        bus.publish("t", ev("net1", 1));
        assert_eq!(a.next_batch().await.unwrap(), vec![ev("net1", 1)]);

        // A second subscriber whose first observed event is from the other
        // partition gets scoped to that partition instead.
        let mut b = LiveQueryBuilder::new()
            .restrict(|e: &Event| e.network.clone())
            .subscribe(&bus, "t");

        bus.publish("t", ev("net2", 2));
        assert_eq!(b.next_batch().await.unwrap(), vec![ev("net2", 2)]);

        // Cross-partition events are invisible to each subscriber.
        bus.publish("t", ev("net2", 3));
        assert_silent(&mut a).await;
        bus.publish("t", ev("net1", 4));
        assert_silent(&mut b).await;

        bus.publish("t", ev("net1", 5));
        assert_eq!(a.next_batch().await.unwrap(), vec![ev("net1", 5)]);
        bus.publish("t", ev("net2", 6));
        assert_eq!(b.next_batch().await.unwrap(), vec![ev("net2", 6)]);
    }

    #[tokio::test]
    async fn restriction_keys_captured_from_snapshot() {
        let bus: Arc<ChangeBus<Event>> = ChangeBus::new(16);

        let mut lq = LiveQueryBuilder::new()
            .restrict(|e: &Event| e.network.clone())
            .subscribe_with_snapshot(&bus, "t", || async { Ok(vec![vec![ev("net1", 1)]]) })
            .await
            .unwrap();
        assert_eq!(lq.next_batch().await.unwrap(), vec![ev("net1", 1)]);

        // The key came from the snapshot, so a foreign first live payload
        // does not re-fix it.
        bus.publish("t", ev("net2", 2));
        assert_silent(&mut lq).await;

        bus.publish("t", ev("net1", 3));
        assert_eq!(lq.next_batch().await.unwrap(), vec![ev("net1", 3)]);
    }

    #[tokio::test]
    async fn close_unwinds_and_yields_nothing_further() {
        let bus: Arc<ChangeBus<Event>> = ChangeBus::new(16);

        let mut lq = LiveQueryBuilder::new()
            .subscribe_with_snapshot(&bus, "t", || async { Ok(vec![vec![ev("x", 1)]]) })
            .await
            .unwrap();

        bus.publish("t", ev("x", 2));
        lq.close();

        // Even the queued snapshot is not delivered after close.
        assert_eq!(lq.next_batch().await, None);
        assert_eq!(lq.next_batch().await, None);
    }
}
