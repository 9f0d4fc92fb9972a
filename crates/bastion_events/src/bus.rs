//! # Event Bus
//!
//! A process-wide multi-producer/multi-consumer fan-out with bounded
//! per-subscriber queues. Publishing never blocks: a subscriber whose queue
//! is full loses the event (counted on that subscriber only) while every
//! other subscriber is unaffected. This is the deliberate trade that keeps a
//! slow consumer from stalling console ingest.
//!
//! Uses `DashMap` for lock-free concurrent access to the subscriber table so
//! publishers on different tasks never contend on a registry lock.

use crate::events::{EventType, NormalizedEvent};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Default per-subscriber queue capacity.
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 100;

/// Unique handle for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Subscriber {
    sender: mpsc::Sender<Arc<NormalizedEvent>>,
    /// `None` means "all event types".
    filter: Option<HashSet<EventType>>,
    dropped: AtomicU64,
}

impl Subscriber {
    fn wants(&self, event_type: &EventType) -> bool {
        match &self.filter {
            Some(set) => set.contains(event_type),
            None => true,
        }
    }
}

/// Receiving half of a subscription.
///
/// Dropping the `Subscription` closes the channel; the bus removes the entry
/// the next time a publish hits the closed sender.
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::Receiver<Arc<NormalizedEvent>>,
}

impl Subscription {
    /// This subscription's id, used for [`EventBus::unsubscribe`] and drop
    /// accounting.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Receives the next event, or `None` after the subscription is closed
    /// and the queue is drained.
    pub async fn recv(&mut self) -> Option<Arc<NormalizedEvent>> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Arc<NormalizedEvent>> {
        self.receiver.try_recv().ok()
    }
}

/// Snapshot of bus counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBusStats {
    /// Events handed to `publish`.
    pub events_published: u64,
    /// Successful deliveries across all subscribers.
    pub events_delivered: u64,
    /// Events lost to full subscriber queues, summed across subscribers.
    pub events_dropped: u64,
    /// Live subscriptions.
    pub subscriber_count: usize,
}

/// The typed publish/subscribe fabric.
///
/// # Ordering
///
/// Per `(publisher, subscriber)` pair delivery is FIFO — `publish` enqueues
/// into each subscriber's channel in call order. Across publishers there is
/// no ordering guarantee.
pub struct EventBus {
    subscribers: DashMap<SubscriptionId, Subscriber>,
    capacity: usize,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl EventBus {
    /// Creates a bus with the default per-subscriber capacity of 100.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIPTION_CAPACITY)
    }

    /// Creates a bus with an explicit per-subscriber queue capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            capacity,
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Registers a subscriber.
    ///
    /// `filter` restricts delivery to the given event types; `None`
    /// subscribes to everything.
    pub fn subscribe(&self, filter: Option<HashSet<EventType>>) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = SubscriptionId::new();
        self.subscribers.insert(
            id,
            Subscriber {
                sender,
                filter,
                dropped: AtomicU64::new(0),
            },
        );
        debug!("Subscription {id} registered ({} live)", self.subscribers.len());
        Subscription { id, receiver }
    }

    /// Removes a subscription. The subscriber's channel closes after the
    /// final already-delivered event is drained. Idempotent.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if self.subscribers.remove(&id).is_some() {
            debug!("Subscription {id} removed ({} live)", self.subscribers.len());
        }
    }

    /// Publishes one event to every matching subscriber.
    ///
    /// Never blocks. Returns the number of successful deliveries; subscribers
    /// with full queues count exactly one drop for this event. Subscribers
    /// whose receiving half has been dropped are pruned here.
    pub fn publish(&self, event: NormalizedEvent) -> usize {
        self.publish_arc(Arc::new(event))
    }

    /// Publishes an already-shared event. Useful when bridging between buses.
    pub fn publish_arc(&self, event: Arc<NormalizedEvent>) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut delivered = 0usize;
        let mut closed: Vec<SubscriptionId> = Vec::new();

        for entry in self.subscribers.iter() {
            if !entry.wants(&event.event_type) {
                continue;
            }
            match entry.sender.try_send(Arc::clone(&event)) {
                Ok(()) => {
                    delivered += 1;
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    entry.dropped.fetch_add(1, Ordering::Relaxed);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(*entry.key());
                }
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
        }
        delivered
    }

    /// Drop count for one subscriber, or `None` for unknown ids.
    pub fn dropped_for(&self, id: SubscriptionId) -> Option<u64> {
        self.subscribers
            .get(&id)
            .map(|s| s.dropped.load(Ordering::Relaxed))
    }

    /// Current counters.
    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            events_published: self.published.load(Ordering::Relaxed),
            events_delivered: self.delivered.load(Ordering::Relaxed),
            events_dropped: self.dropped.load(Ordering::Relaxed),
            subscriber_count: self.subscribers.len(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSource;
    use crate::types::ServerId;

    fn test_event(server_id: ServerId, event_type: EventType) -> NormalizedEvent {
        NormalizedEvent::from_value(
            server_id,
            EventSource::Rcon,
            event_type,
            serde_json::json!({"n": 1}),
            None,
        )
    }

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(None);
        let server = ServerId::new();

        for _ in 0..3 {
            bus.publish(test_event(server, EventType::ChatMessage));
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(sub.recv().await.unwrap().id);
        }
        assert_eq!(seen.len(), 3);
        // FIFO relative to the single publisher
        assert_eq!(bus.stats().events_delivered, 3);
    }

    #[tokio::test]
    async fn filter_excludes_other_event_types() {
        let bus = EventBus::new();
        let mut filtered = bus.subscribe(Some(
            [EventType::PlayerDied].into_iter().collect(),
        ));
        let server = ServerId::new();

        bus.publish(test_event(server, EventType::ChatMessage));
        bus.publish(test_event(server, EventType::PlayerDied));

        let got = filtered.recv().await.unwrap();
        assert_eq!(got.event_type, EventType::PlayerDied);
        assert!(filtered.try_recv().is_none());
    }

    #[tokio::test]
    async fn full_subscriber_counts_drops_without_affecting_others() {
        let bus = EventBus::with_capacity(1);
        let slow = bus.subscribe(None);
        let mut fast = bus.subscribe(None);
        let slow_id = slow.id();
        let server = ServerId::new();

        // Fill the slow subscriber's single slot, then publish 10 more.
        bus.publish(test_event(server, EventType::ChatMessage));
        let _ = fast.recv().await.unwrap();
        for _ in 0..10 {
            bus.publish(test_event(server, EventType::ChatMessage));
            // Keep the fast subscriber drained so it never fills.
            let _ = fast.recv().await.unwrap();
        }

        assert_eq!(bus.dropped_for(slow_id), Some(10));
        assert_eq!(bus.dropped_for(fast.id()), Some(0));
        drop(slow);
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_channel_after_drain() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(None);
        let server = ServerId::new();

        bus.publish(test_event(server, EventType::NewGame));
        bus.unsubscribe(sub.id());

        // The already-delivered event drains, then the channel reports closed.
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
        assert_eq!(bus.stats().subscriber_count, 0);
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned_on_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe(None);
        drop(sub);

        bus.publish(test_event(ServerId::new(), EventType::NewGame));
        assert_eq!(bus.stats().subscriber_count, 0);
    }
}
