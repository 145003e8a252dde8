//! In-Process Event Bus
//!
//! Single-writer-many-reader topic bus for auction lifecycle events.
//! Delivery is fire-and-forget over bounded broadcast channels; subscribers
//! that cannot keep up lag and drop the oldest events. No persistence —
//! catch-up is the replay buffer's job.

use std::collections::HashMap;

use tokio::sync::broadcast;
use tracing::trace;

use crate::models::event::{AuctionEvent, Topic};

const DEFAULT_CAPACITY: usize = 256;

/// Topic bus
pub struct EventBus {
    channels: HashMap<Topic, broadcast::Sender<AuctionEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let channels = Topic::all()
            .into_iter()
            .map(|topic| (topic, broadcast::channel(capacity).0))
            .collect();
        Self { channels }
    }

    /// Publish to the event's topic. Never blocks; an error only means no
    /// subscriber is currently listening.
    pub fn publish(&self, event: AuctionEvent) {
        let topic = event.topic();
        let sender = self
            .channels
            .get(&topic)
            .expect("every topic has a channel");
        if sender.send(event).is_err() {
            trace!(topic = %topic, "event published with no subscribers");
        }
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<AuctionEvent> {
        self.channels
            .get(&topic)
            .expect("every topic has a channel")
            .subscribe()
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
    use crate::models::event::TickEvent;
    use crate::models::Phase;
    use chrono::Utc;
    use uuid::Uuid;

    fn tick(auction_id: Uuid) -> AuctionEvent {
        AuctionEvent::Tick(TickEvent {
            auction_id,
            remaining_ms: 90_000,
            server_time: Utc::now(),
            phase: Phase::Active,
            extension_count: 0,
        })
    }

    #[tokio::test]
    async fn test_subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(Topic::Tick);

        let auction_id = Uuid::now_v7();
        bus.publish(tick(auction_id));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.auction_id(), auction_id);
        assert_eq!(event.topic(), Topic::Tick);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = EventBus::new();
        let mut ended_rx = bus.subscribe(Topic::Ended);

        bus.publish(tick(Uuid::now_v7()));
        assert!(matches!(
            ended_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn test_publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(tick(Uuid::now_v7()));
    }
}
