//! Replay Buffer
//!
//! Rolling per-auction ring of recently broadcast events, used to catch up
//! reconnecting sessions. Bounded both by event count and by a time window;
//! cleared a few minutes after the auction ends.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::settings::ReplaySettings;

/// One broadcast event as replayed to a reconnecting session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayedEvent {
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Per-auction bounded event ring
pub struct ReplayBuffer {
    settings: ReplaySettings,
    rings: RwLock<HashMap<Uuid, VecDeque<ReplayedEvent>>>,
}

impl ReplayBuffer {
    pub fn new(settings: ReplaySettings) -> Self {
        Self {
            settings,
            rings: RwLock::new(HashMap::new()),
        }
    }

    /// Append an outgoing broadcast to the auction's ring.
    pub fn record(&self, auction_id: Uuid, event_type: &str, payload: Value) {
        self.record_at(auction_id, event_type, payload, Utc::now());
    }

    fn record_at(
        &self,
        auction_id: Uuid,
        event_type: &str,
        payload: Value,
        timestamp: DateTime<Utc>,
    ) {
        let mut rings = self.rings.write();
        let ring = rings.entry(auction_id).or_default();
        ring.push_back(ReplayedEvent {
            event_type: event_type.to_string(),
            payload,
            timestamp,
        });
        while ring.len() > self.settings.max_events {
            ring.pop_front();
        }
    }

    /// Events newer than `since` (when given) and inside the time window,
    /// oldest first. `None` returns the whole windowed ring.
    pub fn since(&self, auction_id: Uuid, since: Option<DateTime<Utc>>) -> Vec<ReplayedEvent> {
        let horizon = Utc::now() - Duration::milliseconds(self.settings.window_ms);
        let rings = self.rings.read();
        rings
            .get(&auction_id)
            .map(|ring| {
                ring.iter()
                    .filter(|event| {
                        event.timestamp > horizon
                            && since.map_or(true, |cutoff| event.timestamp > cutoff)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop an auction's ring entirely.
    pub fn clear(&self, auction_id: Uuid) {
        self.rings.write().remove(&auction_id);
    }

    /// Window after which an ended auction's ring is cleared.
    pub fn retention(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.settings.window_ms.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn buffer() -> ReplayBuffer {
        ReplayBuffer::new(ReplaySettings::default())
    }

    #[test]
    fn test_replays_in_original_order() {
        let buffer = buffer();
        let auction_id = Uuid::now_v7();
        for i in 0..5 {
            buffer.record(auction_id, "bid:placed", json!({ "seq": i }));
        }

        let events = buffer.since(auction_id, None);
        assert_eq!(events.len(), 5);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.payload["seq"], i);
        }
    }

    #[test]
    fn test_ring_is_bounded() {
        let buffer = ReplayBuffer::new(ReplaySettings {
            max_events: 50,
            window_ms: 300_000,
        });
        let auction_id = Uuid::now_v7();
        for i in 0..60 {
            buffer.record(auction_id, "bid:placed", json!({ "seq": i }));
        }

        let events = buffer.since(auction_id, None);
        assert_eq!(events.len(), 50);
        // Oldest ten were evicted.
        assert_eq!(events[0].payload["seq"], 10);
    }

    #[test]
    fn test_since_cutoff() {
        let buffer = buffer();
        let auction_id = Uuid::now_v7();
        buffer.record(auction_id, "bid:placed", json!({ "seq": 0 }));
        let cutoff = Utc::now();
        buffer.record_at(auction_id, "bid:placed", json!({ "seq": 1 }), Utc::now());

        let events = buffer.since(auction_id, Some(cutoff));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["seq"], 1);
    }

    #[test]
    fn test_time_window_excludes_stale_events() {
        let buffer = buffer();
        let auction_id = Uuid::now_v7();
        // Older than the five-minute window.
        buffer.record_at(
            auction_id,
            "bid:placed",
            json!({ "seq": 0 }),
            Utc::now() - Duration::minutes(10),
        );
        buffer.record(auction_id, "bid:placed", json!({ "seq": 1 }));

        let events = buffer.since(auction_id, None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["seq"], 1);
    }

    #[test]
    fn test_clear_and_unknown_auction() {
        let buffer = buffer();
        let auction_id = Uuid::now_v7();
        buffer.record(auction_id, "bid:placed", json!({}));
        buffer.clear(auction_id);

        assert!(buffer.since(auction_id, None).is_empty());
        assert!(buffer.since(Uuid::now_v7(), None).is_empty());
    }
}
