//! Auction State Cache
//!
//! Short-TTL cache in front of auction reads on the gateway's hot path.
//! Live presence counts are merged after the cached read, never cached.
//! Settle and cancel invalidate entries immediately.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::models::auction::Auction;
use crate::settings::StateCacheSettings;

struct CacheEntry {
    stored_at: Instant,
    auction: Auction,
}

/// TTL cache of auction rows by id
pub struct StateCache {
    ttl: Duration,
    entries: Mutex<HashMap<Uuid, CacheEntry>>,
}

impl StateCache {
    pub fn new(settings: &StateCacheSettings) -> Self {
        Self {
            ttl: Duration::from_millis(settings.ttl_ms),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, auction_id: Uuid) -> Option<Auction> {
        let mut entries = self.entries.lock();
        match entries.get(&auction_id) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.auction.clone()),
            Some(_) => {
                entries.remove(&auction_id);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, auction: Auction) {
        self.entries.lock().insert(
            auction.id,
            CacheEntry {
                stored_at: Instant::now(),
                auction,
            },
        );
    }

    pub fn invalidate(&self, auction_id: Uuid) {
        self.entries.lock().remove(&auction_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::auction::NewAuction;
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal_macros::dec;

    fn sample_auction() -> Auction {
        let now = Utc::now();
        NewAuction {
            asset_id: Uuid::now_v7(),
            title: "Lot".to_string(),
            description: None,
            reserve_price: dec!(0),
            starting_price: dec!(100),
            min_bid_increment: dec!(10),
            starts_at: now,
            ends_at: now + ChronoDuration::hours(1),
            extension_seconds: 30,
            max_extensions: 3,
        }
        .into_auction(now)
    }

    #[test]
    fn test_hit_within_ttl() {
        let cache = StateCache::new(&StateCacheSettings { ttl_ms: 5_000 });
        let auction = sample_auction();
        cache.put(auction.clone());
        assert!(cache.get(auction.id).is_some());
    }

    #[test]
    fn test_expired_entry_misses() {
        let cache = StateCache::new(&StateCacheSettings { ttl_ms: 0 });
        let auction = sample_auction();
        cache.put(auction.clone());
        assert!(cache.get(auction.id).is_none());
    }

    #[test]
    fn test_invalidate() {
        let cache = StateCache::new(&StateCacheSettings { ttl_ms: 5_000 });
        let auction = sample_auction();
        cache.put(auction.clone());
        cache.invalidate(auction.id);
        assert!(cache.get(auction.id).is_none());
    }
}
