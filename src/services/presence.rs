//! Presence Tracker
//!
//! Node-local view of which sessions joined which auctions. Keeps a forward
//! map per auction and an inverse map per session so a disconnect sweeps all
//! of a session's auctions in one pass. Counts are over distinct users, not
//! sessions; a user may hold several sessions on the same auction.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

/// One session's membership in one auction room
#[derive(Debug, Clone)]
pub struct SessionPresence {
    pub user_id: Uuid,
    pub joined_at: DateTime<Utc>,
    pub has_bid: bool,
    pub last_activity: DateTime<Utc>,
}

/// Live participant and bidder counts for one auction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PresenceCounts {
    pub participants: usize,
    pub active_bidders: usize,
}

/// Node-local presence maps
#[derive(Default)]
pub struct PresenceTracker {
    auctions: RwLock<HashMap<Uuid, HashMap<Uuid, SessionPresence>>>,
    sessions: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, auction_id: Uuid, session_id: Uuid, user_id: Uuid) {
        let now = Utc::now();
        let mut auctions = self.auctions.write();
        auctions.entry(auction_id).or_default().insert(
            session_id,
            SessionPresence {
                user_id,
                joined_at: now,
                has_bid: false,
                last_activity: now,
            },
        );
        drop(auctions);
        self.sessions
            .write()
            .entry(session_id)
            .or_default()
            .insert(auction_id);
    }

    /// Returns true when the session was actually joined.
    pub fn leave(&self, auction_id: Uuid, session_id: Uuid) -> bool {
        let mut auctions = self.auctions.write();
        let removed = auctions
            .get_mut(&auction_id)
            .map(|room| room.remove(&session_id).is_some())
            .unwrap_or(false);
        if let Some(room) = auctions.get(&auction_id) {
            if room.is_empty() {
                auctions.remove(&auction_id);
            }
        }
        drop(auctions);

        if let Some(set) = self.sessions.write().get_mut(&session_id) {
            set.remove(&auction_id);
        }
        removed
    }

    /// Remove the session from every auction; returns the affected auctions.
    pub fn disconnect(&self, session_id: Uuid) -> Vec<Uuid> {
        let joined: Vec<Uuid> = self
            .sessions
            .write()
            .remove(&session_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        let mut auctions = self.auctions.write();
        for auction_id in &joined {
            if let Some(room) = auctions.get_mut(auction_id) {
                room.remove(&session_id);
                if room.is_empty() {
                    auctions.remove(auction_id);
                }
            }
        }
        joined
    }

    /// Flag every session of this user on this auction as having bid.
    pub fn mark_bid(&self, auction_id: Uuid, user_id: Uuid) {
        let now = Utc::now();
        if let Some(room) = self.auctions.write().get_mut(&auction_id) {
            for presence in room.values_mut() {
                if presence.user_id == user_id {
                    presence.has_bid = true;
                    presence.last_activity = now;
                }
            }
        }
    }

    /// Refresh `last_activity` across all of the session's auctions.
    pub fn touch(&self, session_id: Uuid) {
        let now = Utc::now();
        let joined: Vec<Uuid> = self
            .sessions
            .read()
            .get(&session_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        let mut auctions = self.auctions.write();
        for auction_id in joined {
            if let Some(presence) = auctions
                .get_mut(&auction_id)
                .and_then(|room| room.get_mut(&session_id))
            {
                presence.last_activity = now;
            }
        }
    }

    /// Distinct users present on the auction.
    pub fn participant_count(&self, auction_id: Uuid) -> usize {
        self.counts(auction_id).participants
    }

    /// Distinct users that have bid on the auction.
    pub fn active_bidder_count(&self, auction_id: Uuid) -> usize {
        self.counts(auction_id).active_bidders
    }

    pub fn counts(&self, auction_id: Uuid) -> PresenceCounts {
        let auctions = self.auctions.read();
        let Some(room) = auctions.get(&auction_id) else {
            return PresenceCounts::default();
        };
        let mut users = HashSet::new();
        let mut bidders = HashSet::new();
        for presence in room.values() {
            users.insert(presence.user_id);
            if presence.has_bid {
                bidders.insert(presence.user_id);
            }
        }
        PresenceCounts {
            participants: users.len(),
            active_bidders: bidders.len(),
        }
    }

    /// All sessions on the auction.
    pub fn sessions_in(&self, auction_id: Uuid) -> Vec<Uuid> {
        self.auctions
            .read()
            .get(&auction_id)
            .map(|room| room.keys().copied().collect())
            .unwrap_or_default()
    }

    /// All of a user's sessions on the auction, for private echoes.
    pub fn sessions_for_user(&self, auction_id: Uuid, user_id: Uuid) -> Vec<Uuid> {
        self.auctions
            .read()
            .get(&auction_id)
            .map(|room| {
                room.iter()
                    .filter(|(_, p)| p.user_id == user_id)
                    .map(|(session_id, _)| *session_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the session is joined to the auction.
    pub fn is_joined(&self, auction_id: Uuid, session_id: Uuid) -> bool {
        self.auctions
            .read()
            .get(&auction_id)
            .map(|room| room.contains_key(&session_id))
            .unwrap_or(false)
    }
}
