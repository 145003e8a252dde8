//! Lifecycle Events
//!
//! In-process event payloads published on the event bus and fanned out to
//! sessions and the cross-node bus.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::auction::{Auction, Phase};
use super::bid::Bid;

/// Event bus topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Tick,
    Ending,
    Ended,
    Extended,
    BidPlaced,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tick => "auction.tick",
            Self::Ending => "auction.ending",
            Self::Ended => "auction.ended",
            Self::Extended => "auction.extended",
            Self::BidPlaced => "bid.placed.internal",
        }
    }

    pub fn all() -> [Topic; 5] {
        [
            Self::Tick,
            Self::Ending,
            Self::Ended,
            Self::Extended,
            Self::BidPlaced,
        ]
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 1 Hz countdown tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickEvent {
    pub auction_id: Uuid,
    pub remaining_ms: i64,
    pub server_time: DateTime<Utc>,
    pub phase: Phase,
    pub extension_count: i32,
}

/// Auction entered the ENDING window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndingEvent {
    pub auction_id: Uuid,
    pub ends_at: DateTime<Utc>,
    pub remaining_ms: i64,
}

/// Auction passed its deadline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndedEvent {
    pub auction_id: Uuid,
    pub winner_id: Option<Uuid>,
    pub winning_bid: Option<Decimal>,
    pub total_bids: i32,
    pub ended_at: DateTime<Utc>,
    pub reserve_met: bool,
}

impl EndedEvent {
    /// Winner summary for an auction that just passed its deadline. The
    /// highest bidder only wins when the reserve is met.
    pub fn from_auction(auction: &Auction, ended_at: DateTime<Utc>) -> Self {
        let has_winner = auction.current_highest_bidder_id.is_some() && auction.reserve_met();
        Self {
            auction_id: auction.id,
            winner_id: if has_winner {
                auction.current_highest_bidder_id
            } else {
                None
            },
            winning_bid: if has_winner {
                auction.current_highest_bid
            } else {
                None
            },
            total_bids: auction.bid_count,
            ended_at,
            reserve_met: auction.reserve_met(),
        }
    }

    /// Outcome label broadcast to sessions.
    pub fn sale_status(&self) -> &'static str {
        if self.winner_id.is_some() {
            "settled"
        } else {
            "no_sale"
        }
    }
}

/// Anti-sniping extension pushed `ends_at` out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendedEvent {
    pub auction_id: Uuid,
    pub new_ends_at: DateTime<Utc>,
    pub extension_count: i32,
}

/// Accepted bid, published after the transaction committed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidPlacedEvent {
    pub bid: Bid,
    pub auction: Auction,
    pub was_extended: bool,
    pub new_min_bid: Decimal,
    pub client_token: Option<String>,
}

/// Union of all lifecycle events carried by the in-process bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuctionEvent {
    Tick(TickEvent),
    Ending(EndingEvent),
    Ended(EndedEvent),
    Extended(ExtendedEvent),
    BidPlaced(BidPlacedEvent),
}

impl AuctionEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::Tick(_) => Topic::Tick,
            Self::Ending(_) => Topic::Ending,
            Self::Ended(_) => Topic::Ended,
            Self::Extended(_) => Topic::Extended,
            Self::BidPlaced(_) => Topic::BidPlaced,
        }
    }

    pub fn auction_id(&self) -> Uuid {
        match self {
            Self::Tick(e) => e.auction_id,
            Self::Ending(e) => e.auction_id,
            Self::Ended(e) => e.auction_id,
            Self::Extended(e) => e.auction_id,
            Self::BidPlaced(e) => e.auction.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::Tick.as_str(), "auction.tick");
        assert_eq!(Topic::BidPlaced.as_str(), "bid.placed.internal");
        assert_eq!(Topic::all().len(), 5);
    }

    #[test]
    fn test_sale_status() {
        let mut event = EndedEvent {
            auction_id: Uuid::now_v7(),
            winner_id: None,
            winning_bid: None,
            total_bids: 0,
            ended_at: Utc::now(),
            reserve_met: false,
        };
        assert_eq!(event.sale_status(), "no_sale");

        event.winner_id = Some(Uuid::now_v7());
        event.winning_bid = Some(dec!(250));
        assert_eq!(event.sale_status(), "settled");
    }
}
